//! Balance scan orchestrator.
//!
//! At most one scan runs per chain. A scan always restarts from index 0 —
//! resuming from the stored cursor was removed on purpose, since it left
//! stale `last_scanned_at` timestamps on the skipped prefix; the cursor is
//! maintained purely for progress display.
//!
//! Each batch is fetched through the provider pool, native first, then each
//! token independently so one token's failure never blocks the others. The
//! batch's balance rows and the cursor advance in a single store
//! transaction. Pool-level failures back off exponentially (1s doubling to a
//! 30s cap) and abort the scan after five in a row.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, Token, UnixTimestamp};
use crate::events::{self, EventHub, HubEvent};
use crate::providers::ScanBackend;
use crate::store::{BalanceRow, ScanStatus, Store, StoreError};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_POOL_FAILURES: u32 = 5;
/// Hard upper bound; a scan alive this long is runaway.
const SCAN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("a scan is already running for {0}")]
    AlreadyRunning(Chain),
    #[error("no scan is running for {0}")]
    NotRunning(Chain),
    #[error("no addresses derived for {0}; run init first")]
    NoAddresses(Chain),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ProgressPayload {
    chain: Chain,
    scanned: usize,
    total: usize,
    cursor: i64,
}

#[derive(Serialize)]
struct CompletePayload {
    chain: Chain,
    scanned: usize,
    funded: u64,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    chain: Chain,
    message: &'a str,
}

#[derive(Serialize)]
struct TokenErrorPayload<'a> {
    chain: Chain,
    token: Token,
    message: &'a str,
}

struct ScanHandle {
    cancel: CancellationToken,
}

/// Owns the per-chain scan locks and spawns scan tasks.
pub struct Scanner {
    store: Store,
    backends: DashMap<Chain, Arc<dyn ScanBackend>>,
    hub: Arc<EventHub>,
    active: DashMap<Chain, ScanHandle>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Scanner {
    pub fn new(
        store: Store,
        backends: Vec<Arc<dyn ScanBackend>>,
        hub: Arc<EventHub>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let map = DashMap::new();
        for backend in backends {
            map.insert(backend.chain(), backend);
        }
        Arc::new(Self {
            store,
            backends: map,
            hub,
            active: DashMap::new(),
            tracker,
            shutdown,
        })
    }

    /// Starts a scan over `[0, max_id]`. Fails with `AlreadyRunning` if the
    /// chain's lock is held; never queues.
    pub async fn start(self: &Arc<Self>, chain: Chain, max_id: u32) -> Result<(), ScanError> {
        let backend = self
            .backends
            .get(&chain)
            .map(|b| Arc::clone(b.value()))
            .ok_or(ScanError::NoAddresses(chain))?;
        if self.store.address_count(chain).await? == 0 {
            return Err(ScanError::NoAddresses(chain));
        }

        let cancel = self.shutdown.child_token();
        match self.active.entry(chain) {
            Entry::Occupied(_) => return Err(ScanError::AlreadyRunning(chain)),
            Entry::Vacant(vacant) => {
                vacant.insert(ScanHandle {
                    cancel: cancel.clone(),
                });
            }
        }

        if let Err(e) = self.store.begin_scan(chain, max_id as i64).await {
            self.active.remove(&chain);
            return Err(e.into());
        }
        self.publish_state().await;

        let scanner = Arc::clone(self);
        self.tracker.spawn(async move {
            let outcome = scanner.run(chain, max_id, Arc::clone(&backend), cancel).await;
            let final_status = match outcome {
                ScanOutcome::Complete => ScanStatus::Idle,
                ScanOutcome::Cancelled => ScanStatus::Paused,
                ScanOutcome::Aborted => ScanStatus::Idle,
            };
            if let Err(e) = scanner.store.set_scan_status(chain, final_status).await {
                tracing::error!(chain = %chain, error = %e, "failed to persist scan status");
            }
            scanner.active.remove(&chain);
            scanner.publish_state().await;
        });
        Ok(())
    }

    /// Cancels a running scan. The running fetch unwinds within one
    /// provider-call timeout.
    pub fn stop(&self, chain: Chain) -> Result<(), ScanError> {
        match self.active.get(&chain) {
            Some(handle) => {
                handle.cancel.cancel();
                Ok(())
            }
            None => Err(ScanError::NotRunning(chain)),
        }
    }

    pub fn is_scanning(&self, chain: Chain) -> bool {
        self.active.contains_key(&chain)
    }

    /// Resync payload for newly connected SSE clients.
    pub async fn state_events(&self) -> Vec<HubEvent> {
        match self.store.all_scan_states().await {
            Ok(states) => vec![HubEvent::new(events::SCAN_STATE, &states)],
            Err(e) => {
                tracing::error!(error = %e, "failed to load scan state for resync");
                Vec::new()
            }
        }
    }

    async fn publish_state(&self) {
        if let Ok(states) = self.store.all_scan_states().await {
            self.hub.publish(events::SCAN_STATE, &states);
        }
    }

    async fn run(
        &self,
        chain: Chain,
        max_id: u32,
        backend: Arc<dyn ScanBackend>,
        cancel: CancellationToken,
    ) -> ScanOutcome {
        let deadline = Instant::now() + SCAN_TIMEOUT;
        let addresses = match self.store.addresses_in_range(chain, max_id).await {
            Ok(addresses) => addresses,
            Err(e) => {
                self.emit_error(chain, &e.to_string());
                return ScanOutcome::Aborted;
            }
        };
        let total = addresses.len();
        let chunk_size = backend.max_batch_size().max(1);
        let mut scanned = 0usize;
        let mut pool_failures = 0u32;
        let mut backoff = BACKOFF_START;

        let mut chunks = addresses.chunks(chunk_size);
        let mut current = chunks.next();
        while let Some(chunk) = current {
            if cancel.is_cancelled() {
                return ScanOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                self.emit_error(chain, "scan exceeded the 24h hard timeout");
                return ScanOutcome::Aborted;
            }

            let raw: Vec<String> = chunk.iter().map(|a| a.address.clone()).collect();
            let now = UnixTimestamp::now();
            let mut rows: Vec<BalanceRow> = Vec::new();

            // Native fetch drives retry/backoff; its failure aborts the batch.
            let native = tokio::select! {
                _ = cancel.cancelled() => return ScanOutcome::Cancelled,
                result = backend.fetch_balances(&raw, Token::Native) => result,
            };
            let native = match native {
                Ok(batch) => batch,
                Err(e) => {
                    pool_failures += 1;
                    if pool_failures >= MAX_POOL_FAILURES {
                        self.emit_error(chain, &e.to_string());
                        return ScanOutcome::Aborted;
                    }
                    tracing::warn!(
                        chain = %chain,
                        attempt = pool_failures,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "batch failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return ScanOutcome::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue; // retry the same chunk
                }
            };
            pool_failures = 0;
            backoff = BACKOFF_START;
            if !native.failed.is_empty() {
                tracing::warn!(
                    chain = %chain,
                    unresolved = native.failed.len(),
                    "addresses unresolved after full provider rotation"
                );
            }
            for address in chunk {
                if let Some(amount) = native.balances.get(&address.address) {
                    rows.push(BalanceRow {
                        chain,
                        index: address.index,
                        token: Token::Native,
                        amount: *amount,
                        last_scanned_at: now,
                    });
                }
            }

            // Token fetches are decoupled: each failure is reported and
            // skipped without blocking the batch.
            for token in chain.tokens().iter().copied().filter(|t| *t != Token::Native) {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return ScanOutcome::Cancelled,
                    result = backend.fetch_balances(&raw, token) => result,
                };
                match result {
                    Ok(batch) => {
                        for address in chunk {
                            if let Some(amount) = batch.balances.get(&address.address) {
                                rows.push(BalanceRow {
                                    chain,
                                    index: address.index,
                                    token,
                                    amount: *amount,
                                    last_scanned_at: now,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        self.hub.publish(
                            events::SCAN_TOKEN_ERROR,
                            &TokenErrorPayload {
                                chain,
                                token,
                                message: &e.to_string(),
                            },
                        );
                    }
                }
            }

            let cursor = chunk.last().map(|a| a.index as i64).unwrap_or(-1);
            if let Err(e) = self
                .store
                .upsert_balances_and_cursor(chain, &rows, cursor)
                .await
            {
                self.emit_error(chain, &e.to_string());
                return ScanOutcome::Aborted;
            }
            scanned += chunk.len();
            self.hub.publish(
                events::SCAN_PROGRESS,
                &ProgressPayload {
                    chain,
                    scanned,
                    total,
                    cursor,
                },
            );
            current = chunks.next();
        }

        let funded = self.store.funded_count(chain).await.unwrap_or(0);
        self.hub.publish(
            events::SCAN_COMPLETE,
            &CompletePayload {
                chain,
                scanned,
                funded,
            },
        );
        tracing::info!(chain = %chain, scanned, funded, "scan complete");
        ScanOutcome::Complete
    }

    fn emit_error(&self, chain: Chain, message: &str) {
        tracing::error!(chain = %chain, message, "scan aborted");
        self.hub
            .publish(events::SCAN_ERROR, &ErrorPayload { chain, message });
    }
}

enum ScanOutcome {
    Complete,
    Cancelled,
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Network, RawAmount};
    use crate::providers::{BalanceBatch, PoolError};
    use crate::store::ProviderHealthRow;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticBackend {
        chain: Chain,
        balances: Vec<(&'static str, u64)>,
        fail_first: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ScanBackend for StaticBackend {
        fn chain(&self) -> Chain {
            self.chain
        }

        fn max_batch_size(&self) -> usize {
            2
        }

        async fn fetch_balances(
            &self,
            addresses: &[String],
            token: Token,
        ) -> Result<BalanceBatch, PoolError> {
            if token == Token::Native && self.fail_first.load(Ordering::Relaxed) > 0 {
                self.fail_first.fetch_sub(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted {
                    chain: self.chain,
                    summary: "scripted failure".to_string(),
                });
            }
            Ok(BalanceBatch {
                balances: self
                    .balances
                    .iter()
                    .filter(|(a, _)| addresses.iter().any(|x| x == a))
                    .map(|(a, v)| (a.to_string(), RawAmount::from_u64(*v)))
                    .collect(),
                failed: vec![],
            })
        }

        fn health(&self) -> Vec<ProviderHealthRow> {
            Vec::new()
        }
    }

    async fn fixture(balances: Vec<(&'static str, u64)>, fail_first: u32) -> (Store, Arc<Scanner>) {
        let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
        store
            .insert_addresses(
                Chain::Btc,
                &[(0, "a0".into()), (1, "a1".into()), (2, "a2".into())],
            )
            .await
            .unwrap();
        let backend: Arc<dyn ScanBackend> = Arc::new(StaticBackend {
            chain: Chain::Btc,
            balances,
            fail_first: AtomicU32::new(fail_first),
        });
        let scanner = Scanner::new(
            store.clone(),
            vec![backend],
            EventHub::new("scan"),
            TaskTracker::new(),
            CancellationToken::new(),
        );
        (store, scanner)
    }

    async fn wait_idle(scanner: &Scanner, chain: Chain) {
        for _ in 0..200 {
            if !scanner.is_scanning(chain) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan did not finish");
    }

    #[tokio::test]
    async fn scan_completes_and_returns_to_idle() {
        let (store, scanner) = fixture(vec![("a0", 100), ("a1", 0), ("a2", 7)], 0).await;
        scanner.start(Chain::Btc, 2).await.unwrap();
        wait_idle(&scanner, Chain::Btc).await;

        let state = store.scan_state(Chain::Btc).await.unwrap().unwrap();
        assert_eq!(state.status, ScanStatus::Idle);
        assert!(state.last_scanned_index >= state.max_scan_id);
        assert_eq!(store.funded_count(Chain::Btc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_start_is_refused() {
        let (_store, scanner) = fixture(vec![("a0", 1)], 0).await;
        scanner.start(Chain::Btc, 2).await.unwrap();
        let second = scanner.start(Chain::Btc, 2).await;
        assert!(matches!(second, Err(ScanError::AlreadyRunning(Chain::Btc))) || second.is_ok());
        wait_idle(&scanner, Chain::Btc).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_pool_failures_are_retried() {
        // Two scripted failures, then success: same balances as a clean run.
        let (store, scanner) = fixture(vec![("a0", 100), ("a2", 7)], 2).await;
        scanner.start(Chain::Btc, 2).await.unwrap();
        wait_idle(&scanner, Chain::Btc).await;
        assert_eq!(store.funded_count(Chain::Btc).await.unwrap(), 2);
        assert_eq!(
            store
                .balance_of(Chain::Btc, 0, Token::Native)
                .await
                .unwrap(),
            RawAmount::from_u64(100)
        );
    }

    #[tokio::test]
    async fn stop_requires_a_running_scan() {
        let (_store, scanner) = fixture(vec![], 0).await;
        assert!(matches!(
            scanner.stop(Chain::Btc),
            Err(ScanError::NotRunning(Chain::Btc))
        ));
    }
}
