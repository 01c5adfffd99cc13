//! Provider pool: rotation across free public blockchain APIs.
//!
//! Each chain gets an ordered set of providers. Every provider is paired
//! with a token-bucket rate limiter sized to its free-tier budget (burst 1,
//! so calls spread evenly) and a circuit breaker (3 consecutive failures to
//! open, 30s cooldown, single half-open probe).
//!
//! [`ProviderPool::execute`] walks the set round-robin from the current
//! pointer: open breakers are skipped, the limiter is awaited, and on a
//! transient failure the breaker is penalized and the pointer advances to
//! the next provider. Only when the whole set has failed does the caller see
//! an aggregated error. Client errors (4xx other than 429) short-circuit
//! without touching the breaker — they would fail identically everywhere.

pub mod breaker;
pub mod bsc;
pub mod btc;
pub mod sol;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{Chain, RawAmount, Token, UnixTimestamp};
use crate::store::{CircuitState, ProviderHealthRow, Store};
use breaker::CircuitBreaker;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A failure from a single provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429; the optional retry-after hint feeds backoff.
    #[error("{provider} rate limited us")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },
    /// 5xx, network timeout, connection failure.
    #[error("{provider} transient failure: {message}")]
    Transient { provider: String, message: String },
    /// 4xx other than 429, malformed input. Retrying elsewhere is pointless.
    #[error("{provider} rejected the request: {message}")]
    Client { provider: String, message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Client { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::RateLimited { provider, .. }
            | ProviderError::Transient { provider, .. }
            | ProviderError::Client { provider, .. } => provider,
        }
    }
}

/// Failure of a whole pool call.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every provider in the set was either open or failed.
    #[error("all {chain} providers failed: {summary}")]
    Exhausted { chain: Chain, summary: String },
    /// A client-fatal error; surfaced without rotation.
    #[error(transparent)]
    Client(ProviderError),
}

/// Per-address balance results from one provider batch.
///
/// A provider may resolve some addresses and fail others; the successes are
/// kept and only `failed` is retried on the next provider.
#[derive(Clone, Debug, Default)]
pub struct BalanceBatch {
    pub balances: HashMap<String, RawAmount>,
    pub failed: Vec<String>,
}

/// An inbound transaction observed by a watch provider.
#[derive(Clone, Debug)]
pub struct IncomingTx {
    /// Chain tx hash; for SOL this is `signature:TOKEN` because one
    /// signature can carry both native and token flows.
    pub tx_hash: String,
    pub token: Token,
    pub amount: RawAmount,
    pub from_addr: String,
    pub to_addr: String,
    pub block_number: Option<i64>,
    pub block_time: Option<UnixTimestamp>,
    /// Already at the chain's confirmation threshold.
    pub confirmed: bool,
}

/// Identity and budget of a provider.
pub trait ProviderMeta: Send + Sync {
    fn name(&self) -> &'static str;
    fn chain(&self) -> Chain;
    /// Free-tier budget, requests per minute. Drives the token bucket.
    fn rate_limit_per_minute(&self) -> u32;
    /// Largest address batch a single call should carry.
    fn max_batch_size(&self) -> usize;
}

/// Balance-capable provider, used by the scanner.
#[async_trait::async_trait]
pub trait BalanceProvider: ProviderMeta {
    async fn get_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, ProviderError>;
}

/// Inbound-transaction provider, used by the poller.
#[async_trait::async_trait]
pub trait WatchProvider: ProviderMeta {
    async fn incoming_since(
        &self,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, ProviderError>;
}

struct ProviderSlot<P> {
    provider: Arc<P>,
    limiter: DirectLimiter,
    breaker: CircuitBreaker,
    last_reported: Mutex<Option<(CircuitState, u32)>>,
}

/// Round-robin pool over one chain's providers.
pub struct ProviderPool<P> {
    chain: Chain,
    slots: Vec<ProviderSlot<P>>,
    cursor: AtomicUsize,
    store: Option<Store>,
}

impl<P: ProviderMeta + 'static> ProviderPool<P> {
    /// Builds the pool. `store` enables asynchronous provider-health rows;
    /// pass `None` in tests.
    pub fn new(chain: Chain, providers: Vec<P>, store: Option<Store>) -> Self {
        let slots = providers
            .into_iter()
            .map(|p| {
                let rpm = p.rate_limit_per_minute().max(1);
                let period = Duration::from_millis((60_000 / rpm as u64).max(1));
                let quota = Quota::with_period(period)
                    .expect("non-zero period")
                    .allow_burst(NonZeroU32::new(1).expect("burst of one"));
                ProviderSlot {
                    provider: Arc::new(p),
                    limiter: RateLimiter::direct(quota),
                    breaker: CircuitBreaker::default(),
                    last_reported: Mutex::new(None),
                }
            })
            .collect();
        Self {
            chain,
            slots,
            cursor: AtomicUsize::new(0),
            store,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Batch size of the provider currently at the pointer.
    pub fn max_batch_size(&self) -> usize {
        let idx = self.cursor.load(Ordering::Relaxed) % self.slots.len().max(1);
        self.slots
            .get(idx)
            .map(|s| s.provider.max_batch_size())
            .unwrap_or(1)
    }

    fn advance_from(&self, idx: usize) {
        let next = (idx + 1) % self.slots.len();
        self.cursor.store(next, Ordering::Relaxed);
    }

    /// Runs `f` against providers in round-robin order starting at the
    /// current pointer until one succeeds or the set is exhausted.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.slots.is_empty() {
            return Err(PoolError::Exhausted {
                chain: self.chain,
                summary: "no providers configured".to_string(),
            });
        }
        let start = self.cursor.load(Ordering::Relaxed) % self.slots.len();
        let mut failures: Vec<String> = Vec::new();
        for offset in 0..self.slots.len() {
            let idx = (start + offset) % self.slots.len();
            let slot = &self.slots[idx];
            if !slot.breaker.try_acquire() {
                failures.push(format!("{}: circuit open", slot.provider.name()));
                continue;
            }
            slot.limiter.until_ready().await;
            match f(slot.provider.clone()).await {
                Ok(value) => {
                    slot.breaker.record_success();
                    self.report_health(slot);
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        chain = %self.chain,
                        provider = slot.provider.name(),
                        error = %e,
                        "provider call failed, rotating"
                    );
                    slot.breaker.record_failure();
                    self.report_health(slot);
                    self.advance_from(idx);
                    failures.push(e.to_string());
                }
                Err(client) => return Err(PoolError::Client(client)),
            }
        }
        Err(PoolError::Exhausted {
            chain: self.chain,
            summary: failures.join("; "),
        })
    }

    /// Writes a provider-health row when the breaker's observable state
    /// changed, without blocking the caller.
    fn report_health(&self, slot: &ProviderSlot<P>) {
        let Some(store) = &self.store else { return };
        let snapshot = slot.breaker.snapshot();
        let current = (snapshot.state, snapshot.consecutive_failures);
        {
            let mut last = slot.last_reported.lock().expect("health lock");
            if *last == Some(current) {
                return;
            }
            *last = Some(current);
        }
        let row = ProviderHealthRow {
            provider: slot.provider.name().to_string(),
            chain: self.chain,
            circuit_state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures as i64,
            last_success_at: snapshot.last_success_at,
            last_failure_at: snapshot.last_failure_at,
            status: snapshot.provider_status(),
        };
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.upsert_provider_health(&row).await {
                tracing::warn!(error = %e, "failed to persist provider health");
            }
        });
    }

    /// Breaker snapshots for the health endpoint, freshest view.
    pub fn health(&self) -> Vec<ProviderHealthRow> {
        self.slots
            .iter()
            .map(|slot| {
                let snapshot = slot.breaker.snapshot();
                ProviderHealthRow {
                    provider: slot.provider.name().to_string(),
                    chain: self.chain,
                    circuit_state: snapshot.state,
                    consecutive_failures: snapshot.consecutive_failures as i64,
                    last_success_at: snapshot.last_success_at,
                    last_failure_at: snapshot.last_failure_at,
                    status: snapshot.provider_status(),
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub fn breaker_snapshot(&self, name: &str) -> Option<breaker::BreakerSnapshot> {
        self.slots
            .iter()
            .find(|s| s.provider.name() == name)
            .map(|s| s.breaker.snapshot())
    }
}

impl<P: BalanceProvider + 'static> ProviderPool<P> {
    /// Fetches balances for a set of addresses, retrying per-address partial
    /// failures on the next provider. Successes are never re-fetched.
    ///
    /// Addresses still unresolved after a full extra rotation are returned in
    /// `failed` for the scanner's batch error set.
    pub async fn fetch_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, PoolError> {
        let mut merged: HashMap<String, RawAmount> = HashMap::new();
        let mut remaining: Vec<String> = addresses.to_vec();
        for _round in 0..=self.slots.len() {
            if remaining.is_empty() {
                break;
            }
            let addrs = remaining.clone();
            let batch = self
                .execute(move |p| {
                    let addrs = addrs.clone();
                    async move { p.get_balances(&addrs, token).await }
                })
                .await?;
            merged.extend(batch.balances);
            if batch.failed.is_empty() {
                remaining.clear();
                break;
            }
            // Partial result: push the pointer so the retry lands elsewhere.
            let idx = self.cursor.load(Ordering::Relaxed) % self.slots.len();
            self.advance_from(idx);
            remaining = batch.failed;
        }
        Ok(BalanceBatch {
            balances: merged,
            failed: remaining,
        })
    }
}

/// Chain-agnostic view of a balance pool, for the scanner.
#[async_trait::async_trait]
pub trait ScanBackend: Send + Sync {
    fn chain(&self) -> Chain;
    fn max_batch_size(&self) -> usize;
    async fn fetch_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, PoolError>;
    fn health(&self) -> Vec<ProviderHealthRow>;
}

#[async_trait::async_trait]
impl<P: BalanceProvider + 'static> ScanBackend for ProviderPool<P> {
    fn chain(&self) -> Chain {
        ProviderPool::chain(self)
    }

    fn max_batch_size(&self) -> usize {
        ProviderPool::max_batch_size(self)
    }

    async fn fetch_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, PoolError> {
        ProviderPool::fetch_balances(self, addresses, token).await
    }

    fn health(&self) -> Vec<ProviderHealthRow> {
        ProviderPool::health(self)
    }
}

impl<P: WatchProvider + 'static> ProviderPool<P> {
    pub async fn incoming_since(
        &self,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, PoolError> {
        let address = address.to_string();
        self.execute(move |p| {
            let address = address.clone();
            async move { p.incoming_since(&address, cutoff).await }
        })
        .await
    }
}

// ----------------------------------------------------------------------
// Shared HTTP error classification
// ----------------------------------------------------------------------

/// Maps a reqwest transport error onto the taxonomy: timeouts and connection
/// failures are transient, anything else opaque is too.
pub(crate) fn classify_transport(provider: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        provider: provider.to_string(),
        message: err.to_string(),
    }
}

/// Maps a non-success HTTP status onto the taxonomy.
pub(crate) fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        }
    } else if status.is_server_error() {
        ProviderError::Transient {
            provider: provider.to_string(),
            message: format!("{status}: {body}"),
        }
    } else {
        ProviderError::Client {
            provider: provider.to_string(),
            message: format!("{status}: {body}"),
        }
    }
}

pub(crate) fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Scriptable provider double: a list of per-call outcomes.
    struct FakeProvider {
        name: &'static str,
        calls: AtomicU32,
        outcomes: Vec<FakeOutcome>,
    }

    #[derive(Clone)]
    enum FakeOutcome {
        Ok(Vec<(&'static str, u64)>),
        Partial(Vec<(&'static str, u64)>, Vec<&'static str>),
        Transient,
        Clientside,
    }

    impl FakeProvider {
        fn new(name: &'static str, outcomes: Vec<FakeOutcome>) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                outcomes,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl ProviderMeta for FakeProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn chain(&self) -> Chain {
            Chain::Bsc
        }
        fn rate_limit_per_minute(&self) -> u32 {
            60_000
        }
        fn max_batch_size(&self) -> usize {
            50
        }
    }

    #[async_trait::async_trait]
    impl BalanceProvider for FakeProvider {
        async fn get_balances(
            &self,
            addresses: &[String],
            _token: Token,
        ) -> Result<BalanceBatch, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed) as usize;
            let outcome = self
                .outcomes
                .get(n.min(self.outcomes.len().saturating_sub(1)))
                .cloned()
                .unwrap_or(FakeOutcome::Transient);
            match outcome {
                FakeOutcome::Ok(pairs) => Ok(BalanceBatch {
                    balances: pairs
                        .into_iter()
                        .filter(|(a, _)| addresses.iter().any(|x| x == a))
                        .map(|(a, v)| (a.to_string(), RawAmount::from_u64(v)))
                        .collect(),
                    failed: vec![],
                }),
                FakeOutcome::Partial(pairs, failed) => Ok(BalanceBatch {
                    balances: pairs
                        .into_iter()
                        .map(|(a, v)| (a.to_string(), RawAmount::from_u64(v)))
                        .collect(),
                    failed: failed.into_iter().map(String::from).collect(),
                }),
                FakeOutcome::Transient => Err(ProviderError::Transient {
                    provider: self.name.to_string(),
                    message: "boom".to_string(),
                }),
                FakeOutcome::Clientside => Err(ProviderError::Client {
                    provider: self.name.to_string(),
                    message: "bad address".to_string(),
                }),
            }
        }
    }

    fn addr(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn rotation_returns_second_provider_result() {
        let pool = ProviderPool::new(
            Chain::Bsc,
            vec![
                FakeProvider::new("first", vec![FakeOutcome::Transient]),
                FakeProvider::new("second", vec![FakeOutcome::Ok(vec![("addrA", 100)])]),
            ],
            None,
        );
        let batch = pool
            .fetch_balances(&[addr("addrA")], Token::Native)
            .await
            .unwrap();
        assert_eq!(
            batch.balances.get("addrA"),
            Some(&RawAmount::from_u64(100))
        );
        assert!(batch.failed.is_empty());
        let snapshot = pool.breaker_snapshot("first").unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_failing_provider() {
        let first = FakeProvider::new("first", vec![FakeOutcome::Transient]);
        let second = FakeProvider::new("second", vec![FakeOutcome::Ok(vec![("a", 1)])]);
        let pool = ProviderPool::new(Chain::Bsc, vec![first, second], None);

        // Three failing rounds open the first provider's breaker. The pool
        // pointer also advances to the second provider, so force it back to
        // prove the skip is breaker-driven.
        for _ in 0..3 {
            pool.cursor.store(0, Ordering::Relaxed);
            pool.fetch_balances(&[addr("a")], Token::Native)
                .await
                .unwrap();
        }
        assert_eq!(
            pool.breaker_snapshot("first").unwrap().state,
            CircuitState::Open
        );

        pool.cursor.store(0, Ordering::Relaxed);
        let calls_before = pool.slots[0].provider.call_count();
        pool.fetch_balances(&[addr("a")], Token::Native)
            .await
            .unwrap();
        // Open breaker: the first provider was not called again.
        assert_eq!(pool.slots[0].provider.call_count(), calls_before);
    }

    #[tokio::test]
    async fn partial_results_retry_only_unresolved_addresses() {
        let pool = ProviderPool::new(
            Chain::Bsc,
            vec![
                FakeProvider::new(
                    "first",
                    vec![FakeOutcome::Partial(vec![("a", 100)], vec!["b"])],
                ),
                FakeProvider::new("second", vec![FakeOutcome::Ok(vec![("b", 50)])]),
            ],
            None,
        );
        let batch = pool
            .fetch_balances(&[addr("a"), addr("b")], Token::Native)
            .await
            .unwrap();
        assert_eq!(batch.balances.get("a"), Some(&RawAmount::from_u64(100)));
        assert_eq!(batch.balances.get("b"), Some(&RawAmount::from_u64(50)));
        assert!(batch.failed.is_empty());
        // The second provider only ever saw address "b".
        assert_eq!(pool.slots[1].provider.call_count(), 1);
    }

    #[tokio::test]
    async fn client_errors_bypass_rotation_and_breaker() {
        let pool = ProviderPool::new(
            Chain::Bsc,
            vec![
                FakeProvider::new("first", vec![FakeOutcome::Clientside]),
                FakeProvider::new("second", vec![FakeOutcome::Ok(vec![("a", 1)])]),
            ],
            None,
        );
        let err = pool
            .fetch_balances(&[addr("a")], Token::Native)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Client(_)));
        assert_eq!(
            pool.breaker_snapshot("first").unwrap().consecutive_failures,
            0
        );
        assert_eq!(pool.slots[1].provider.call_count(), 0);
    }

    #[tokio::test]
    async fn exhaustion_aggregates_every_failure() {
        let pool = ProviderPool::new(
            Chain::Bsc,
            vec![
                FakeProvider::new("first", vec![FakeOutcome::Transient]),
                FakeProvider::new("second", vec![FakeOutcome::Transient]),
            ],
            None,
        );
        let err = pool
            .execute(|p| async move { p.get_balances(&[addr("a")], Token::Native).await })
            .await
            .unwrap_err();
        match err {
            PoolError::Exhausted { summary, .. } => {
                assert!(summary.contains("first"));
                assert!(summary.contains("second"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
