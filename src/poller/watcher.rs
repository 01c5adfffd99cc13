//! Per-address watch loops.
//!
//! Each watch owns a dedicated task derived from the shutdown context. A
//! tick queries the chain-specific provider for inbound transactions since
//! the cutoff (the later of the last recorded transaction for the address
//! and the global start date), dedups against stored transactions, inserts
//! detections below the confirmation threshold as PENDING, and credits
//! confirmed ones through the tier schedule. Provider failures never stop a
//! loop — they land in the system-error ledger and the next tick retries.

use dashmap::DashMap;
use rand::RngCore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, Network, UnixTimestamp};
use crate::providers::bsc::BscScanProvider;
use crate::providers::btc::EsploraProvider;
use crate::providers::sol::SolRpcProvider;
use crate::providers::{IncomingTx, ProviderPool};
use crate::store::{
    Direction, Store, StoreError, TxRecord, TxStatus, WatchRow, WatchStatus,
};

use super::price::PriceService;
use super::tiers::TierSchedule;

/// Default watch lifetime when the request does not set one.
const DEFAULT_WATCH_SECS: i64 = 2 * 60 * 60;
const MAX_WATCH_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid {chain} address: {address}")]
    InvalidAddress { chain: Chain, address: String },
    #[error("address is already being watched")]
    AlreadyWatched,
    #[error("watch {0} not found")]
    NotFound(String),
    #[error("watch {0} is already terminal")]
    AlreadyTerminal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chain-format validity, as a single boolean check.
pub fn address_is_valid(chain: Chain, network: Network, address: &str) -> bool {
    match chain {
        Chain::Btc => bitcoin::Address::from_str(address)
            .map(|a| a.is_valid_for_network(network.btc_network()))
            .unwrap_or(false),
        Chain::Bsc => alloy_primitives::Address::from_str(address).is_ok(),
        Chain::Sol => solana_pubkey::Pubkey::from_str(address).is_ok(),
    }
}

pub struct Watcher {
    store: Store,
    tiers: TierSchedule,
    price: Arc<PriceService>,
    btc: Arc<ProviderPool<EsploraProvider>>,
    bsc: Arc<ProviderPool<BscScanProvider>>,
    sol: Arc<ProviderPool<SolRpcProvider>>,
    network: Network,
    start_date: Option<UnixTimestamp>,
    active: DashMap<String, CancellationToken>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        tiers: TierSchedule,
        price: Arc<PriceService>,
        btc: Arc<ProviderPool<EsploraProvider>>,
        bsc: Arc<ProviderPool<BscScanProvider>>,
        sol: Arc<ProviderPool<SolRpcProvider>>,
        network: Network,
        start_date: Option<UnixTimestamp>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tiers,
            price,
            btc,
            bsc,
            sol,
            network,
            start_date,
            active: DashMap::new(),
            tracker,
            shutdown,
        })
    }

    /// Creates a watch and starts its loop. Only one non-terminal watch may
    /// exist per (chain, address); terminal watches are never resurrected —
    /// the caller creates a new one.
    pub async fn create(
        self: &Arc<Self>,
        chain: Chain,
        address: String,
        duration_secs: Option<i64>,
    ) -> Result<WatchRow, WatchError> {
        if !address_is_valid(chain, self.network, &address) {
            return Err(WatchError::InvalidAddress { chain, address });
        }
        if self.store.has_active_watch(chain, &address).await? {
            return Err(WatchError::AlreadyWatched);
        }
        let now = UnixTimestamp::now();
        let duration = duration_secs
            .unwrap_or(DEFAULT_WATCH_SECS)
            .clamp(60, MAX_WATCH_SECS);
        let row = WatchRow {
            watch_id: new_watch_id(),
            chain,
            address,
            status: WatchStatus::Active,
            started_at: now,
            expires_at: UnixTimestamp(now.0 + duration),
            completed_at: None,
            poll_count: 0,
            last_poll_at: None,
            last_poll_result: None,
        };
        self.store.insert_watch(&row).await?;
        self.spawn_loop(row.clone());
        Ok(row)
    }

    /// External cancellation; the loop finishes the row as CANCELLED.
    pub async fn cancel(&self, watch_id: &str) -> Result<(), WatchError> {
        let row = self
            .store
            .watch_by_id(watch_id)
            .await?
            .ok_or_else(|| WatchError::NotFound(watch_id.to_string()))?;
        if row.status.is_terminal() {
            return Err(WatchError::AlreadyTerminal(watch_id.to_string()));
        }
        match self.active.get(watch_id) {
            Some(token) => token.cancel(),
            // No loop (e.g. created before a restart that did not resume it);
            // finish the row directly.
            None => self.store.finish_watch(watch_id, WatchStatus::Cancelled).await?,
        }
        Ok(())
    }

    /// Re-launches loops for watches that were active at shutdown.
    pub async fn resume_active(self: &Arc<Self>) -> Result<usize, WatchError> {
        let rows = self.store.watches(true).await?;
        let count = rows.len();
        for row in rows {
            self.spawn_loop(row);
        }
        if count > 0 {
            tracing::info!(count, "resumed active watches");
        }
        Ok(count)
    }

    fn spawn_loop(self: &Arc<Self>, row: WatchRow) {
        let cancel = self.shutdown.child_token();
        self.active.insert(row.watch_id.clone(), cancel.clone());
        let watcher = Arc::clone(self);
        self.tracker.spawn(async move {
            let watch_id = row.watch_id.clone();
            let status = watcher.run_loop(row, cancel).await;
            watcher.active.remove(&watch_id);
            if let Some(status) = status {
                if let Err(e) = watcher.store.finish_watch(&watch_id, status).await {
                    tracing::error!(watch_id, error = %e, "failed to finish watch");
                }
            }
        });
    }

    /// The loop body. Returns the terminal status to persist, or `None` on
    /// process shutdown (the watch stays active for the next boot).
    async fn run_loop(&self, row: WatchRow, cancel: CancellationToken) -> Option<WatchStatus> {
        let interval = Duration::from_secs(row.chain.poll_interval_secs());
        let mut confirmed_any = false;
        tracing::info!(
            watch_id = row.watch_id,
            chain = %row.chain,
            address = row.address,
            "watch loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        return None;
                    }
                    return Some(WatchStatus::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if UnixTimestamp::now() >= row.expires_at {
                return Some(WatchStatus::Expired);
            }

            match self.tick(&row, &mut confirmed_any).await {
                Ok(done) => {
                    if done {
                        return Some(WatchStatus::Completed);
                    }
                }
                Err(e) => {
                    // Provider failures never stop the loop.
                    tracing::warn!(watch_id = row.watch_id, error = %e, "watch tick failed");
                    let _ = self
                        .store
                        .log_system_error(&format!("watch:{}", row.watch_id), &e.to_string())
                        .await;
                    let _ = self
                        .store
                        .touch_watch(&row.watch_id, &format!("error: {e}"))
                        .await;
                }
            }
        }
    }

    /// One poll: fetch, dedup, credit. Returns `true` when the watch is
    /// complete (at least one confirmation and nothing pending).
    async fn tick(&self, row: &WatchRow, confirmed_any: &mut bool) -> Result<bool, String> {
        let pending_before = self
            .store
            .pending_incoming(row.chain, &row.address)
            .await
            .map_err(|e| e.to_string())?;

        // Cutoff: the later of last recorded tx time and the global start
        // date — lowered when pending rows need their confirmations
        // re-checked.
        let last_recorded = self
            .store
            .latest_incoming_time(row.chain, &row.address)
            .await
            .map_err(|e| e.to_string())?;
        let mut cutoff = UnixTimestamp(
            last_recorded
                .map(|t| t.0)
                .unwrap_or(0)
                .max(self.start_date.map(|t| t.0).unwrap_or(0)),
        );
        if let Some(oldest_pending) = pending_before
            .iter()
            .filter_map(|p| p.block_time)
            .min()
        {
            cutoff = UnixTimestamp(cutoff.0.min(oldest_pending.0 - 1));
        }
        if !pending_before.is_empty() {
            // Mempool detections carry no block time yet; re-see everything.
            if pending_before.iter().any(|p| p.block_time.is_none()) {
                cutoff = UnixTimestamp(self.start_date.map(|t| t.0).unwrap_or(0));
            }
        }

        let incoming = self
            .incoming_since(row.chain, &row.address, cutoff)
            .await
            .map_err(|e| e.to_string())?;

        let mut new_pending = 0usize;
        let mut newly_confirmed = 0usize;
        for tx in incoming {
            match self.absorb(row, &tx).await {
                Ok(Absorbed::Pending) => new_pending += 1,
                Ok(Absorbed::Confirmed) => {
                    newly_confirmed += 1;
                    *confirmed_any = true;
                }
                Ok(Absorbed::Known) => {}
                Err(e) => {
                    tracing::warn!(watch_id = row.watch_id, tx = tx.tx_hash, error = %e, "absorb failed");
                    let _ = self
                        .store
                        .log_system_error(&format!("watch:{}", row.watch_id), &e)
                        .await;
                }
            }
        }

        let pending_after = self
            .store
            .pending_incoming(row.chain, &row.address)
            .await
            .map_err(|e| e.to_string())?;
        let _ = self
            .store
            .touch_watch(
                &row.watch_id,
                &format!(
                    "pending={} new={} confirmed={}",
                    pending_after.len(),
                    new_pending,
                    newly_confirmed
                ),
            )
            .await;

        Ok(*confirmed_any && pending_after.is_empty())
    }

    async fn incoming_since(
        &self,
        chain: Chain,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, String> {
        let result = match chain {
            Chain::Btc => self.btc.incoming_since(address, cutoff).await,
            Chain::Bsc => self.bsc.incoming_since(address, cutoff).await,
            Chain::Sol => self.sol.incoming_since(address, cutoff).await,
        };
        result.map_err(|e| e.to_string())
    }

    /// Records one observed inbound transaction and credits points.
    async fn absorb(&self, row: &WatchRow, tx: &IncomingTx) -> Result<Absorbed, String> {
        let existing = self
            .store
            .transaction_status(row.chain, &tx.tx_hash, Direction::In)
            .await
            .map_err(|e| e.to_string())?;

        if !tx.confirmed {
            if existing.is_some() {
                return Ok(Absorbed::Known);
            }
            // Informational pending points at detection-time prices.
            let points = match self.price.usd_value(row.chain, tx.token, tx.amount).await {
                Ok(usd) => self.tiers.points_for(usd),
                Err(e) => {
                    tracing::warn!(error = %e, "pending price lookup failed, crediting later");
                    0
                }
            };
            self.store
                .record_transaction(&self.to_record(row, tx, TxStatus::Pending))
                .await
                .map_err(|e| e.to_string())?;
            if points > 0 {
                self.store
                    .add_pending_points(row.chain, &row.address, points)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            return Ok(Absorbed::Pending);
        }

        // Confirmed at (or past) the threshold.
        match existing {
            Some(TxStatus::Confirmed) => return Ok(Absorbed::Known),
            Some(TxStatus::Failed) => return Ok(Absorbed::Known),
            _ => {}
        }
        let was_pending = existing == Some(TxStatus::Pending);
        let changed = self
            .store
            .record_transaction(&self.to_record(row, tx, TxStatus::Confirmed))
            .await
            .map_err(|e| e.to_string())?;
        if !changed {
            return Ok(Absorbed::Known);
        }
        let usd = self
            .price
            .usd_value(row.chain, tx.token, tx.amount)
            .await
            .map_err(|e| e.to_string())?;
        let points = self.tiers.points_for(usd);
        let pending_consumed = if was_pending { points } else { 0 };
        self.store
            .confirm_points(row.chain, &row.address, points, pending_consumed)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(
            watch_id = row.watch_id,
            tx = tx.tx_hash,
            usd = %usd,
            points,
            "inbound transaction confirmed"
        );
        Ok(Absorbed::Confirmed)
    }

    fn to_record(&self, row: &WatchRow, tx: &IncomingTx, status: TxStatus) -> TxRecord {
        TxRecord {
            chain: row.chain,
            tx_hash: tx.tx_hash.clone(),
            direction: Direction::In,
            token: tx.token,
            amount: tx.amount,
            from_addr: tx.from_addr.clone(),
            to_addr: tx.to_addr.clone(),
            block_number: tx.block_number,
            block_time: tx.block_time,
            gas: None,
            status,
            created_at: UnixTimestamp::now(),
        }
    }
}

enum Absorbed {
    Pending,
    Confirmed,
    Known,
}

fn new_watch_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("watch-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_ids_are_unique() {
        assert_ne!(new_watch_id(), new_watch_id());
    }

    #[test]
    fn address_validation_is_per_chain() {
        assert!(address_is_valid(
            Chain::Btc,
            Network::Mainnet,
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        ));
        assert!(!address_is_valid(
            Chain::Btc,
            Network::Testnet,
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        ));
        assert!(address_is_valid(
            Chain::Bsc,
            Network::Mainnet,
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        ));
        assert!(!address_is_valid(Chain::Bsc, Network::Mainnet, "0x123"));
        assert!(address_is_valid(
            Chain::Sol,
            Network::Mainnet,
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
        ));
        assert!(!address_is_valid(Chain::Sol, Network::Mainnet, "not-base58!"));
    }
}
