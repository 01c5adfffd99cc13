//! Startup reconciliation of in-flight sweep state.
//!
//! A crash or restart can leave tx-state rows in building/signed/broadcast.
//! On boot the reconciler walks every non-terminal row: rows that never got
//! a hash were never broadcast and are marked failed; rows with a hash are
//! re-queried through the provider pool — confirmed transactions are
//! recorded, fresh ones (under an hour old) get their polling loop
//! re-launched, and anything older is marked uncertain rather than guessed
//! at. Orphaned sweeps surface on `/api/send/pending` for user dismissal;
//! a reconcile after a clean shutdown changes nothing.

use solana_signature::Signature;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, UnixTimestamp};
use crate::providers::bsc::BscRpcProvider;
use crate::providers::btc::EsploraProvider;
use crate::providers::sol::SolRpcProvider;
use crate::providers::ProviderPool;
use crate::store::{Store, StoreError, TxStateKind, TxStateRow, TxStateStatus};
use alloy_primitives::B256;
use solana_transaction_status_client_types::TransactionConfirmationStatus;

/// Rows younger than this get their confirmation poll re-launched; older
/// ones are marked uncertain.
const REPOLL_WINDOW_SECS: i64 = 3600;
const REPOLL_INTERVAL: Duration = Duration::from_secs(15);
const REPOLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub uncertain: usize,
    pub repolling: usize,
}

pub struct Reconciler {
    store: Store,
    btc: Arc<ProviderPool<EsploraProvider>>,
    bsc: Arc<ProviderPool<BscRpcProvider>>,
    sol: Arc<ProviderPool<SolRpcProvider>>,
    tracker: TaskTracker,
}

enum Verdict {
    Confirmed,
    Failed,
    /// Broadcast observed, not yet final.
    InFlight,
    /// Finality unverifiable right now.
    Unknown,
}

impl Reconciler {
    pub fn new(
        store: Store,
        btc: Arc<ProviderPool<EsploraProvider>>,
        bsc: Arc<ProviderPool<BscRpcProvider>>,
        sol: Arc<ProviderPool<SolRpcProvider>>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            btc,
            bsc,
            sol,
            tracker,
        }
    }

    pub async fn run(&self) -> Result<ReconcileSummary, StoreError> {
        let rows = self.store.non_terminal_tx_states().await?;
        let mut summary = ReconcileSummary {
            examined: rows.len(),
            ..ReconcileSummary::default()
        };
        if rows.is_empty() {
            tracing::info!("reconciler: no in-flight tx-state");
            return Ok(summary);
        }
        let now = UnixTimestamp::now();

        for row in rows {
            let Some(tx_hash) = row.tx_hash.clone() else {
                // Never broadcast; nothing can be on chain.
                self.finish(&row, TxStateStatus::Failed).await;
                summary.failed += 1;
                continue;
            };
            let verdict = self.query(row.chain, &tx_hash).await;
            match verdict {
                Verdict::Confirmed => {
                    self.finish(&row, TxStateStatus::Confirmed).await;
                    summary.confirmed += 1;
                }
                Verdict::Failed => {
                    self.finish(&row, TxStateStatus::Failed).await;
                    summary.failed += 1;
                }
                Verdict::InFlight | Verdict::Unknown
                    if now.seconds_since(row.created_at) < REPOLL_WINDOW_SECS =>
                {
                    self.spawn_repoll(row, tx_hash);
                    summary.repolling += 1;
                }
                _ => {
                    self.finish(&row, TxStateStatus::Uncertain).await;
                    summary.uncertain += 1;
                }
            }
        }
        tracing::info!(
            examined = summary.examined,
            confirmed = summary.confirmed,
            failed = summary.failed,
            uncertain = summary.uncertain,
            repolling = summary.repolling,
            "reconciler finished"
        );
        Ok(summary)
    }

    async fn finish(&self, row: &TxStateRow, status: TxStateStatus) {
        if let Err(e) = self
            .store
            .update_tx_state(
                &row.sweep_id,
                row.address_index,
                row.kind,
                status,
                row.tx_hash.as_deref(),
            )
            .await
        {
            tracing::error!(sweep_id = row.sweep_id, error = %e, "reconciler failed to persist");
        }
    }

    async fn query(&self, chain: Chain, tx_hash: &str) -> Verdict {
        match chain {
            Chain::Btc => {
                let txid = tx_hash.to_string();
                match self
                    .btc
                    .execute(|p| {
                        let txid = txid.clone();
                        async move { p.tx_status(&txid).await }
                    })
                    .await
                {
                    Ok(status) if status.confirmed => Verdict::Confirmed,
                    Ok(_) => Verdict::InFlight,
                    Err(_) => Verdict::Unknown,
                }
            }
            Chain::Bsc => {
                let Ok(hash) = B256::from_str(tx_hash) else {
                    return Verdict::Failed;
                };
                match self
                    .bsc
                    .execute(move |p| async move { p.receipt(hash).await })
                    .await
                {
                    Ok(Some(receipt)) if receipt.status() => Verdict::Confirmed,
                    Ok(Some(_)) => Verdict::Failed,
                    Ok(None) => Verdict::InFlight,
                    Err(_) => Verdict::Unknown,
                }
            }
            Chain::Sol => {
                // Sweep rows store `signature`; watch rows suffix the token.
                let raw = tx_hash.split(':').next().unwrap_or(tx_hash);
                let Ok(signature) = Signature::from_str(raw) else {
                    return Verdict::Failed;
                };
                match self
                    .sol
                    .execute(|p| async move { p.signature_statuses(&[signature]).await })
                    .await
                {
                    Ok(statuses) => match statuses.into_iter().next().flatten() {
                        Some(status) if status.err.is_some() => Verdict::Failed,
                        Some(status)
                            if matches!(
                                status.confirmation_status,
                                Some(TransactionConfirmationStatus::Finalized)
                            ) =>
                        {
                            Verdict::Confirmed
                        }
                        _ => Verdict::InFlight,
                    },
                    Err(_) => Verdict::Unknown,
                }
            }
        }
    }

    /// Re-launches a bounded confirmation poll for a young in-flight row.
    fn spawn_repoll(&self, row: TxStateRow, tx_hash: String) {
        let store = self.store.clone();
        let reconciler = Reconciler {
            store: store.clone(),
            btc: Arc::clone(&self.btc),
            bsc: Arc::clone(&self.bsc),
            sol: Arc::clone(&self.sol),
            tracker: self.tracker.clone(),
        };
        self.tracker.spawn(async move {
            let deadline = Instant::now() + REPOLL_TIMEOUT;
            loop {
                tokio::time::sleep(REPOLL_INTERVAL).await;
                match reconciler.query(row.chain, &tx_hash).await {
                    Verdict::Confirmed => {
                        reconciler.finish(&row, TxStateStatus::Confirmed).await;
                        return;
                    }
                    Verdict::Failed => {
                        reconciler.finish(&row, TxStateStatus::Failed).await;
                        return;
                    }
                    Verdict::InFlight | Verdict::Unknown => {}
                }
                if Instant::now() >= deadline {
                    reconciler.finish(&row, TxStateStatus::Uncertain).await;
                    return;
                }
            }
        });
    }
}

/// Sweeps with non-terminal rows older than an hour, for `/api/send/pending`.
pub async fn orphaned_sweeps(store: &Store) -> Result<Vec<OrphanedSweep>, StoreError> {
    let rows = store.non_terminal_tx_states().await?;
    let now = UnixTimestamp::now();
    let mut by_sweep: Vec<OrphanedSweep> = Vec::new();
    for row in rows {
        if now.seconds_since(row.created_at) < REPOLL_WINDOW_SECS {
            continue;
        }
        match by_sweep.iter_mut().find(|s| s.sweep_id == row.sweep_id) {
            Some(sweep) => {
                sweep.open_tx_count += 1;
                sweep.oldest_created_at = sweep.oldest_created_at.min(row.created_at);
            }
            None => by_sweep.push(OrphanedSweep {
                sweep_id: row.sweep_id.clone(),
                chain: row.chain,
                kind: row.kind,
                open_tx_count: 1,
                oldest_created_at: row.created_at,
            }),
        }
    }
    Ok(by_sweep)
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedSweep {
    pub sweep_id: String,
    pub chain: Chain,
    pub kind: TxStateKind,
    pub open_tx_count: usize,
    pub oldest_created_at: UnixTimestamp,
}
