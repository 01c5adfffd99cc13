//! BTC sweep engine: one (or a few) multi-input P2WPKH transactions.
//!
//! Confirmed UTXOs from every funded address are consolidated into a single
//! output. Fees use the sweep vsize model `10.5 + 68·inputs + 31·outputs`
//! at a cached fee rate with a 2% safety margin. Oversized input sets split
//! into multiple transactions, index-ordered.
//!
//! At execute time the UTXO set is re-validated against the preview the user
//! approved: a count drop over 5% or a value drop over 3% aborts the sweep
//! (both thresholds are settings keys — crypto amounts are high-value, so
//! the defaults are tight).

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network as BtcNetwork, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, RawAmount, Token, UnixTimestamp};
use crate::derive::Wallet;
use crate::events::{self, EventHub};
use crate::providers::ProviderPool;
use crate::providers::btc::EsploraProvider;
use crate::store::{Direction, Store, TxRecord, TxStateKind, TxStateStatus, TxStatus};

use super::{
    EngineError, PreviewInput, SweepEngine, SweepPreview, SweepRequest, SweepStarted,
    TxCompletePayload, TxStateWriter, new_sweep_id, publish_tx_status,
};

const FEE_CACHE_TTL: Duration = Duration::from_secs(120);
const FEE_SAFETY_MARGIN: f64 = 1.02;
/// Inputs per transaction before the sweep splits.
const MAX_INPUTS_PER_TX: usize = 100;
const DUST_LIMIT_SATS: u64 = 546;
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(15);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const DEFAULT_COUNT_DIVERGENCE_PCT: f64 = 5.0;
const DEFAULT_VALUE_DIVERGENCE_PCT: f64 = 3.0;

/// Sweep vsize for a P2WPKH transaction.
fn sweep_vsize(inputs: usize, outputs: usize) -> f64 {
    10.5 + 68.0 * inputs as f64 + 31.0 * outputs as f64
}

#[derive(Clone, Debug)]
struct PlannedInput {
    index: u32,
    address: String,
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Clone, Debug)]
struct PlannedTx {
    inputs: Vec<PlannedInput>,
    fee: u64,
    output: u64,
}

struct SweepPlan {
    txs: Vec<PlannedTx>,
    utxo_count: usize,
    total_input: u64,
}

pub struct BtcEngine {
    store: Store,
    wallet: Wallet,
    pool: Arc<ProviderPool<EsploraProvider>>,
    hub: Arc<EventHub>,
    tracker: TaskTracker,
    lock: Arc<Mutex<()>>,
    fee_cache: Mutex<Option<(Instant, f64)>>,
    secp: Secp256k1<All>,
}

impl BtcEngine {
    pub fn new(
        store: Store,
        wallet: Wallet,
        pool: Arc<ProviderPool<EsploraProvider>>,
        hub: Arc<EventHub>,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            wallet,
            pool,
            hub,
            tracker,
            lock: Arc::new(Mutex::new(())),
            fee_cache: Mutex::new(None),
            secp: Secp256k1::new(),
        })
    }

    fn btc_network(&self) -> BtcNetwork {
        self.wallet.network().btc_network()
    }

    fn parse_destination(&self, raw: &str) -> Result<Address, EngineError> {
        Address::from_str(raw)
            .and_then(|a| a.require_network(self.btc_network()))
            .map_err(|_| EngineError::InvalidDestination(raw.to_string()))
    }

    /// Fee rate in sat/vB, cached for two minutes.
    async fn fee_rate(&self) -> Result<f64, EngineError> {
        let mut cache = self.fee_cache.lock().await;
        if let Some((at, rate)) = *cache {
            if at.elapsed() < FEE_CACHE_TTL {
                return Ok(rate);
            }
        }
        let rate = self.pool.execute(|p| async move { p.fee_rate().await }).await?;
        *cache = Some((Instant::now(), rate));
        Ok(rate)
    }

    /// Fetches confirmed UTXOs for every funded address and plans the sweep
    /// transactions, splitting on the input cap.
    async fn plan(&self, fee_rate: f64) -> Result<SweepPlan, EngineError> {
        let funded = self.store.funded_addresses(Chain::Btc, Token::Native).await?;
        if funded.is_empty() {
            return Err(EngineError::NothingToSweep);
        }

        let mut inputs: Vec<PlannedInput> = Vec::new();
        for (address, _) in &funded {
            let target = address.address.clone();
            let utxos = self
                .pool
                .execute(|p| {
                    let target = target.clone();
                    async move { p.utxos(&target).await }
                })
                .await?;
            for utxo in utxos {
                inputs.push(PlannedInput {
                    index: address.index,
                    address: address.address.clone(),
                    txid: utxo.txid,
                    vout: utxo.vout,
                    value: utxo.value,
                });
            }
        }
        if inputs.is_empty() {
            return Err(EngineError::NothingToSweep);
        }

        let utxo_count = inputs.len();
        let total_input: u64 = inputs.iter().map(|i| i.value).sum();
        let mut txs = Vec::new();
        for chunk in inputs.chunks(MAX_INPUTS_PER_TX) {
            let sum: u64 = chunk.iter().map(|i| i.value).sum();
            let fee = (sweep_vsize(chunk.len(), 1) * fee_rate * FEE_SAFETY_MARGIN).ceil() as u64;
            let output = sum.saturating_sub(fee);
            if output < DUST_LIMIT_SATS {
                continue;
            }
            txs.push(PlannedTx {
                inputs: chunk.to_vec(),
                fee,
                output,
            });
        }
        if txs.is_empty() {
            return Err(EngineError::NothingToSweep);
        }
        Ok(SweepPlan {
            txs,
            utxo_count,
            total_input,
        })
    }

    async fn divergence_thresholds(&self) -> (f64, f64) {
        let count = self
            .store
            .get_setting("preview_divergence_count_pct")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COUNT_DIVERGENCE_PCT);
        let value = self
            .store
            .get_setting("preview_divergence_value_pct")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_VALUE_DIVERGENCE_PCT);
        (count, value)
    }

    /// The execute-time guard: reality must not have drifted from what the
    /// user approved.
    fn validate_against_preview(
        plan: &SweepPlan,
        preview_count: usize,
        preview_total: u64,
        count_threshold_pct: f64,
        value_threshold_pct: f64,
    ) -> Result<(), EngineError> {
        if preview_count > 0 && plan.utxo_count < preview_count {
            let drop_pct =
                (preview_count - plan.utxo_count) as f64 / preview_count as f64 * 100.0;
            if drop_pct > count_threshold_pct {
                return Err(EngineError::UtxoValidationFailed(format!(
                    "UTXO count dropped {drop_pct:.1}% ({} -> {})",
                    preview_count, plan.utxo_count
                )));
            }
        }
        if preview_total > 0 && plan.total_input < preview_total {
            let drop_pct =
                (preview_total - plan.total_input) as f64 / preview_total as f64 * 100.0;
            if drop_pct > value_threshold_pct {
                return Err(EngineError::UtxoValidationFailed(format!(
                    "input value dropped {drop_pct:.1}% ({} -> {} sats)",
                    preview_total, plan.total_input
                )));
            }
        }
        Ok(())
    }

    /// Builds and signs one planned transaction. Each input is signed with a
    /// freshly derived key against its own previous-output script, and the
    /// key buffer is wiped before the next input is touched.
    fn sign_tx(&self, planned: &PlannedTx, destination: &Address) -> Result<Transaction, EngineError> {
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: planned
                .inputs
                .iter()
                .map(|input| {
                    Ok(TxIn {
                        previous_output: OutPoint {
                            txid: input.txid.parse().map_err(|_| {
                                EngineError::Internal(format!("bad utxo txid {}", input.txid))
                            })?,
                            vout: input.vout,
                        },
                        script_sig: ScriptBuf::new(),
                        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                        witness: Witness::default(),
                    })
                })
                .collect::<Result<_, EngineError>>()?,
            output: vec![TxOut {
                value: Amount::from_sat(planned.output),
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let mut cache = SighashCache::new(&mut tx);
        for (i, input) in planned.inputs.iter().enumerate() {
            let key = self.wallet.btc_signing_key(input.index)?;
            let script_pubkey = ScriptBuf::new_p2wpkh(&key.public.wpubkey_hash());
            let sighash = cache
                .p2wpkh_signature_hash(
                    i,
                    &script_pubkey,
                    Amount::from_sat(input.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| EngineError::Internal(format!("sighash: {e}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = self.secp.sign_ecdsa(&message, &key.secret_key()?);
            let signature = bitcoin::ecdsa::Signature::sighash_all(signature);
            *cache
                .witness_mut(i)
                .expect("input index within bounds") = Witness::p2wpkh(&signature, &key.public.0);
        }
        drop(cache);
        Ok(tx)
    }

    async fn run_sweep(self: Arc<Self>, plan: SweepPlan, destination: Address, writer: TxStateWriter) {
        let sweep_id = writer.sweep_id().to_string();
        let mut broadcast = 0usize;
        let mut failed = 0usize;
        let mut total_swept = RawAmount::ZERO;

        for planned in &plan.txs {
            for input in &planned.inputs {
                writer.begin(input.index, TxStateKind::Sweep, None).await;
            }

            let tx = match self.sign_tx(planned, &destination) {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::error!(sweep_id, error = %e, "failed to sign sweep transaction");
                    for input in &planned.inputs {
                        writer
                            .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Btc,
                            input.index,
                            TxStateStatus::Failed,
                            None,
                        );
                    }
                    failed += planned.inputs.len();
                    continue;
                }
            };
            let txid = tx.compute_txid().to_string();
            for input in &planned.inputs {
                writer
                    .advance(input.index, TxStateKind::Sweep, TxStateStatus::Signed, Some(&txid))
                    .await;
            }

            let raw_hex = bitcoin::consensus::encode::serialize_hex(&tx);
            let sent = self
                .pool
                .execute(|p| {
                    let raw_hex = raw_hex.clone();
                    async move { p.broadcast(&raw_hex).await }
                })
                .await;
            match sent {
                Ok(_) => {
                    for input in &planned.inputs {
                        writer
                            .advance(
                                input.index,
                                TxStateKind::Sweep,
                                TxStateStatus::Broadcast,
                                Some(&txid),
                            )
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Btc,
                            input.index,
                            TxStateStatus::Broadcast,
                            Some(&txid),
                        );
                    }
                    broadcast += planned.inputs.len();
                    total_swept = total_swept + RawAmount::from_u64(planned.output);
                    let record = TxRecord {
                        chain: Chain::Btc,
                        tx_hash: txid.clone(),
                        direction: Direction::Out,
                        token: Token::Native,
                        amount: RawAmount::from_u64(planned.output),
                        from_addr: planned
                            .inputs
                            .first()
                            .map(|i| i.address.clone())
                            .unwrap_or_default(),
                        to_addr: destination.to_string(),
                        block_number: None,
                        block_time: None,
                        gas: Some(RawAmount::from_u64(planned.fee)),
                        status: TxStatus::Pending,
                        created_at: UnixTimestamp::now(),
                    };
                    if let Err(e) = self.store.record_transaction(&record).await {
                        tracing::error!(sweep_id, error = %e, "failed to record sweep tx");
                    }
                    let indexes: Vec<u32> = planned.inputs.iter().map(|i| i.index).collect();
                    self.spawn_confirmation(txid, indexes, writer.clone());
                }
                Err(e) => {
                    tracing::error!(sweep_id, error = %e, "broadcast failed");
                    for input in &planned.inputs {
                        writer
                            .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, Some(&txid))
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Btc,
                            input.index,
                            TxStateStatus::Failed,
                            Some(&txid),
                        );
                    }
                    failed += planned.inputs.len();
                }
            }
        }

        self.hub.publish(
            events::TX_COMPLETE,
            &TxCompletePayload {
                sweep_id: &sweep_id,
                chain: Chain::Btc,
                token: Token::Native,
                broadcast,
                confirmed: 0,
                failed,
                uncertain: 0,
                skipped: 0,
                total_swept,
            },
        );
    }

    /// Polls the tx status every 15s for up to 10 minutes; timing out marks
    /// the transaction uncertain, never failed.
    fn spawn_confirmation(&self, txid: String, indexes: Vec<u32>, writer: TxStateWriter) {
        let pool = Arc::clone(&self.pool);
        let store = self.store.clone();
        let hub = Arc::clone(&self.hub);
        self.tracker.spawn(async move {
            let deadline = Instant::now() + CONFIRM_TIMEOUT;
            loop {
                tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
                let status = pool
                    .execute(|p| {
                        let txid = txid.clone();
                        async move { p.tx_status(&txid).await }
                    })
                    .await;
                if let Ok(status) = status {
                    if status.confirmed {
                        for index in &indexes {
                            writer
                                .advance(*index, TxStateKind::Sweep, TxStateStatus::Confirmed, Some(&txid))
                                .await;
                            publish_tx_status(
                                &hub,
                                writer.sweep_id(),
                                Chain::Btc,
                                *index,
                                TxStateStatus::Confirmed,
                                Some(&txid),
                            );
                        }
                        let _ = store
                            .record_transaction(&TxRecord {
                                chain: Chain::Btc,
                                tx_hash: txid.clone(),
                                direction: Direction::Out,
                                token: Token::Native,
                                amount: RawAmount::ZERO,
                                from_addr: String::new(),
                                to_addr: String::new(),
                                block_number: status.block_height.map(|h| h as i64),
                                block_time: status.block_time.map(UnixTimestamp),
                                gas: None,
                                status: TxStatus::Confirmed,
                                created_at: UnixTimestamp::now(),
                            })
                            .await;
                        return;
                    }
                }
                if Instant::now() >= deadline {
                    tracing::warn!(txid, "confirmation window elapsed, marking uncertain");
                    for index in &indexes {
                        writer
                            .advance(*index, TxStateKind::Sweep, TxStateStatus::Uncertain, Some(&txid))
                            .await;
                        publish_tx_status(
                            &hub,
                            writer.sweep_id(),
                            Chain::Btc,
                            *index,
                            TxStateStatus::Uncertain,
                            Some(&txid),
                        );
                    }
                    let _ = store
                        .record_transaction(&TxRecord {
                            chain: Chain::Btc,
                            tx_hash: txid.clone(),
                            direction: Direction::Out,
                            token: Token::Native,
                            amount: RawAmount::ZERO,
                            from_addr: String::new(),
                            to_addr: String::new(),
                            block_number: None,
                            block_time: None,
                            gas: None,
                            status: TxStatus::Uncertain,
                            created_at: UnixTimestamp::now(),
                        })
                        .await;
                    return;
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl SweepEngine for BtcEngine {
    fn chain(&self) -> Chain {
        Chain::Btc
    }

    async fn preview(&self, request: &SweepRequest) -> Result<SweepPreview, EngineError> {
        if request.token != Token::Native {
            return Err(EngineError::UnsupportedToken {
                chain: Chain::Btc,
                token: request.token,
            });
        }
        let destination = self.parse_destination(&request.destination)?;
        let fee_rate = self.fee_rate().await?;
        let plan = self.plan(fee_rate).await?;

        // Group per address for display.
        let mut inputs: Vec<PreviewInput> = Vec::new();
        for tx in &plan.txs {
            for input in &tx.inputs {
                match inputs.iter_mut().find(|p| p.index == input.index) {
                    Some(existing) => {
                        existing.amount = existing.amount + RawAmount::from_u64(input.value);
                    }
                    None => inputs.push(PreviewInput {
                        index: input.index,
                        address: input.address.clone(),
                        amount: RawAmount::from_u64(input.value),
                        has_gas: None,
                        needs_fee_payer: None,
                    }),
                }
            }
        }
        let fee: u64 = plan.txs.iter().map(|t| t.fee).sum();
        let output: u64 = plan.txs.iter().map(|t| t.output).sum();
        Ok(SweepPreview {
            chain: Chain::Btc,
            token: Token::Native,
            destination: destination.to_string(),
            inputs,
            total_input: RawAmount::from_u64(plan.total_input),
            fee_estimate: RawAmount::from_u64(fee),
            net_output: RawAmount::from_u64(output),
            utxo_count: Some(plan.utxo_count),
            gas_price: None,
        })
    }

    async fn execute(&self, request: SweepRequest) -> Result<SweepStarted, EngineError> {
        if request.token != Token::Native {
            return Err(EngineError::UnsupportedToken {
                chain: Chain::Btc,
                token: request.token,
            });
        }
        let destination = self.parse_destination(&request.destination)?;
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| EngineError::Busy(Chain::Btc))?;

        let fee_rate = self.fee_rate().await?;
        let plan = self.plan(fee_rate).await?;
        if let (Some(count), Some(total)) = (
            request.options.preview_utxo_count,
            request.options.preview_total_input,
        ) {
            let (count_pct, value_pct) = self.divergence_thresholds().await;
            Self::validate_against_preview(
                &plan,
                count,
                total.to_u64().unwrap_or(0),
                count_pct,
                value_pct,
            )?;
        }

        let sweep_id = new_sweep_id();
        let writer = TxStateWriter::new(self.store.clone(), sweep_id.clone(), Chain::Btc);
        let started = SweepStarted {
            sweep_id,
            chain: Chain::Btc,
            token: Token::Native,
            tx_count: plan.txs.len(),
        };

        let engine = Arc::new(self.clone_parts());
        self.tracker.spawn(async move {
            let _guard = guard;
            engine.run_sweep(plan, destination, writer).await;
        });
        Ok(started)
    }
}

impl BtcEngine {
    /// Cheap structural clone for moving into the worker task; all fields
    /// are shared handles.
    fn clone_parts(&self) -> BtcEngine {
        BtcEngine {
            store: self.store.clone(),
            wallet: self.wallet.clone(),
            pool: Arc::clone(&self.pool),
            hub: Arc::clone(&self.hub),
            tracker: self.tracker.clone(),
            lock: Arc::clone(&self.lock),
            fee_cache: Mutex::new(None),
            secp: Secp256k1::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsize_matches_the_p2wpkh_model() {
        assert_eq!(sweep_vsize(1, 1), 109.5);
        assert_eq!(sweep_vsize(10, 1), 721.5);
    }

    fn plan_with(count: usize, total: u64) -> SweepPlan {
        SweepPlan {
            txs: vec![],
            utxo_count: count,
            total_input: total,
        }
    }

    #[test]
    fn preview_divergence_rejects_a_ten_percent_count_drop() {
        // Preview showed 10 UTXOs / 1_000_000 sats; execute found 9 / 999_000.
        let plan = plan_with(9, 999_000);
        let result = BtcEngine::validate_against_preview(&plan, 10, 1_000_000, 5.0, 3.0);
        assert!(matches!(result, Err(EngineError::UtxoValidationFailed(_))));
    }

    #[test]
    fn preview_divergence_accepts_small_drift() {
        let plan = plan_with(98, 985_000);
        BtcEngine::validate_against_preview(&plan, 100, 1_000_000, 5.0, 3.0).unwrap();
    }

    #[test]
    fn preview_divergence_rejects_value_drop_alone() {
        let plan = plan_with(100, 950_000);
        let result = BtcEngine::validate_against_preview(&plan, 100, 1_000_000, 5.0, 3.0);
        assert!(matches!(result, Err(EngineError::UtxoValidationFailed(_))));
    }

    #[test]
    fn growth_is_not_divergence() {
        let plan = plan_with(12, 1_200_000);
        BtcEngine::validate_against_preview(&plan, 10, 1_000_000, 5.0, 3.0).unwrap();
    }
}
