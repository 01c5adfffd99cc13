//! Chain-specific sweep engines behind one `preview`/`execute` contract.
//!
//! `preview` is synchronous and side-effect free. `execute` validates,
//! acquires the chain's exclusive sweep lock with try-lock semantics (a
//! concurrent request fails busy, nothing queues), writes tx-state rows, and
//! runs the sweep on a background task — the HTTP call returns a sweep id
//! immediately and progress flows through the transaction event hub.
//!
//! Every individual transaction gets a tx-state row before signing and is
//! advanced through signed → broadcast → confirmed | failed | uncertain.
//! TX-state persistence failures are logged, never fatal to the sweep, so a
//! flaky disk cannot strand funds mid-broadcast.

pub mod bsc;
pub mod btc;
pub mod reconciler;
pub mod sol;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::chain::{Chain, RawAmount, Token, UnixTimestamp};
use crate::derive::DeriveError;
use crate::events::{self, EventHub};
use crate::providers::PoolError;
use crate::store::{Store, StoreError, TxStateKind, TxStateRow, TxStateStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a sweep is already running on {0}")]
    Busy(Chain),
    #[error("invalid destination address: {0}")]
    InvalidDestination(String),
    #[error("{token} is not supported on {chain}")]
    UnsupportedToken { chain: Chain, token: Token },
    #[error("no funded addresses to sweep")]
    NothingToSweep,
    #[error("UTXO set diverged from preview: {0}")]
    UtxoValidationFailed(String),
    #[error("gas price spiked since preview: {current} > 2 x {preview}")]
    GasPriceSpike { current: u128, preview: u128 },
    #[error("source index {index} holds {available} but the pre-seed needs {required}")]
    InsufficientPreseedSource {
        index: u32,
        available: RawAmount,
        required: RawAmount,
    },
    #[error("fee payer index {index} holds {available} lamports but needs {required}")]
    InsufficientFeePayer {
        index: u32,
        available: u64,
        required: u64,
    },
    #[error("a fee payer index is required for SOL token sweeps")]
    FeePayerRequired,
    #[error("a gas source index is required for the pre-seed")]
    GasSourceRequired,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error("sweep failed: {0}")]
    Internal(String),
}

/// A user sweep request: destination plus chain-specific options.
#[derive(Clone, Debug, Deserialize)]
pub struct SweepRequest {
    pub destination: String,
    pub token: Token,
    #[serde(default)]
    pub options: SweepOptions,
}

/// Options echoing the preview the user approved, plus role selections.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOptions {
    /// BSC gas pre-seed: index funding the needy addresses.
    pub gas_source_index: Option<u32>,
    /// SOL token sweeps: index paying fees for all signers.
    pub fee_payer_index: Option<u32>,
    /// BTC: UTXO count the approved preview showed.
    pub preview_utxo_count: Option<usize>,
    /// BTC: total input value the approved preview showed, in sats.
    pub preview_total_input: Option<RawAmount>,
    /// BSC: gas price the approved preview used, in wei.
    pub preview_gas_price: Option<u128>,
}

/// One address to be swept.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInput {
    pub index: u32,
    pub address: String,
    pub amount: RawAmount,
    /// BSC token sweeps: the address holds native gas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_gas: Option<bool>,
    /// SOL token sweeps: the transfer relies on the chosen fee payer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_fee_payer: Option<bool>,
}

/// What `execute` would sweep, with fees, as shown to the user.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepPreview {
    pub chain: Chain,
    pub token: Token,
    pub destination: String,
    pub inputs: Vec<PreviewInput>,
    pub total_input: RawAmount,
    pub fee_estimate: RawAmount,
    pub net_output: RawAmount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utxo_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
}

/// Acknowledgement returned by `execute` before the worker runs.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStarted {
    pub sweep_id: String,
    pub chain: Chain,
    pub token: Token,
    pub tx_count: usize,
}

/// The shared engine contract. Each chain is a separate concrete
/// implementation sharing only this shape.
#[async_trait::async_trait]
pub trait SweepEngine: Send + Sync {
    fn chain(&self) -> Chain;
    async fn preview(&self, request: &SweepRequest) -> Result<SweepPreview, EngineError>;
    async fn execute(&self, request: SweepRequest) -> Result<SweepStarted, EngineError>;
}

/// Unique id grouping all transactions of one sweep invocation. Unique even
/// across retries of the "same" sweep.
pub fn new_sweep_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("sweep-{}", hex::encode(bytes))
}

/// Per-sweep tx-state writer.
///
/// All writes swallow store errors after logging: tx-state is an audit and
/// recovery aid, and must never abort a sweep that is already moving funds.
#[derive(Clone)]
pub(crate) struct TxStateWriter {
    store: Store,
    sweep_id: String,
    chain: Chain,
}

impl TxStateWriter {
    pub fn new(store: Store, sweep_id: String, chain: Chain) -> Self {
        Self {
            store,
            sweep_id,
            chain,
        }
    }

    pub fn sweep_id(&self) -> &str {
        &self.sweep_id
    }

    /// Writes the `building` row before any key material is derived.
    pub async fn begin(&self, address_index: u32, kind: TxStateKind, nonce: Option<i64>) {
        let now = UnixTimestamp::now();
        let row = TxStateRow {
            sweep_id: self.sweep_id.clone(),
            chain: self.chain,
            address_index,
            kind,
            nonce,
            tx_hash: None,
            status: TxStateStatus::Building,
            attempt: 1,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.insert_tx_state(&row).await {
            tracing::error!(
                sweep_id = self.sweep_id,
                address_index,
                error = %e,
                "failed to persist tx-state, continuing"
            );
        }
    }

    pub async fn advance(
        &self,
        address_index: u32,
        kind: TxStateKind,
        status: TxStateStatus,
        tx_hash: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .update_tx_state(&self.sweep_id, address_index, kind, status, tx_hash)
            .await
        {
            tracing::error!(
                sweep_id = self.sweep_id,
                address_index,
                status = %status,
                error = %e,
                "failed to advance tx-state, continuing"
            );
        }
    }
}

/// Per-transaction progress event.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TxStatusPayload<'a> {
    pub sweep_id: &'a str,
    pub chain: Chain,
    pub address_index: u32,
    pub status: TxStateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<&'a str>,
}

/// Terminal sweep summary event.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TxCompletePayload<'a> {
    pub sweep_id: &'a str,
    pub chain: Chain,
    pub token: Token,
    /// Broadcast and still confirming in the background.
    pub broadcast: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub uncertain: usize,
    pub skipped: usize,
    pub total_swept: RawAmount,
}

pub(crate) fn publish_tx_status(
    hub: &EventHub,
    sweep_id: &str,
    chain: Chain,
    address_index: u32,
    status: TxStateStatus,
    tx_hash: Option<&str>,
) {
    hub.publish(
        events::TX_STATUS,
        &TxStatusPayload {
            sweep_id,
            chain,
            address_index,
            status,
            tx_hash,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_ids_are_unique_and_tagged() {
        let a = new_sweep_id();
        let b = new_sweep_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sweep-"));
        assert_eq!(a.len(), "sweep-".len() + 24);
    }

    #[test]
    fn sweep_options_accept_partial_json() {
        let request: SweepRequest = serde_json::from_str(
            r#"{"destination": "bc1qxyz", "token": "NATIVE",
                "options": {"previewUtxoCount": 10, "previewTotalInput": "1000000"}}"#,
        )
        .unwrap();
        assert_eq!(request.options.preview_utxo_count, Some(10));
        assert_eq!(
            request.options.preview_total_input,
            Some(RawAmount::from_u64(1_000_000))
        );
        assert!(request.options.gas_source_index.is_none());
    }
}
