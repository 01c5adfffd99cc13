//! BSC sweep engine: sequential EIP-155 legacy transactions in address-index
//! order, with local nonce sequencing, a gas-price buffer, a BEP-20 path,
//! and the gas pre-seed that funds token-holding addresses which cannot pay
//! for their own transfer.

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_sol_types::SolCall;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};
use crate::derive::Wallet;
use crate::events::{self, EventHub};
use crate::providers::bsc::{BscRpcProvider, IErc20, token_address};
use crate::providers::{PoolError, ProviderPool};
use crate::store::{Direction, Store, TxRecord, TxStateKind, TxStateStatus, TxStatus};

use super::{
    EngineError, PreviewInput, SweepEngine, SweepPreview, SweepRequest, SweepStarted,
    TxCompletePayload, TxStateWriter, new_sweep_id, publish_tx_status,
};

const NATIVE_GAS_LIMIT: u64 = 21_000;
const TOKEN_GAS_LIMIT: u64 = 65_000;
/// Suggested gas price is padded 20%.
const GAS_BUFFER_NUM: u128 = 120;
const GAS_BUFFER_DEN: u128 = 100;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);
/// 0.005 BNB in wei.
const DEFAULT_PRESEED_WEI: u128 = 5_000_000_000_000_000;

pub struct BscEngine {
    store: Store,
    wallet: Wallet,
    pool: Arc<ProviderPool<BscRpcProvider>>,
    /// Broadcast-only fallback; every other RPC method uses the pool.
    ankr: BscRpcProvider,
    hub: Arc<EventHub>,
    tracker: TaskTracker,
    lock: Arc<Mutex<()>>,
    network: Network,
}

impl BscEngine {
    pub fn new(
        store: Store,
        wallet: Wallet,
        pool: Arc<ProviderPool<BscRpcProvider>>,
        hub: Arc<EventHub>,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        let network = wallet.network();
        Arc::new(Self {
            store,
            wallet,
            pool,
            ankr: BscRpcProvider::ankr(network),
            hub,
            tracker,
            lock: Arc::new(Mutex::new(())),
            network,
        })
    }

    fn parse_destination(raw: &str) -> Result<Address, EngineError> {
        Address::from_str(raw).map_err(|_| EngineError::InvalidDestination(raw.to_string()))
    }

    fn token_contract(&self, token: Token) -> Result<Option<Address>, EngineError> {
        match token {
            Token::Native => Ok(None),
            other => token_address(self.network, other)
                .map(Some)
                .ok_or(EngineError::UnsupportedToken {
                    chain: Chain::Bsc,
                    token: other,
                }),
        }
    }

    /// Suggested gas price with the 20% buffer, in wei.
    async fn buffered_gas_price(&self) -> Result<u128, EngineError> {
        let suggested = self
            .pool
            .execute(|p| async move { p.gas_price().await })
            .await?;
        Ok(suggested * GAS_BUFFER_NUM / GAS_BUFFER_DEN)
    }

    async fn preseed_amount(&self) -> U256 {
        let configured = self
            .store
            .get_setting("gas_preseed_amount")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u128>().ok())
            .unwrap_or(DEFAULT_PRESEED_WEI);
        U256::from(configured)
    }

    fn sign_legacy(
        &self,
        index: u32,
        nonce: u64,
        gas_price: u128,
        gas_limit: u64,
        to: Address,
        value: U256,
        input: Bytes,
    ) -> Result<(Vec<u8>, B256, Address), EngineError> {
        let signer = self.wallet.bsc_signing_key(index)?;
        let from = signer.address();
        let mut tx = TxLegacy {
            chain_id: Some(self.network.bsc_chain_id()),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(to),
            value,
            input,
        };
        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| EngineError::Internal(format!("signing failed: {e}")))?;
        let envelope = TxEnvelope::Legacy(tx.into_signed(signature));
        let hash = *envelope.tx_hash();
        Ok((envelope.encoded_2718(), hash, from))
    }

    /// Broadcasts through the pool; if the whole primary set refuses, Ankr
    /// gets one chance. Only `eth_sendRawTransaction` ever touches Ankr.
    async fn broadcast(&self, raw: &[u8]) -> Result<B256, EngineError> {
        let raw_owned = raw.to_vec();
        let primary = self
            .pool
            .execute(|p| {
                let raw = raw_owned.clone();
                async move { p.send_raw_transaction(&raw).await }
            })
            .await;
        match primary {
            Ok(hash) => Ok(hash),
            Err(PoolError::Client(e)) => Err(PoolError::Client(e).into()),
            Err(exhausted) => {
                tracing::warn!(error = %exhausted, "primary broadcast exhausted, trying ankr");
                self.ankr
                    .send_raw_transaction(raw)
                    .await
                    .map_err(|e| PoolError::Client(e).into())
            }
        }
    }

    fn is_nonce_too_low(error: &EngineError) -> bool {
        error.to_string().to_ascii_lowercase().contains("nonce too low")
    }

    async fn on_chain_native(&self, address: Address) -> Result<U256, EngineError> {
        Ok(self
            .pool
            .execute(move |p| async move { p.native_balance(address).await })
            .await?)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        Ok(self
            .pool
            .execute(move |p| async move { p.pending_nonce(address).await })
            .await?)
    }

    /// One send with a single nonce-gap retry: on "nonce too low" the nonce
    /// is refetched and the transaction rebuilt once; further failures
    /// surface.
    #[allow(clippy::too_many_arguments)]
    async fn send_with_nonce_retry(
        &self,
        index: u32,
        from: Address,
        nonce: u64,
        gas_price: u128,
        gas_limit: u64,
        to: Address,
        value: U256,
        input: Bytes,
    ) -> Result<B256, EngineError> {
        let (raw, _, _) =
            self.sign_legacy(index, nonce, gas_price, gas_limit, to, value, input.clone())?;
        match self.broadcast(&raw).await {
            Ok(hash) => Ok(hash),
            Err(e) if Self::is_nonce_too_low(&e) => {
                tracing::warn!(index, nonce, "nonce too low, refetching once");
                let fresh = self.pending_nonce(from).await?;
                let (raw, _, _) =
                    self.sign_legacy(index, fresh, gas_price, gas_limit, to, value, input)?;
                self.broadcast(&raw).await
            }
            Err(e) => Err(e),
        }
    }

    async fn run_sweep(
        self: Arc<Self>,
        inputs: Vec<PreviewInput>,
        destination: Address,
        token: Token,
        contract: Option<Address>,
        gas_price: u128,
        writer: TxStateWriter,
    ) {
        let sweep_id = writer.sweep_id().to_string();
        let mut broadcast = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        let mut total_swept = RawAmount::ZERO;

        for input in &inputs {
            let Ok(from) = Address::from_str(&input.address) else {
                failed += 1;
                continue;
            };
            writer.begin(input.index, TxStateKind::Sweep, None).await;

            // Re-fetch and trust the lower of DB and on-chain.
            let on_chain = match self.on_chain_native(from).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::error!(sweep_id, index = input.index, error = %e, "balance refetch failed");
                    writer
                        .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                        .await;
                    failed += 1;
                    continue;
                }
            };

            let outcome = match contract {
                None => {
                    let db_amount = input.amount.0;
                    let balance = db_amount.min(on_chain);
                    let fee = U256::from(gas_price) * U256::from(NATIVE_GAS_LIMIT);
                    if balance <= fee {
                        writer
                            .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                            .await;
                        skipped += 1;
                        continue;
                    }
                    let value = balance - fee;
                    self.send_one(
                        input.index,
                        from,
                        gas_price,
                        NATIVE_GAS_LIMIT,
                        destination,
                        value,
                        Bytes::new(),
                        value,
                        Token::Native,
                        &writer,
                    )
                    .await
                }
                Some(contract_address) => {
                    // A token transfer burns native gas; no gas, no sweep.
                    if on_chain.is_zero() {
                        writer
                            .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Bsc,
                            input.index,
                            TxStateStatus::Failed,
                            None,
                        );
                        skipped += 1;
                        continue;
                    }
                    let token_balance = match self
                        .pool
                        .execute(move |p| async move {
                            p.token_balance(contract_address, from).await
                        })
                        .await
                    {
                        Ok(b) => b.min(input.amount.0),
                        Err(_) => input.amount.0,
                    };
                    if token_balance.is_zero() {
                        skipped += 1;
                        continue;
                    }
                    let calldata = IErc20::transferCall {
                        to: destination,
                        value: token_balance,
                    }
                    .abi_encode();
                    self.send_one(
                        input.index,
                        from,
                        gas_price,
                        TOKEN_GAS_LIMIT,
                        contract_address,
                        U256::ZERO,
                        calldata.into(),
                        token_balance,
                        token,
                        &writer,
                    )
                    .await
                }
            };

            match outcome {
                Ok(amount) => {
                    broadcast += 1;
                    total_swept = total_swept + RawAmount(amount);
                }
                Err(e) => {
                    tracing::error!(sweep_id, index = input.index, error = %e, "sweep tx failed");
                    writer
                        .advance(input.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                        .await;
                    publish_tx_status(
                        &self.hub,
                        &sweep_id,
                        Chain::Bsc,
                        input.index,
                        TxStateStatus::Failed,
                        None,
                    );
                    failed += 1;
                }
            }
        }

        self.hub.publish(
            events::TX_COMPLETE,
            &TxCompletePayload {
                sweep_id: &sweep_id,
                chain: Chain::Bsc,
                token,
                broadcast,
                confirmed: 0,
                failed,
                uncertain: 0,
                skipped,
                total_swept,
            },
        );
    }

    /// Signs, broadcasts (with the single nonce retry), persists, and spawns
    /// the receipt poller for one sweep leg. Returns the swept amount.
    #[allow(clippy::too_many_arguments)]
    async fn send_one(
        &self,
        index: u32,
        from: Address,
        gas_price: u128,
        gas_limit: u64,
        to: Address,
        value: U256,
        input: Bytes,
        swept_amount: U256,
        token: Token,
        writer: &TxStateWriter,
    ) -> Result<U256, EngineError> {
        let nonce = self.pending_nonce(from).await?;
        writer
            .advance(index, TxStateKind::Sweep, TxStateStatus::Signed, None)
            .await;
        let hash = self
            .send_with_nonce_retry(index, from, nonce, gas_price, gas_limit, to, value, input)
            .await?;
        let hash_hex = format!("{hash:#x}");
        writer
            .advance(index, TxStateKind::Sweep, TxStateStatus::Broadcast, Some(&hash_hex))
            .await;
        publish_tx_status(
            &self.hub,
            writer.sweep_id(),
            Chain::Bsc,
            index,
            TxStateStatus::Broadcast,
            Some(&hash_hex),
        );
        let record = TxRecord {
            chain: Chain::Bsc,
            tx_hash: hash_hex.clone(),
            direction: Direction::Out,
            token,
            amount: RawAmount(swept_amount),
            from_addr: format!("{from:#x}"),
            to_addr: format!("{to:#x}"),
            block_number: None,
            block_time: None,
            gas: Some(RawAmount(U256::from(gas_price) * U256::from(gas_limit))),
            status: TxStatus::Pending,
            created_at: UnixTimestamp::now(),
        };
        if let Err(e) = self.store.record_transaction(&record).await {
            tracing::error!(error = %e, "failed to record sweep tx");
        }
        self.spawn_receipt_poll(hash, index, TxStateKind::Sweep, writer.clone());
        Ok(swept_amount)
    }

    /// Polls for the receipt; a timeout marks the leg uncertain.
    fn spawn_receipt_poll(
        &self,
        hash: B256,
        index: u32,
        kind: TxStateKind,
        writer: TxStateWriter,
    ) {
        let pool = Arc::clone(&self.pool);
        let store = self.store.clone();
        let hub = Arc::clone(&self.hub);
        self.tracker.spawn(async move {
            let hash_hex = format!("{hash:#x}");
            let deadline = Instant::now() + RECEIPT_TIMEOUT;
            loop {
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                let receipt = pool
                    .execute(move |p| async move { p.receipt(hash).await })
                    .await;
                if let Ok(Some(receipt)) = receipt {
                    let ok = receipt.status();
                    let status = if ok {
                        TxStateStatus::Confirmed
                    } else {
                        TxStateStatus::Failed
                    };
                    writer.advance(index, kind, status, Some(&hash_hex)).await;
                    publish_tx_status(&hub, writer.sweep_id(), Chain::Bsc, index, status, Some(&hash_hex));
                    let _ = store
                        .record_transaction(&TxRecord {
                            chain: Chain::Bsc,
                            tx_hash: hash_hex.clone(),
                            direction: Direction::Out,
                            token: Token::Native,
                            amount: RawAmount::ZERO,
                            from_addr: String::new(),
                            to_addr: String::new(),
                            block_number: receipt.block_number.map(|n| n as i64),
                            block_time: None,
                            gas: None,
                            status: if ok { TxStatus::Confirmed } else { TxStatus::Failed },
                            created_at: UnixTimestamp::now(),
                        })
                        .await;
                    return;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(hash = %hash_hex, "receipt window elapsed, marking uncertain");
                    writer
                        .advance(index, kind, TxStateStatus::Uncertain, Some(&hash_hex))
                        .await;
                    publish_tx_status(
                        &hub,
                        writer.sweep_id(),
                        Chain::Bsc,
                        index,
                        TxStateStatus::Uncertain,
                        Some(&hash_hex),
                    );
                    return;
                }
            }
        });
    }

    /// Funds token-holding addresses that cannot pay for their own transfer.
    ///
    /// One transaction per needy target, sent sequentially from the chosen
    /// source with a locally incremented nonce. Already-confirmed pre-seeds
    /// for a target are skipped, which makes retried runs idempotent.
    pub async fn gas_preseed(
        &self,
        source_index: u32,
        token: Token,
    ) -> Result<SweepStarted, EngineError> {
        let _ = self.token_contract(token)?.ok_or(EngineError::UnsupportedToken {
            chain: Chain::Bsc,
            token,
        })?;
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| EngineError::Busy(Chain::Bsc))?;

        let source_address = self
            .store
            .address_by_index(Chain::Bsc, source_index)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("no address at index {source_index}")))?;
        let source = Address::from_str(&source_address)
            .map_err(|_| EngineError::InvalidDestination(source_address.clone()))?;

        let gas_price = self.buffered_gas_price().await?;
        let amount = self.preseed_amount().await;

        // Needy: funded in the token, no native gas, not already seeded.
        let funded = self.store.funded_addresses(Chain::Bsc, token).await?;
        let mut targets: Vec<(u32, Address)> = Vec::new();
        for (address, _) in &funded {
            if address.index == source_index {
                continue;
            }
            if self
                .store
                .has_confirmed_preseed(Chain::Bsc, address.index)
                .await?
            {
                continue;
            }
            let Ok(target) = Address::from_str(&address.address) else {
                continue;
            };
            let native = self.on_chain_native(target).await?;
            if native >= amount {
                continue;
            }
            targets.push((address.index, target));
        }
        if targets.is_empty() {
            return Err(EngineError::NothingToSweep);
        }

        // The source must pre-cover every transfer plus its gas.
        let per_target = amount + U256::from(gas_price) * U256::from(NATIVE_GAS_LIMIT);
        let required = per_target * U256::from(targets.len() as u64);
        let available = self.on_chain_native(source).await?;
        if available < required {
            return Err(EngineError::InsufficientPreseedSource {
                index: source_index,
                available: RawAmount(available),
                required: RawAmount(required),
            });
        }

        let sweep_id = new_sweep_id();
        let writer = TxStateWriter::new(self.store.clone(), sweep_id.clone(), Chain::Bsc);
        let started = SweepStarted {
            sweep_id,
            chain: Chain::Bsc,
            token,
            tx_count: targets.len(),
        };

        let engine = Arc::new(self.clone_parts());
        self.tracker.spawn(async move {
            let _guard = guard;
            engine
                .run_preseed(source_index, source, targets, amount, gas_price, writer)
                .await;
        });
        Ok(started)
    }

    async fn run_preseed(
        self: Arc<Self>,
        source_index: u32,
        source: Address,
        targets: Vec<(u32, Address)>,
        amount: U256,
        gas_price: u128,
        writer: TxStateWriter,
    ) {
        let sweep_id = writer.sweep_id().to_string();
        // One fetch per run; incremented locally across the sequence.
        let mut nonce = match self.pending_nonce(source).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(sweep_id, error = %e, "preseed nonce fetch failed");
                return;
            }
        };
        let mut broadcast = 0usize;
        let mut failed = 0usize;

        for (target_index, target) in targets {
            writer.begin(target_index, TxStateKind::Preseed, Some(nonce as i64)).await;
            let sent = self
                .send_with_nonce_retry(
                    source_index,
                    source,
                    nonce,
                    gas_price,
                    NATIVE_GAS_LIMIT,
                    target,
                    amount,
                    Bytes::new(),
                )
                .await;
            match sent {
                Ok(hash) => {
                    let hash_hex = format!("{hash:#x}");
                    writer
                        .advance(target_index, TxStateKind::Preseed, TxStateStatus::Broadcast, Some(&hash_hex))
                        .await;
                    publish_tx_status(
                        &self.hub,
                        &sweep_id,
                        Chain::Bsc,
                        target_index,
                        TxStateStatus::Broadcast,
                        Some(&hash_hex),
                    );
                    self.spawn_receipt_poll(hash, target_index, TxStateKind::Preseed, writer.clone());
                    broadcast += 1;
                    nonce += 1;
                }
                Err(e) => {
                    tracing::error!(sweep_id, target_index, error = %e, "preseed tx failed");
                    writer
                        .advance(target_index, TxStateKind::Preseed, TxStateStatus::Failed, None)
                        .await;
                    publish_tx_status(
                        &self.hub,
                        &sweep_id,
                        Chain::Bsc,
                        target_index,
                        TxStateStatus::Failed,
                        None,
                    );
                    failed += 1;
                    // A broadcast failure leaves the nonce unconsumed.
                }
            }
        }

        self.hub.publish(
            events::TX_COMPLETE,
            &TxCompletePayload {
                sweep_id: &sweep_id,
                chain: Chain::Bsc,
                token: Token::Native,
                broadcast,
                confirmed: 0,
                failed,
                uncertain: 0,
                skipped: 0,
                total_swept: RawAmount(amount * U256::from(broadcast as u64)),
            },
        );
    }

    fn clone_parts(&self) -> BscEngine {
        BscEngine {
            store: self.store.clone(),
            wallet: self.wallet.clone(),
            pool: Arc::clone(&self.pool),
            ankr: BscRpcProvider::ankr(self.network),
            hub: Arc::clone(&self.hub),
            tracker: self.tracker.clone(),
            lock: Arc::clone(&self.lock),
            network: self.network,
        }
    }
}

#[async_trait::async_trait]
impl SweepEngine for BscEngine {
    fn chain(&self) -> Chain {
        Chain::Bsc
    }

    async fn preview(&self, request: &SweepRequest) -> Result<SweepPreview, EngineError> {
        let destination = Self::parse_destination(&request.destination)?;
        let contract = self.token_contract(request.token)?;
        let gas_price = self.buffered_gas_price().await?;
        let funded = self.store.funded_addresses(Chain::Bsc, request.token).await?;
        if funded.is_empty() {
            return Err(EngineError::NothingToSweep);
        }

        let mut inputs = Vec::with_capacity(funded.len());
        let mut total_input = RawAmount::ZERO;
        let mut fee_estimate = U256::ZERO;
        let mut net_output = U256::ZERO;
        for (address, amount) in &funded {
            total_input = total_input + *amount;
            match contract {
                None => {
                    let fee = U256::from(gas_price) * U256::from(NATIVE_GAS_LIMIT);
                    if amount.0 > fee {
                        fee_estimate += fee;
                        net_output += amount.0 - fee;
                    }
                    inputs.push(PreviewInput {
                        index: address.index,
                        address: address.address.clone(),
                        amount: *amount,
                        has_gas: None,
                        needs_fee_payer: None,
                    });
                }
                Some(_) => {
                    let native = self
                        .store
                        .balance_of(Chain::Bsc, address.index, Token::Native)
                        .await?;
                    let has_gas = !native.is_zero();
                    if has_gas {
                        fee_estimate += U256::from(gas_price) * U256::from(TOKEN_GAS_LIMIT);
                        net_output += amount.0;
                    }
                    inputs.push(PreviewInput {
                        index: address.index,
                        address: address.address.clone(),
                        amount: *amount,
                        has_gas: Some(has_gas),
                        needs_fee_payer: None,
                    });
                }
            }
        }

        Ok(SweepPreview {
            chain: Chain::Bsc,
            token: request.token,
            destination: format!("{destination:#x}"),
            inputs,
            total_input,
            fee_estimate: RawAmount(fee_estimate),
            net_output: RawAmount(net_output),
            utxo_count: None,
            gas_price: Some(gas_price),
        })
    }

    async fn execute(&self, request: SweepRequest) -> Result<SweepStarted, EngineError> {
        let destination = Self::parse_destination(&request.destination)?;
        let contract = self.token_contract(request.token)?;
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| EngineError::Busy(Chain::Bsc))?;

        let gas_price = self.buffered_gas_price().await?;
        // Spike guard: refuse to burn fees the user never approved.
        if let Some(preview_gas) = request.options.preview_gas_price {
            if preview_gas > 0 && gas_price > preview_gas * 2 {
                return Err(EngineError::GasPriceSpike {
                    current: gas_price,
                    preview: preview_gas,
                });
            }
        }

        let funded = self.store.funded_addresses(Chain::Bsc, request.token).await?;
        if funded.is_empty() {
            return Err(EngineError::NothingToSweep);
        }
        let inputs: Vec<PreviewInput> = funded
            .iter()
            .map(|(address, amount)| PreviewInput {
                index: address.index,
                address: address.address.clone(),
                amount: *amount,
                has_gas: None,
                needs_fee_payer: None,
            })
            .collect();

        let sweep_id = new_sweep_id();
        let writer = TxStateWriter::new(self.store.clone(), sweep_id.clone(), Chain::Bsc);
        let started = SweepStarted {
            sweep_id,
            chain: Chain::Bsc,
            token: request.token,
            tx_count: inputs.len(),
        };

        let engine = Arc::new(self.clone_parts());
        let token = request.token;
        self.tracker.spawn(async move {
            let _guard = guard;
            engine
                .run_sweep(inputs, destination, token, contract, gas_price, writer)
                .await;
        });
        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_buffer_adds_twenty_percent() {
        assert_eq!(5_000_000_000u128 * GAS_BUFFER_NUM / GAS_BUFFER_DEN, 6_000_000_000);
    }

    #[test]
    fn nonce_too_low_detection_is_case_insensitive() {
        let err = EngineError::Internal("RPC said: Nonce Too Low (got 4)".to_string());
        assert!(BscEngine::is_nonce_too_low(&err));
        let err = EngineError::Internal("insufficient funds".to_string());
        assert!(!BscEngine::is_nonce_too_low(&err));
    }

    #[test]
    fn spike_guard_math() {
        // preview 5 gwei, current 11 gwei: rejected; current 9 gwei: fine.
        assert!(11_000_000_000u128 > 5_000_000_000u128 * 2);
        assert!(9_000_000_000u128 <= 5_000_000_000u128 * 2);
    }
}
