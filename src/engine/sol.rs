//! SOL sweep engine.
//!
//! Transfers are grouped into legacy transactions kept under the 1232-byte
//! packet limit; each batch's first signer pays the fee. Token sweeps use a
//! user-chosen fee payer (SOL supports first-signer fee payment, so no gas
//! pre-seed is needed) and auto-create the destination ATA when missing.
//!
//! Blockhashes are cached for 10 seconds and additionally refreshed when the
//! estimated chain height runs within 60 blocks of `lastValidBlockHeight`;
//! large multi-transaction sweeps therefore re-fetch per batch.
//! Confirmation uses `finalized` signature statuses; three consecutive RPC
//! errors mark the transaction uncertain, never failed.

use solana_keypair::Keypair;
use solana_message::{Hash, Message};
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer as _;
use solana_transaction::Transaction;
use solana_transaction_status_client_types::TransactionConfirmationStatus;
use spl_token::solana_program::instruction::{AccountMeta, Instruction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};
use crate::derive::Wallet;
use crate::events::{self, EventHub};
use crate::providers::sol::{
    FEE_PER_SIGNATURE, SolRpcProvider, associated_token_program_id, derive_ata, token_mint,
};
use crate::providers::ProviderPool;
use crate::store::{Direction, Store, TxRecord, TxStateKind, TxStateStatus, TxStatus};

use super::{
    EngineError, PreviewInput, SweepEngine, SweepPreview, SweepRequest, SweepStarted,
    TxCompletePayload, TxStateWriter, new_sweep_id, publish_tx_status,
};

/// Solana packet size; a transaction above this will not propagate.
const MAX_TX_BYTES: u64 = 1232;
/// Sources attempted per batch before the size check shrinks it.
const BATCH_CEILING: usize = 18;
const BLOCKHASH_TTL: Duration = Duration::from_secs(10);
/// Refresh when the estimated height is this close to lastValidBlockHeight.
const BLOCKHASH_EXPIRY_MARGIN_BLOCKS: u64 = 60;
const SLOTS_PER_SECOND: f64 = 2.5;
/// Rent-exempt reserve for a token account, paid by the fee payer on ATA
/// creation.
const ATA_RENT_LAMPORTS: u64 = 2_039_280;
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(180);
const CONFIRM_MAX_RPC_ERRORS: u32 = 3;
const ATA_VISIBILITY_ATTEMPTS: u32 = 5;

fn system_program_id() -> Pubkey {
    Pubkey::from_str_const("11111111111111111111111111111111")
}

/// `SystemInstruction::Transfer` is variant 2 of the system program's
/// bincode layout: u32 tag then u64 lamports, both little-endian.
fn system_transfer(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&2u32.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());
    Instruction {
        program_id: system_program_id(),
        accounts: vec![AccountMeta::new(*from, true), AccountMeta::new(*to, false)],
        data,
    }
}

/// CreateIdempotent (tag 1): succeeds whether or not the ATA already exists,
/// which keeps the create race with another sender harmless.
fn create_ata_instruction(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
    let ata = derive_ata(owner, mint);
    Instruction {
        program_id: associated_token_program_id(),
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(ata, false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program_id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: vec![1],
    }
}

struct CachedBlockhash {
    hash: Hash,
    last_valid_block_height: u64,
    fetch_height: u64,
    fetched_at: Instant,
}

struct SolInput {
    index: u32,
    pubkey: Pubkey,
    amount: u64,
}

pub struct SolEngine {
    store: Store,
    wallet: Wallet,
    pool: Arc<ProviderPool<SolRpcProvider>>,
    hub: Arc<EventHub>,
    tracker: TaskTracker,
    lock: Arc<Mutex<()>>,
    network: Network,
    blockhash: Mutex<Option<CachedBlockhash>>,
}

impl SolEngine {
    pub fn new(
        store: Store,
        wallet: Wallet,
        pool: Arc<ProviderPool<SolRpcProvider>>,
        hub: Arc<EventHub>,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        let network = wallet.network();
        Arc::new(Self {
            store,
            wallet,
            pool,
            hub,
            tracker,
            lock: Arc::new(Mutex::new(())),
            network,
            blockhash: Mutex::new(None),
        })
    }

    fn parse_destination(raw: &str) -> Result<Pubkey, EngineError> {
        Pubkey::from_str(raw).map_err(|_| EngineError::InvalidDestination(raw.to_string()))
    }

    fn mint_for(&self, token: Token) -> Result<Option<Pubkey>, EngineError> {
        match token {
            Token::Native => Ok(None),
            other => token_mint(self.network, other)
                .map(Some)
                .ok_or(EngineError::UnsupportedToken {
                    chain: Chain::Sol,
                    token: other,
                }),
        }
    }

    /// Blockhash with TTL and near-expiry refresh.
    async fn blockhash(&self) -> Result<Hash, EngineError> {
        let mut cache = self.blockhash.lock().await;
        if let Some(cached) = &*cache {
            let age = cached.fetched_at.elapsed();
            let estimated_height =
                cached.fetch_height + (age.as_secs_f64() * SLOTS_PER_SECOND) as u64;
            if age < BLOCKHASH_TTL
                && estimated_height + BLOCKHASH_EXPIRY_MARGIN_BLOCKS
                    < cached.last_valid_block_height
            {
                return Ok(cached.hash);
            }
        }
        let (hash, last_valid_block_height) = self
            .pool
            .execute(|p| async move { p.latest_blockhash().await })
            .await?;
        let fetch_height = self
            .pool
            .execute(|p| async move { p.block_height().await })
            .await
            .unwrap_or_else(|_| last_valid_block_height.saturating_sub(150));
        *cache = Some(CachedBlockhash {
            hash,
            last_valid_block_height,
            fetch_height,
            fetched_at: Instant::now(),
        });
        Ok(hash)
    }

    async fn funded_inputs(&self, token: Token) -> Result<Vec<SolInput>, EngineError> {
        let funded = self.store.funded_addresses(Chain::Sol, token).await?;
        let mut inputs = Vec::with_capacity(funded.len());
        for (address, amount) in funded {
            let Ok(pubkey) = Pubkey::from_str(&address.address) else {
                continue;
            };
            let Some(amount) = amount.to_u64() else {
                continue;
            };
            if amount == 0 {
                continue;
            }
            inputs.push(SolInput {
                index: address.index,
                pubkey,
                amount,
            });
        }
        if inputs.is_empty() {
            return Err(EngineError::NothingToSweep);
        }
        Ok(inputs)
    }

    /// Splits sources into batches whose signed size stays under the packet
    /// limit, measured on a provisionally assembled transaction.
    fn plan_batches(inputs: &[SolInput], extra_signers: usize) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        while start < inputs.len() {
            let mut len = (inputs.len() - start).min(BATCH_CEILING);
            while len > 1 {
                let signer_count = len + extra_signers;
                // 64 bytes per signature + ~(32 key + ~20 instruction) per
                // transfer + fixed message overhead.
                let estimate = 1
                    + 64 * signer_count as u64
                    + 3
                    + 1
                    + 32 * (signer_count as u64 + 2)
                    + 32
                    + 1
                    + 20 * len as u64;
                if estimate <= MAX_TX_BYTES {
                    break;
                }
                len -= 1;
            }
            batches.push((start..start + len).collect());
            start += len;
        }
        batches
    }

    /// Exact wire size of a signed transaction.
    fn tx_size(tx: &Transaction) -> u64 {
        bincode::serialized_size(tx).unwrap_or(u64::MAX)
    }

    async fn dest_ata_missing(&self, destination: &Pubkey, mint: &Pubkey) -> Result<bool, EngineError> {
        let ata = derive_ata(destination, mint);
        let exists = self
            .pool
            .execute(move |p| async move { p.account_exists(&ata).await })
            .await?;
        Ok(!exists)
    }

    async fn payer_lamports(&self, payer: &Pubkey) -> Result<u64, EngineError> {
        let payer = *payer;
        Ok(self
            .pool
            .execute(move |p| async move { p.lamports(&payer).await })
            .await?)
    }

    async fn run_sweep(
        self: Arc<Self>,
        inputs: Vec<SolInput>,
        destination: Pubkey,
        token: Token,
        mint: Option<Pubkey>,
        fee_payer_index: Option<u32>,
        create_dest_ata: bool,
        writer: TxStateWriter,
    ) {
        let sweep_id = writer.sweep_id().to_string();
        let mut broadcast = 0usize;
        let mut failed = 0usize;
        let mut total_swept = RawAmount::ZERO;
        let mut first_batch = true;

        let extra_signers = usize::from(mint.is_some());
        let batches = Self::plan_batches(&inputs, extra_signers);
        for batch in batches {
            let sources: Vec<&SolInput> = batch.iter().map(|i| &inputs[*i]).collect();
            for source in &sources {
                writer.begin(source.index, TxStateKind::Sweep, None).await;
            }

            let built = self
                .build_batch(
                    &sources,
                    &destination,
                    mint.as_ref(),
                    fee_payer_index,
                    create_dest_ata && first_batch,
                )
                .await;
            let (tx, batch_amount) = match built {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(sweep_id, error = %e, "failed to build batch");
                    for source in &sources {
                        writer
                            .advance(source.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                            .await;
                    }
                    failed += sources.len();
                    continue;
                }
            };

            let size = Self::tx_size(&tx);
            if size > MAX_TX_BYTES {
                tracing::error!(sweep_id, size, "batch exceeds packet limit, dropping");
                for source in &sources {
                    writer
                        .advance(source.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                        .await;
                }
                failed += sources.len();
                continue;
            }

            for source in &sources {
                writer
                    .advance(source.index, TxStateKind::Sweep, TxStateStatus::Signed, None)
                    .await;
            }
            let sent = self
                .pool
                .execute(|p| {
                    let tx = tx.clone();
                    async move { p.send_transaction(&tx).await }
                })
                .await;
            match sent {
                Ok(signature) => {
                    let sig_str = signature.to_string();
                    for source in &sources {
                        writer
                            .advance(
                                source.index,
                                TxStateKind::Sweep,
                                TxStateStatus::Broadcast,
                                Some(&sig_str),
                            )
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Sol,
                            source.index,
                            TxStateStatus::Broadcast,
                            Some(&sig_str),
                        );
                    }
                    broadcast += sources.len();
                    total_swept = total_swept + RawAmount::from_u64(batch_amount);
                    let record = TxRecord {
                        chain: Chain::Sol,
                        tx_hash: sig_str.clone(),
                        direction: Direction::Out,
                        token,
                        amount: RawAmount::from_u64(batch_amount),
                        from_addr: sources
                            .first()
                            .map(|s| s.pubkey.to_string())
                            .unwrap_or_default(),
                        to_addr: destination.to_string(),
                        block_number: None,
                        block_time: None,
                        gas: None,
                        status: TxStatus::Pending,
                        created_at: UnixTimestamp::now(),
                    };
                    if let Err(e) = self.store.record_transaction(&record).await {
                        tracing::error!(sweep_id, error = %e, "failed to record sweep tx");
                    }
                    let indexes: Vec<u32> = sources.iter().map(|s| s.index).collect();
                    self.spawn_confirmation(signature, indexes, writer.clone());

                    if create_dest_ata && first_batch {
                        if let Some(mint) = mint.as_ref() {
                            self.spawn_ata_visibility_check(derive_ata(&destination, mint));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(sweep_id, error = %e, "batch broadcast failed");
                    for source in &sources {
                        writer
                            .advance(source.index, TxStateKind::Sweep, TxStateStatus::Failed, None)
                            .await;
                        publish_tx_status(
                            &self.hub,
                            &sweep_id,
                            Chain::Sol,
                            source.index,
                            TxStateStatus::Failed,
                            None,
                        );
                    }
                    failed += sources.len();
                }
            }
            first_batch = false;
        }

        self.hub.publish(
            events::TX_COMPLETE,
            &TxCompletePayload {
                sweep_id: &sweep_id,
                chain: Chain::Sol,
                token,
                broadcast,
                confirmed: 0,
                failed,
                uncertain: 0,
                skipped: 0,
                total_swept,
            },
        );
    }

    /// Assembles and signs one batch. Returns the transaction and the total
    /// amount it moves.
    async fn build_batch(
        &self,
        sources: &[&SolInput],
        destination: &Pubkey,
        mint: Option<&Pubkey>,
        fee_payer_index: Option<u32>,
        include_ata_create: bool,
    ) -> Result<(Transaction, u64), EngineError> {
        let mut keypairs: Vec<Keypair> = Vec::with_capacity(sources.len() + 1);
        let mut instructions: Vec<Instruction> = Vec::new();
        let mut amount_moved = 0u64;

        let (payer_pubkey, payer_is_extra) = match (mint, fee_payer_index) {
            (Some(_), Some(index)) => {
                let payer = self.wallet.sol_signing_key(index)?;
                let pubkey = payer.pubkey();
                let extra = !sources.iter().any(|s| s.index == index);
                keypairs.push(payer);
                (pubkey, extra)
            }
            // Native sweeps: the batch's first source fronts the fee.
            _ => (sources[0].pubkey, false),
        };

        match mint {
            None => {
                let signer_count = sources.len();
                let fee = FEE_PER_SIGNATURE * signer_count as u64;
                for (i, source) in sources.iter().enumerate() {
                    let amount = if source.pubkey == payer_pubkey && i == 0 {
                        source.amount.saturating_sub(fee)
                    } else {
                        source.amount
                    };
                    if amount == 0 {
                        continue;
                    }
                    instructions.push(system_transfer(&source.pubkey, destination, amount));
                    amount_moved += amount;
                }
            }
            Some(mint) => {
                if include_ata_create {
                    instructions.push(create_ata_instruction(&payer_pubkey, destination, mint));
                }
                let dest_ata = derive_ata(destination, mint);
                for source in sources {
                    let source_ata = derive_ata(&source.pubkey, mint);
                    let transfer = spl_token::instruction::transfer(
                        &spl_token::id(),
                        &source_ata,
                        &dest_ata,
                        &source.pubkey,
                        &[],
                        source.amount,
                    )
                    .map_err(|e| EngineError::Internal(format!("spl transfer: {e}")))?;
                    instructions.push(transfer);
                    amount_moved += source.amount;
                }
            }
        }
        if instructions.is_empty() {
            return Err(EngineError::NothingToSweep);
        }

        for source in sources {
            if payer_is_extra || source.pubkey != payer_pubkey || keypairs.is_empty() {
                keypairs.push(self.wallet.sol_signing_key(source.index)?);
            }
        }

        let blockhash = self.blockhash().await?;
        let message = Message::new_with_blockhash(&instructions, Some(&payer_pubkey), &blockhash);
        let signer_refs: Vec<&Keypair> = keypairs.iter().collect();
        let tx = Transaction::new(&signer_refs, message, blockhash);
        Ok((tx, amount_moved))
    }

    /// Polls signature statuses at `finalized`; three consecutive RPC errors
    /// (broadcast observed, finality unverifiable) mark the batch uncertain
    /// rather than failed.
    fn spawn_confirmation(&self, signature: Signature, indexes: Vec<u32>, writer: TxStateWriter) {
        let pool = Arc::clone(&self.pool);
        let store = self.store.clone();
        let hub = Arc::clone(&self.hub);
        self.tracker.spawn(async move {
            let sig_str = signature.to_string();
            let deadline = Instant::now() + CONFIRM_TIMEOUT;
            let mut rpc_errors = 0u32;
            loop {
                tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
                let statuses = pool
                    .execute(|p| async move { p.signature_statuses(&[signature]).await })
                    .await;
                let terminal = match statuses {
                    Ok(statuses) => {
                        rpc_errors = 0;
                        match statuses.into_iter().next().flatten() {
                            Some(status) if status.err.is_some() => Some(TxStateStatus::Failed),
                            Some(status)
                                if matches!(
                                    status.confirmation_status,
                                    Some(TransactionConfirmationStatus::Finalized)
                                ) =>
                            {
                                Some(TxStateStatus::Confirmed)
                            }
                            _ => None,
                        }
                    }
                    Err(e) => {
                        rpc_errors += 1;
                        tracing::warn!(signature = %sig_str, attempt = rpc_errors, error = %e, "status poll failed");
                        if rpc_errors >= CONFIRM_MAX_RPC_ERRORS {
                            Some(TxStateStatus::Uncertain)
                        } else {
                            None
                        }
                    }
                };
                let terminal = match terminal {
                    Some(t) => Some(t),
                    None if Instant::now() >= deadline => Some(TxStateStatus::Uncertain),
                    None => None,
                };
                if let Some(status) = terminal {
                    for index in &indexes {
                        writer
                            .advance(*index, TxStateKind::Sweep, status, Some(&sig_str))
                            .await;
                        publish_tx_status(
                            &hub,
                            writer.sweep_id(),
                            Chain::Sol,
                            *index,
                            status,
                            Some(&sig_str),
                        );
                    }
                    let record_status = match status {
                        TxStateStatus::Confirmed => TxStatus::Confirmed,
                        TxStateStatus::Failed => TxStatus::Failed,
                        _ => TxStatus::Uncertain,
                    };
                    let _ = store
                        .record_transaction(&TxRecord {
                            chain: Chain::Sol,
                            tx_hash: sig_str.clone(),
                            direction: Direction::Out,
                            token: Token::Native,
                            amount: RawAmount::ZERO,
                            from_addr: String::new(),
                            to_addr: String::new(),
                            block_number: None,
                            block_time: None,
                            gas: None,
                            status: record_status,
                            created_at: UnixTimestamp::now(),
                        })
                        .await;
                    return;
                }
            }
        });
    }

    /// Brief post-create visibility check; a miss is logged, never fatal.
    fn spawn_ata_visibility_check(&self, ata: Pubkey) {
        let pool = Arc::clone(&self.pool);
        self.tracker.spawn(async move {
            for attempt in 1..=ATA_VISIBILITY_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2)).await;
                match pool
                    .execute(move |p| async move { p.account_exists(&ata).await })
                    .await
                {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "ata visibility query failed");
                    }
                }
            }
            tracing::warn!(ata = %ata, "destination ATA not visible after create");
        });
    }

    fn clone_parts(&self) -> SolEngine {
        SolEngine {
            store: self.store.clone(),
            wallet: self.wallet.clone(),
            pool: Arc::clone(&self.pool),
            hub: Arc::clone(&self.hub),
            tracker: self.tracker.clone(),
            lock: Arc::clone(&self.lock),
            network: self.network,
            blockhash: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl SweepEngine for SolEngine {
    fn chain(&self) -> Chain {
        Chain::Sol
    }

    async fn preview(&self, request: &SweepRequest) -> Result<SweepPreview, EngineError> {
        let destination = Self::parse_destination(&request.destination)?;
        let mint = self.mint_for(request.token)?;
        let inputs = self.funded_inputs(request.token).await?;

        let extra_signers = usize::from(mint.is_some());
        let batches = Self::plan_batches(&inputs, extra_signers);
        let signature_fees: u64 = batches
            .iter()
            .map(|b| FEE_PER_SIGNATURE * (b.len() + extra_signers) as u64)
            .sum();
        let ata_rent = match mint.as_ref() {
            Some(mint) if self.dest_ata_missing(&destination, mint).await? => ATA_RENT_LAMPORTS,
            _ => 0,
        };
        let fee_estimate = signature_fees + ata_rent;

        let total_input: u64 = inputs.iter().map(|i| i.amount).sum();
        let net_output = match mint {
            // Native fees come out of the swept lamports.
            None => total_input.saturating_sub(fee_estimate),
            // Token fees are paid by the fee payer, not the swept amount.
            Some(_) => total_input,
        };
        let preview_inputs = inputs
            .iter()
            .map(|i| PreviewInput {
                index: i.index,
                address: i.pubkey.to_string(),
                amount: RawAmount::from_u64(i.amount),
                has_gas: None,
                needs_fee_payer: mint.as_ref().map(|_| true),
            })
            .collect();

        Ok(SweepPreview {
            chain: Chain::Sol,
            token: request.token,
            destination: destination.to_string(),
            inputs: preview_inputs,
            total_input: RawAmount::from_u64(total_input),
            fee_estimate: RawAmount::from_u64(fee_estimate),
            net_output: RawAmount::from_u64(net_output),
            utxo_count: None,
            gas_price: None,
        })
    }

    async fn execute(&self, request: SweepRequest) -> Result<SweepStarted, EngineError> {
        let destination = Self::parse_destination(&request.destination)?;
        let mint = self.mint_for(request.token)?;
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| EngineError::Busy(Chain::Sol))?;

        let inputs = self.funded_inputs(request.token).await?;
        let fee_payer_index = match mint {
            Some(_) => Some(
                request
                    .options
                    .fee_payer_index
                    .ok_or(EngineError::FeePayerRequired)?,
            ),
            None => None,
        };

        let mut create_dest_ata = false;
        if let (Some(mint_key), Some(payer_index)) = (mint.as_ref(), fee_payer_index) {
            create_dest_ata = self.dest_ata_missing(&destination, mint_key).await?;
            let payer = self.wallet.sol_signing_key(payer_index)?;
            let payer_pubkey = payer.pubkey();
            drop(payer);
            let extra = usize::from(!inputs.iter().any(|i| i.index == payer_index));
            let batches = Self::plan_batches(&inputs, 1);
            let required: u64 = batches
                .iter()
                .map(|b| FEE_PER_SIGNATURE * (b.len() + extra) as u64)
                .sum::<u64>()
                + if create_dest_ata { ATA_RENT_LAMPORTS } else { 0 };
            let available = self.payer_lamports(&payer_pubkey).await?;
            if available < required {
                return Err(EngineError::InsufficientFeePayer {
                    index: payer_index,
                    available,
                    required,
                });
            }
        }

        let sweep_id = new_sweep_id();
        let writer = TxStateWriter::new(self.store.clone(), sweep_id.clone(), Chain::Sol);
        let extra_signers = usize::from(mint.is_some());
        let started = SweepStarted {
            sweep_id,
            chain: Chain::Sol,
            token: request.token,
            tx_count: Self::plan_batches(&inputs, extra_signers).len(),
        };

        let engine = Arc::new(self.clone_parts());
        let token = request.token;
        self.tracker.spawn(async move {
            let _guard = guard;
            engine
                .run_sweep(
                    inputs,
                    destination,
                    token,
                    mint,
                    fee_payer_index,
                    create_dest_ata,
                    writer,
                )
                .await;
        });
        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(index: u32, amount: u64) -> SolInput {
        SolInput {
            index,
            pubkey: Pubkey::new_unique(),
            amount,
        }
    }

    #[test]
    fn system_transfer_encodes_the_bincode_layout() {
        let from = Pubkey::new_unique();
        let to = Pubkey::new_unique();
        let ix = system_transfer(&from, &to, 1_000_000);
        assert_eq!(ix.program_id, system_program_id());
        assert_eq!(&ix.data[..4], &2u32.to_le_bytes());
        assert_eq!(&ix.data[4..], &1_000_000u64.to_le_bytes());
        assert!(ix.accounts[0].is_signer);
        assert!(!ix.accounts[1].is_signer);
    }

    #[test]
    fn batches_respect_the_packet_budget() {
        let inputs: Vec<SolInput> = (0..40).map(|i| input(i, 1_000_000)).collect();
        let batches = SolEngine::plan_batches(&inputs, 0);
        let covered: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(covered, 40);
        for batch in &batches {
            let signer_count = batch.len();
            let estimate = 1 + 64 * signer_count as u64 + 3 + 1
                + 32 * (signer_count as u64 + 2) + 32 + 1 + 20 * batch.len() as u64;
            assert!(estimate <= MAX_TX_BYTES, "batch of {} too big", batch.len());
        }
        // Every batch except possibly the last is maximal.
        assert!(batches[0].len() > 1);
    }

    #[test]
    fn single_source_batches_are_allowed_even_if_tight() {
        let inputs = vec![input(0, 10)];
        let batches = SolEngine::plan_batches(&inputs, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![0]);
    }

    #[test]
    fn ata_create_is_idempotent_variant() {
        let payer = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mint = token_mint(Network::Mainnet, Token::Usdc).unwrap();
        let ix = create_ata_instruction(&payer, &owner, &mint);
        assert_eq!(ix.data, vec![1]);
        assert_eq!(ix.program_id, associated_token_program_id());
        assert_eq!(ix.accounts.len(), 6);
        assert_eq!(ix.accounts[1].pubkey, derive_ata(&owner, &mint));
    }
}
