//! Solana providers over the nonblocking RPC client.
//!
//! Lamport balances come from `getMultipleAccounts`; SPL balances from the
//! same call against deterministically derived associated token accounts
//! (never queried for existence first). The watch side combines
//! `getSignaturesForAddress` with per-signature `getTransaction` meta and
//! computes the watched address's balance delta.

use solana_account::Account;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcTransactionConfig};
use solana_commitment_config::CommitmentConfig;
use solana_message::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::Transaction;
use solana_transaction_status_client_types::option_serializer::OptionSerializer;
use solana_transaction_status_client_types::{
    EncodedTransaction, TransactionConfirmationStatus, TransactionStatus, UiMessage,
    UiTransactionEncoding, UiTransactionTokenBalance,
};
use spl_token::solana_program::program_pack::Pack;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};

use super::{
    BalanceBatch, BalanceProvider, IncomingTx, ProviderError, ProviderMeta, WatchProvider,
};

/// getMultipleAccounts accepts at most 100 keys per call.
const ACCOUNTS_PER_CALL: usize = 100;

/// SPL mint for (network, token); `None` for the native coin.
pub fn token_mint(network: Network, token: Token) -> Option<Pubkey> {
    let mint = match (network, token) {
        (_, Token::Native) => return None,
        (Network::Mainnet, Token::Usdc) => "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        (Network::Mainnet, Token::Usdt) => "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
        (Network::Testnet, Token::Usdc) => "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb",
        (Network::Testnet, Token::Usdt) => "EJwZgeZrdC8TXTQbQBoL6bfuAnFUUy1PVCMB4DYPzVaS",
    };
    Some(Pubkey::from_str_const(mint))
}

/// The associated-token-account program.
pub fn associated_token_program_id() -> Pubkey {
    Pubkey::from_str_const("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL")
}

/// Deterministic ATA derivation; no RPC round-trip.
pub fn derive_ata(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), spl_token::id().as_ref(), mint.as_ref()],
        &associated_token_program_id(),
    )
    .0
}

/// One Solana RPC endpoint.
pub struct SolRpcProvider {
    name: &'static str,
    client: Arc<RpcClient>,
    network: Network,
}

impl SolRpcProvider {
    pub fn new(name: &'static str, url: &str, network: Network) -> Self {
        Self {
            name,
            client: Arc::new(RpcClient::new(url.to_string())),
            network,
        }
    }

    /// Default rotation set. A premium endpoint, when configured, goes first.
    pub fn defaults(network: Network, premium: Option<&str>) -> Vec<Self> {
        let mut providers = Vec::new();
        if let Some(url) = premium {
            providers.push(Self::new("premium", url, network));
        }
        match network {
            Network::Mainnet => {
                providers.push(Self::new(
                    "mainnet-beta",
                    "https://api.mainnet-beta.solana.com",
                    network,
                ));
                providers.push(Self::new(
                    "publicnode",
                    "https://solana-rpc.publicnode.com",
                    network,
                ));
            }
            Network::Testnet => {
                providers.push(Self::new(
                    "devnet",
                    "https://api.devnet.solana.com",
                    network,
                ));
                providers.push(Self::new(
                    "testnet",
                    "https://api.testnet.solana.com",
                    network,
                ));
            }
        }
        providers
    }

    fn err(&self, err: ClientError) -> ProviderError {
        classify_sol(self.name, err)
    }

    async fn accounts(&self, pubkeys: &[Pubkey]) -> Result<Vec<Option<Account>>, ProviderError> {
        let mut out = Vec::with_capacity(pubkeys.len());
        for chunk in pubkeys.chunks(ACCOUNTS_PER_CALL) {
            let accounts = self
                .client
                .get_multiple_accounts(chunk)
                .await
                .map_err(|e| self.err(e))?;
            out.extend(accounts);
        }
        Ok(out)
    }

    pub async fn lamports(&self, pubkey: &Pubkey) -> Result<u64, ProviderError> {
        self.client.get_balance(pubkey).await.map_err(|e| self.err(e))
    }

    /// Whether an account exists at all; used for ATA visibility checks.
    pub async fn account_exists(&self, pubkey: &Pubkey) -> Result<bool, ProviderError> {
        let accounts = self.accounts(&[*pubkey]).await?;
        Ok(accounts.first().map(|a| a.is_some()).unwrap_or(false))
    }

    /// Latest blockhash with its last-valid block height.
    pub async fn latest_blockhash(&self) -> Result<(Hash, u64), ProviderError> {
        self.client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn block_height(&self) -> Result<u64, ProviderError> {
        self.client.get_block_height().await.map_err(|e| self.err(e))
    }

    pub async fn send_transaction(&self, tx: &Transaction) -> Result<Signature, ProviderError> {
        self.client
            .send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn signature_statuses(
        &self,
        signatures: &[Signature],
    ) -> Result<Vec<Option<TransactionStatus>>, ProviderError> {
        let response = self
            .client
            .get_signature_statuses(signatures)
            .await
            .map_err(|e| self.err(e))?;
        Ok(response.value)
    }

}

/// Lamports per signature under the flat legacy fee schedule.
pub const FEE_PER_SIGNATURE: u64 = 5_000;

impl ProviderMeta for SolRpcProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn chain(&self) -> Chain {
        Chain::Sol
    }

    fn rate_limit_per_minute(&self) -> u32 {
        100
    }

    fn max_batch_size(&self) -> usize {
        100
    }
}

#[async_trait::async_trait]
impl BalanceProvider for SolRpcProvider {
    async fn get_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, ProviderError> {
        let mut owners = Vec::with_capacity(addresses.len());
        for raw in addresses {
            let Ok(pubkey) = Pubkey::from_str(raw) else {
                return Err(ProviderError::Client {
                    provider: self.name.to_string(),
                    message: format!("malformed Solana address {raw:?}"),
                });
            };
            owners.push(pubkey);
        }

        let keys: Vec<Pubkey> = match token {
            Token::Native => owners.clone(),
            other => {
                let mint = token_mint(self.network, other).ok_or_else(|| {
                    ProviderError::Client {
                        provider: self.name.to_string(),
                        message: format!("{other} has no mint on {}", self.network),
                    }
                })?;
                owners.iter().map(|o| derive_ata(o, &mint)).collect()
            }
        };

        let accounts = self.accounts(&keys).await?;
        let mut batch = BalanceBatch::default();
        for (raw, account) in addresses.iter().zip(accounts) {
            let amount = match (token, account) {
                // A missing account is a real answer: zero balance.
                (_, None) => RawAmount::ZERO,
                (Token::Native, Some(account)) => RawAmount::from_u64(account.lamports),
                (_, Some(account)) => match spl_token::state::Account::unpack(&account.data) {
                    Ok(token_account) => RawAmount::from_u64(token_account.amount),
                    Err(_) => {
                        batch.failed.push(raw.clone());
                        continue;
                    }
                },
            };
            batch.balances.insert(raw.clone(), amount);
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl WatchProvider for SolRpcProvider {
    async fn incoming_since(
        &self,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, ProviderError> {
        let pubkey = Pubkey::from_str(address).map_err(|_| ProviderError::Client {
            provider: self.name.to_string(),
            message: format!("malformed Solana address {address:?}"),
        })?;
        let signatures = self
            .client
            .get_signatures_for_address_with_config(
                &pubkey,
                GetConfirmedSignaturesForAddress2Config {
                    limit: Some(25),
                    ..GetConfirmedSignaturesForAddress2Config::default()
                },
            )
            .await
            .map_err(|e| self.err(e))?;

        let mut incoming = Vec::new();
        for entry in signatures {
            if entry.err.is_some() {
                continue;
            }
            if let Some(t) = entry.block_time {
                if t <= cutoff.0 {
                    continue;
                }
            }
            let finalized = matches!(
                entry.confirmation_status,
                Some(TransactionConfirmationStatus::Finalized)
            );
            let Ok(signature) = Signature::from_str(&entry.signature) else {
                continue;
            };
            let tx = match self
                .client
                .get_transaction_with_config(
                    &signature,
                    RpcTransactionConfig {
                        encoding: Some(UiTransactionEncoding::Json),
                        commitment: Some(CommitmentConfig::confirmed()),
                        max_supported_transaction_version: Some(0),
                    },
                )
                .await
            {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::debug!(signature = %entry.signature, error = %e, "getTransaction failed");
                    continue;
                }
            };
            let Some(meta) = tx.transaction.meta else {
                continue;
            };
            let account_keys = match &tx.transaction.transaction {
                EncodedTransaction::Json(ui) => match &ui.message {
                    UiMessage::Raw(raw) => raw.account_keys.clone(),
                    UiMessage::Parsed(parsed) => {
                        parsed.account_keys.iter().map(|k| k.pubkey.clone()).collect()
                    }
                },
                _ => continue,
            };
            let Some(account_index) = account_keys.iter().position(|k| k == address) else {
                continue;
            };
            let from_addr = account_keys.first().cloned().unwrap_or_default();
            let block_time = tx.block_time.or(entry.block_time).map(UnixTimestamp);

            // Native delta for the watched address.
            let pre = meta.pre_balances.get(account_index).copied().unwrap_or(0);
            let post = meta.post_balances.get(account_index).copied().unwrap_or(0);
            if post > pre {
                incoming.push(IncomingTx {
                    tx_hash: format!("{}:{}", entry.signature, Token::Native),
                    token: Token::Native,
                    amount: RawAmount::from_u64(post - pre),
                    from_addr: from_addr.clone(),
                    to_addr: address.to_string(),
                    block_number: Some(tx.slot as i64),
                    block_time,
                    confirmed: finalized,
                });
            }

            // Token deltas: one signature can carry several mints.
            let pre_tokens = option_vec(meta.pre_token_balances);
            let post_tokens = option_vec(meta.post_token_balances);
            for token in [Token::Usdc, Token::Usdt] {
                let Some(mint) = token_mint(self.network, token) else {
                    continue;
                };
                let mint = mint.to_string();
                let pre_amount = token_amount_for(&pre_tokens, &mint, address);
                let post_amount = token_amount_for(&post_tokens, &mint, address);
                if post_amount > pre_amount {
                    incoming.push(IncomingTx {
                        tx_hash: format!("{}:{}", entry.signature, token),
                        token,
                        amount: RawAmount::from_u64(post_amount - pre_amount),
                        from_addr: from_addr.clone(),
                        to_addr: address.to_string(),
                        block_number: Some(tx.slot as i64),
                        block_time,
                        confirmed: finalized,
                    });
                }
            }
        }
        Ok(incoming)
    }
}

fn option_vec<T>(value: OptionSerializer<Vec<T>>) -> Vec<T> {
    match value {
        OptionSerializer::Some(v) => v,
        _ => Vec::new(),
    }
}

fn token_amount_for(balances: &[UiTransactionTokenBalance], mint: &str, owner: &str) -> u64 {
    balances
        .iter()
        .filter(|b| {
            b.mint == mint
                && matches!(&b.owner, OptionSerializer::Some(o) if o == owner)
        })
        .filter_map(|b| b.ui_token_amount.amount.parse::<u64>().ok())
        .sum()
}

fn classify_sol(provider: &str, err: ClientError) -> ProviderError {
    match &*err.kind {
        ClientErrorKind::Reqwest(e)
            if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) =>
        {
            ProviderError::RateLimited {
                provider: provider.to_string(),
                retry_after: None,
            }
        }
        ClientErrorKind::Reqwest(_) | ClientErrorKind::Io(_) => ProviderError::Transient {
            provider: provider.to_string(),
            message: err.to_string(),
        },
        ClientErrorKind::RpcError(_) => ProviderError::Client {
            provider: provider.to_string(),
            message: err.to_string(),
        },
        _ => ProviderError::Transient {
            provider: provider.to_string(),
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ata_derivation_is_deterministic_and_off_curve() {
        let owner = Pubkey::new_unique();
        let mint = token_mint(Network::Mainnet, Token::Usdc).unwrap();
        let a = derive_ata(&owner, &mint);
        let b = derive_ata(&owner, &mint);
        assert_eq!(a, b);
        assert_ne!(a, owner);
        // PDAs are off the ed25519 curve.
        assert!(!a.is_on_curve());
    }

    #[test]
    fn mints_exist_for_stablecoins_only() {
        for network in [Network::Mainnet, Network::Testnet] {
            assert!(token_mint(network, Token::Native).is_none());
            assert!(token_mint(network, Token::Usdc).is_some());
            assert!(token_mint(network, Token::Usdt).is_some());
        }
    }
}
