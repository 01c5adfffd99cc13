//! BSC providers: JSON-RPC over Alloy for balances and sweep plumbing,
//! BscScan REST for the poller's inbound-transaction queries.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, U256, address};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::{TransactionReceipt, TransactionRequest};
use alloy_sol_types::SolCall;
use alloy_transport::{RpcError, TransportErrorKind};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};

use super::{
    BalanceBatch, BalanceProvider, IncomingTx, ProviderError, ProviderMeta, WatchProvider,
    classify_transport,
};

alloy_sol_types::sol! {
    /// Minimal BEP-20 surface: balance reads for the scanner, transfer
    /// calldata for the sweep engine.
    interface IErc20 {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 value) external returns (bool);
    }
}

/// BEP-20 contract for (network, token); `None` for the native coin.
pub fn token_address(network: Network, token: Token) -> Option<Address> {
    match (network, token) {
        (_, Token::Native) => None,
        (Network::Mainnet, Token::Usdc) => {
            Some(address!("8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d"))
        }
        (Network::Mainnet, Token::Usdt) => {
            Some(address!("55d398326f99059fF775485246999027B3197955"))
        }
        (Network::Testnet, Token::Usdc) => {
            Some(address!("64544969ed7EBf5f083679233325356EbE738930"))
        }
        (Network::Testnet, Token::Usdt) => {
            Some(address!("337610d27c682E347C9cD60BD4b3b107C9d34dDd"))
        }
    }
}

/// One BSC JSON-RPC endpoint.
pub struct BscRpcProvider {
    name: &'static str,
    provider: RootProvider,
    network: Network,
}

impl BscRpcProvider {
    pub fn new(name: &'static str, url: &str, network: Network) -> Self {
        let url: url::Url = url.parse().expect("static RPC URL");
        Self {
            name,
            provider: RootProvider::new_http(url),
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
                    "publicnode",
                    "https://bsc-rpc.publicnode.com",
                    network,
                ));
                providers.push(Self::new(
                    "bnbchain",
                    "https://bsc-dataseed.bnbchain.org",
                    network,
                ));
            }
            Network::Testnet => {
                providers.push(Self::new(
                    "publicnode",
                    "https://bsc-testnet-rpc.publicnode.com",
                    network,
                ));
                providers.push(Self::new(
                    "bnbchain",
                    "https://data-seed-prebsc-1-s1.bnbchain.org:8545",
                    network,
                ));
            }
        }
        providers
    }

    /// Broadcast-only fallback, tried when every primary refuses a
    /// `eth_sendRawTransaction`.
    pub fn ankr(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::new("ankr", "https://rpc.ankr.com/bsc", network),
            Network::Testnet => {
                Self::new("ankr", "https://rpc.ankr.com/bsc_testnet_chapel", network)
            }
        }
    }

    fn rpc_err(&self, err: RpcError<TransportErrorKind>) -> ProviderError {
        classify_rpc(self.name, err)
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256, ProviderError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn token_balance(
        &self,
        token_contract: Address,
        owner: Address,
    ) -> Result<U256, ProviderError> {
        let calldata = IErc20::balanceOfCall { owner }.abi_encode();
        let request = TransactionRequest::default()
            .with_to(token_contract)
            .with_input(calldata);
        let output = self
            .provider
            .call(request)
            .await
            .map_err(|e| self.rpc_err(e))?;
        IErc20::balanceOfCall::abi_decode_returns(&output).map_err(|e| ProviderError::Client {
            provider: self.name.to_string(),
            message: format!("balanceOf returned undecodable data: {e}"),
        })
    }

    /// Pending-block nonce, fetched once per sweep and incremented locally.
    pub async fn pending_nonce(&self, address: Address) -> Result<u64, ProviderError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn gas_price(&self) -> Result<u128, ProviderError> {
        self.provider.get_gas_price().await.map_err(|e| self.rpc_err(e))
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, ProviderError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.rpc_err(e))?;
        Ok(*pending.tx_hash())
    }

    pub async fn receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, ProviderError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_err(e))
    }
}

impl ProviderMeta for BscRpcProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn chain(&self) -> Chain {
        Chain::Bsc
    }

    fn rate_limit_per_minute(&self) -> u32 {
        600
    }

    fn max_batch_size(&self) -> usize {
        20
    }
}

#[async_trait::async_trait]
impl BalanceProvider for BscRpcProvider {
    async fn get_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, ProviderError> {
        let contract = match token {
            Token::Native => None,
            other => Some(token_address(self.network, other).ok_or_else(|| {
                ProviderError::Client {
                    provider: self.name.to_string(),
                    message: format!("{other} has no deployment on BSC {}", self.network),
                }
            })?),
        };
        let mut batch = BalanceBatch::default();
        let mut first_error: Option<ProviderError> = None;
        for raw in addresses {
            let Ok(owner) = Address::from_str(raw) else {
                return Err(ProviderError::Client {
                    provider: self.name.to_string(),
                    message: format!("malformed BSC address {raw:?}"),
                });
            };
            let result = match contract {
                None => self.native_balance(owner).await,
                Some(c) => self.token_balance(c, owner).await,
            };
            match result {
                Ok(value) => {
                    batch.balances.insert(raw.clone(), RawAmount(value));
                }
                Err(e) => {
                    batch.failed.push(raw.clone());
                    first_error.get_or_insert(e);
                }
            }
        }
        if batch.balances.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(batch)
    }
}

fn classify_rpc(provider: &str, err: RpcError<TransportErrorKind>) -> ProviderError {
    match &err {
        RpcError::Transport(kind) => {
            let message = kind.to_string();
            if message.contains("429") {
                ProviderError::RateLimited {
                    provider: provider.to_string(),
                    retry_after: None,
                }
            } else {
                ProviderError::Transient {
                    provider: provider.to_string(),
                    message,
                }
            }
        }
        // A structured JSON-RPC error is the node rejecting the request
        // itself (bad nonce, underpriced, reverted call): retrying the same
        // payload elsewhere will not change the answer.
        RpcError::ErrorResp(payload) => ProviderError::Client {
            provider: provider.to_string(),
            message: payload.to_string(),
        },
        other => ProviderError::Transient {
            provider: provider.to_string(),
            message: other.to_string(),
        },
    }
}

// ----------------------------------------------------------------------
// BscScan (poller inbound transactions)
// ----------------------------------------------------------------------

/// BscScan REST provider for `txlist` + `tokentx`.
pub struct BscScanProvider {
    base: String,
    api_key: Option<String>,
    network: Network,
    http: reqwest::Client,
}

impl BscScanProvider {
    pub fn new(network: Network, api_key: Option<String>) -> Self {
        let base = match network {
            Network::Mainnet => "https://api.bscscan.com/api",
            Network::Testnet => "https://api-testnet.bscscan.com/api",
        };
        Self {
            base: base.to_string(),
            api_key,
            network,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn account_action(
        &self,
        action: &str,
        address: &str,
    ) -> Result<Vec<ScanTxEntry>, ProviderError> {
        let mut url = format!(
            "{}?module=account&action={action}&address={address}&startblock=0&endblock=999999999&sort=desc",
            self.base
        );
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&apikey={key}"));
        }
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport(self.name(), e))?;
        let envelope: ScanEnvelope = response
            .json()
            .await
            .map_err(|e| classify_transport(self.name(), e))?;
        if let Ok(entries) = serde_json::from_value::<Vec<ScanTxEntry>>(envelope.result.clone()) {
            return Ok(entries);
        }
        let note = envelope
            .result
            .as_str()
            .unwrap_or(&envelope.message)
            .to_string();
        if note.contains("No transactions found") {
            return Ok(Vec::new());
        }
        if note.contains("rate limit") {
            return Err(ProviderError::RateLimited {
                provider: self.name().to_string(),
                retry_after: None,
            });
        }
        Err(ProviderError::Transient {
            provider: self.name().to_string(),
            message: note,
        })
    }
}

impl ProviderMeta for BscScanProvider {
    fn name(&self) -> &'static str {
        "bscscan"
    }

    fn chain(&self) -> Chain {
        Chain::Bsc
    }

    fn rate_limit_per_minute(&self) -> u32 {
        // Free tier is 5 req/s; each poll issues two actions.
        240
    }

    fn max_batch_size(&self) -> usize {
        1
    }
}

#[async_trait::async_trait]
impl WatchProvider for BscScanProvider {
    async fn incoming_since(
        &self,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, ProviderError> {
        let address_lc = address.to_ascii_lowercase();
        let mut incoming = Vec::new();

        for entry in self.account_action("txlist", address).await? {
            if entry.to.to_ascii_lowercase() != address_lc
                || entry.is_error.as_deref() == Some("1")
            {
                continue;
            }
            let Some(tx) = entry.into_incoming(Token::Native, address) else {
                continue;
            };
            if tx.block_time.map(|t| t.0 > cutoff.0).unwrap_or(true) && !tx.amount.is_zero() {
                incoming.push(tx);
            }
        }

        for entry in self.account_action("tokentx", address).await? {
            if entry.to.to_ascii_lowercase() != address_lc {
                continue;
            }
            let token = match &entry.contract_address {
                Some(contract) => {
                    let contract = contract.to_ascii_lowercase();
                    if Some(contract.as_str())
                        == token_address(self.network, Token::Usdc)
                            .map(|a| a.to_string().to_ascii_lowercase())
                            .as_deref()
                    {
                        Token::Usdc
                    } else if Some(contract.as_str())
                        == token_address(self.network, Token::Usdt)
                            .map(|a| a.to_string().to_ascii_lowercase())
                            .as_deref()
                    {
                        Token::Usdt
                    } else {
                        continue;
                    }
                }
                None => continue,
            };
            let Some(tx) = entry.into_incoming(token, address) else {
                continue;
            };
            if tx.block_time.map(|t| t.0 > cutoff.0).unwrap_or(true) && !tx.amount.is_zero() {
                incoming.push(tx);
            }
        }

        Ok(incoming)
    }
}

#[derive(Debug, Deserialize)]
struct ScanEnvelope {
    #[serde(default)]
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ScanTxEntry {
    hash: String,
    from: String,
    to: String,
    value: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(default)]
    confirmations: String,
    #[serde(rename = "isError")]
    is_error: Option<String>,
    #[serde(rename = "contractAddress")]
    contract_address: Option<String>,
}

impl ScanTxEntry {
    fn into_incoming(self, token: Token, address: &str) -> Option<IncomingTx> {
        let amount: RawAmount = self.value.parse().ok()?;
        let confirmations: u64 = self.confirmations.parse().unwrap_or(0);
        Some(IncomingTx {
            tx_hash: self.hash,
            token,
            amount,
            from_addr: self.from,
            to_addr: address.to_string(),
            block_number: self.block_number.parse().ok(),
            block_time: self.time_stamp.parse().ok().map(UnixTimestamp),
            confirmed: confirmations >= Chain::Bsc.confirmation_threshold(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_addresses_exist_for_stablecoins() {
        for network in [Network::Mainnet, Network::Testnet] {
            assert!(token_address(network, Token::Native).is_none());
            assert!(token_address(network, Token::Usdc).is_some());
            assert!(token_address(network, Token::Usdt).is_some());
        }
    }

    #[test]
    fn transfer_calldata_uses_the_bep20_selector() {
        let call = IErc20::transferCall {
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::from(1_000u64),
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(encoded.len(), 4 + 32 + 32);
    }

    #[test]
    fn bscscan_entry_maps_to_incoming_tx() {
        let raw = r#"{"blockNumber":"34000000","timeStamp":"1700000100",
            "hash":"0xabc","from":"0xfrom","to":"0xTo","value":"5000000000000000000",
            "confirmations":"25","isError":"0"}"#;
        let entry: ScanTxEntry = serde_json::from_str(raw).unwrap();
        let tx = entry.into_incoming(Token::Native, "0xTo").unwrap();
        assert!(tx.confirmed);
        assert_eq!(tx.amount.to_string(), "5000000000000000000");
        assert_eq!(tx.block_time, Some(UnixTimestamp(1_700_000_100)));
    }

    #[test]
    fn bscscan_no_transactions_is_not_an_error() {
        let raw = r#"{"status":"0","message":"No transactions found","result":[]}"#;
        let envelope: ScanEnvelope = serde_json::from_str(raw).unwrap();
        let entries: Vec<ScanTxEntry> = serde_json::from_value(envelope.result).unwrap();
        assert!(entries.is_empty());
    }
}
