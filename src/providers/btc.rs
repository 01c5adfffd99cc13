//! Bitcoin providers backed by esplora-style REST APIs
//! (mempool.space and Blockstream).
//!
//! Esplora has no batch endpoint, so a "batch" is a bounded loop of
//! per-address GETs with per-address failure annotations. Sweep support
//! (UTXO listing, broadcast, status, fee rate) hangs off the same provider
//! since both esplora deployments expose identical paths.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};

use super::{
    BalanceBatch, BalanceProvider, IncomingTx, ProviderError, ProviderMeta, WatchProvider,
    classify_status, classify_transport, retry_after_header,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EsploraKind {
    Mempool,
    Blockstream,
}

/// One esplora deployment.
pub struct EsploraProvider {
    name: &'static str,
    kind: EsploraKind,
    base: String,
    http: reqwest::Client,
}

impl EsploraProvider {
    pub fn mempool_space(network: Network) -> Self {
        let base = match network {
            Network::Mainnet => "https://mempool.space/api",
            Network::Testnet => "https://mempool.space/testnet/api",
        };
        Self::new("mempool.space", EsploraKind::Mempool, base)
    }

    pub fn blockstream(network: Network) -> Self {
        let base = match network {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet => "https://blockstream.info/testnet/api",
        };
        Self::new("blockstream", EsploraKind::Blockstream, base)
    }

    /// Default provider set, in rotation order.
    pub fn defaults(network: Network) -> Vec<Self> {
        vec![Self::mempool_space(network), Self::blockstream(network)]
    }

    fn new(name: &'static str, kind: EsploraKind, base: &str) -> Self {
        Self {
            name,
            kind,
            base: base.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport(self.name, e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.name, status, retry_after, &body));
        }
        response
            .json()
            .await
            .map_err(|e| classify_transport(self.name, e))
    }

    /// Confirmed UTXOs only; unconfirmed outputs are not sweepable.
    pub async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let utxos: Vec<Utxo> = self.get_json(&format!("/address/{address}/utxo")).await?;
        Ok(utxos.into_iter().filter(|u| u.status.confirmed).collect())
    }

    /// Broadcasts a raw transaction, returning the txid.
    pub async fn broadcast(&self, raw_hex: &str) -> Result<String, ProviderError> {
        let url = format!("{}/tx", self.base);
        let response = self
            .http
            .post(&url)
            .body(raw_hex.to_string())
            .send()
            .await
            .map_err(|e| classify_transport(self.name, e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.name, status, retry_after, &body));
        }
        response
            .text()
            .await
            .map_err(|e| classify_transport(self.name, e))
    }

    pub async fn tx_status(&self, txid: &str) -> Result<EsploraTxStatus, ProviderError> {
        self.get_json(&format!("/tx/{txid}/status")).await
    }

    /// Recommended fee rate in sat/vB.
    pub async fn fee_rate(&self) -> Result<f64, ProviderError> {
        match self.kind {
            EsploraKind::Mempool => {
                let fees: RecommendedFees = self.get_json("/v1/fees/recommended").await?;
                Ok(fees.half_hour_fee)
            }
            EsploraKind::Blockstream => {
                let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;
                estimates
                    .get("3")
                    .or_else(|| estimates.get("2"))
                    .copied()
                    .ok_or_else(|| ProviderError::Transient {
                        provider: self.name.to_string(),
                        message: "fee-estimates missing short targets".to_string(),
                    })
            }
        }
    }
}

impl ProviderMeta for EsploraProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn chain(&self) -> Chain {
        Chain::Btc
    }

    fn rate_limit_per_minute(&self) -> u32 {
        60
    }

    fn max_batch_size(&self) -> usize {
        10
    }
}

#[async_trait::async_trait]
impl BalanceProvider for EsploraProvider {
    async fn get_balances(
        &self,
        addresses: &[String],
        token: Token,
    ) -> Result<BalanceBatch, ProviderError> {
        if token != Token::Native {
            return Err(ProviderError::Client {
                provider: self.name.to_string(),
                message: format!("BTC has no {token} token"),
            });
        }
        let mut batch = BalanceBatch::default();
        let mut first_error: Option<ProviderError> = None;
        for address in addresses {
            match self
                .get_json::<AddressInfo>(&format!("/address/{address}"))
                .await
            {
                Ok(info) => {
                    let sats = info
                        .chain_stats
                        .funded_txo_sum
                        .saturating_sub(info.chain_stats.spent_txo_sum);
                    batch.balances.insert(address.clone(), RawAmount::from_u64(sats));
                }
                Err(e) => {
                    batch.failed.push(address.clone());
                    first_error.get_or_insert(e);
                }
            }
        }
        // Total wipeout counts against the breaker; partial results do not.
        if batch.balances.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl WatchProvider for EsploraProvider {
    async fn incoming_since(
        &self,
        address: &str,
        cutoff: UnixTimestamp,
    ) -> Result<Vec<IncomingTx>, ProviderError> {
        let txs: Vec<EsploraTx> = self.get_json(&format!("/address/{address}/txs")).await?;
        let mut incoming = Vec::new();
        for tx in txs {
            // A tx spending from the watched address is an outgoing payment
            // (change lands back on the address); skip it.
            let spends_ours = tx.vin.iter().any(|vin| {
                vin.prevout
                    .as_ref()
                    .and_then(|p| p.scriptpubkey_address.as_deref())
                    == Some(address)
            });
            if spends_ours {
                continue;
            }
            let received: u64 = tx
                .vout
                .iter()
                .filter(|v| v.scriptpubkey_address.as_deref() == Some(address))
                .map(|v| v.value)
                .sum();
            if received == 0 {
                continue;
            }
            if let Some(block_time) = tx.status.block_time {
                if block_time <= cutoff.0 {
                    continue;
                }
            }
            let from_addr = tx
                .vin
                .first()
                .and_then(|vin| vin.prevout.as_ref())
                .and_then(|p| p.scriptpubkey_address.clone())
                .unwrap_or_default();
            incoming.push(IncomingTx {
                tx_hash: tx.txid,
                token: Token::Native,
                amount: RawAmount::from_u64(received),
                from_addr,
                to_addr: address.to_string(),
                block_number: tx.status.block_height.map(|h| h as i64),
                block_time: tx.status.block_time.map(UnixTimestamp),
                confirmed: tx.status.confirmed,
            });
        }
        Ok(incoming)
    }
}

// ----------------------------------------------------------------------
// Esplora wire types
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddressInfo {
    chain_stats: AddressStats,
}

#[derive(Debug, Deserialize)]
struct AddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

/// An unspent output as reported by `/address/{a}/utxo`.
#[derive(Clone, Debug, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: EsploraTxStatus,
}

/// Confirmation status from `/tx/{txid}/status`.
#[derive(Clone, Debug, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraTxStatus,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RecommendedFees {
    #[serde(rename = "halfHourFee")]
    half_hour_fee: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esplora_address_info_parses() {
        let raw = r#"{"address":"bc1q","chain_stats":{"funded_txo_count":2,
            "funded_txo_sum":150000,"spent_txo_count":1,"spent_txo_sum":50000,"tx_count":3},
            "mempool_stats":{"funded_txo_count":0,"funded_txo_sum":0,"spent_txo_count":0,
            "spent_txo_sum":0,"tx_count":0}}"#;
        let info: AddressInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(
            info.chain_stats.funded_txo_sum - info.chain_stats.spent_txo_sum,
            100_000
        );
    }

    #[test]
    fn esplora_utxo_parses() {
        let raw = r#"[{"txid":"ab","vout":1,"value":600,
            "status":{"confirmed":true,"block_height":800000,"block_hash":"x","block_time":1700000000}},
            {"txid":"cd","vout":0,"value":700,"status":{"confirmed":false}}]"#;
        let utxos: Vec<Utxo> = serde_json::from_str(raw).unwrap();
        assert_eq!(utxos.len(), 2);
        assert!(utxos[0].status.confirmed);
        assert!(utxos[1].status.block_time.is_none());
    }

    #[test]
    fn recommended_fees_parse() {
        let raw = r#"{"fastestFee":24,"halfHourFee":18,"hourFee":12,"economyFee":6,"minimumFee":2}"#;
        let fees: RecommendedFees = serde_json::from_str(raw).unwrap();
        assert_eq!(fees.half_hour_fee, 18.0);
    }
}
