//! USD price lookup for confirmed inbound transfers.
//!
//! Stablecoins are a constant $1.00. Native prices come from the CoinGecko
//! simple-price endpoint, cached for 60 seconds, with three retries behind
//! a short backoff. Price failures bubble to the watch loop, which logs and
//! retries on its next tick.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::chain::{Chain, RawAmount, Token};

const CACHE_TTL: Duration = Duration::from_secs(60);
const RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const COINGECKO_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin,binancecoin,solana&vs_currencies=usd";

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("price fetch failed after {RETRIES} attempts: {0}")]
    Fetch(String),
    #[error("price feed is missing {0}")]
    Missing(&'static str),
    #[error("amount {0} does not fit the price math")]
    AmountOverflow(RawAmount),
}

/// Decimal places of a token's smallest unit on a chain.
pub fn token_decimals(chain: Chain, token: Token) -> u32 {
    match (chain, token) {
        (Chain::Btc, _) => 8,
        (Chain::Bsc, _) => 18,
        (Chain::Sol, Token::Native) => 9,
        (Chain::Sol, _) => 6,
    }
}

fn coingecko_id(chain: Chain) -> &'static str {
    match chain {
        Chain::Btc => "bitcoin",
        Chain::Bsc => "binancecoin",
        Chain::Sol => "solana",
    }
}

#[derive(Deserialize)]
struct QuoteUsd {
    usd: f64,
}

pub struct PriceService {
    http: reqwest::Client,
    url: String,
    cache: RwLock<HashMap<&'static str, (Instant, Decimal)>>,
}

impl PriceService {
    pub fn new() -> Self {
        Self::with_url(COINGECKO_URL)
    }

    pub fn with_url(url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            url: url.to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// USD price of one whole token.
    pub async fn usd_price(&self, chain: Chain, token: Token) -> Result<Decimal, PriceError> {
        if token.is_stablecoin() {
            return Ok(Decimal::ONE);
        }
        let id = coingecko_id(chain);
        {
            let cache = self.cache.read().await;
            if let Some((at, price)) = cache.get(id) {
                if at.elapsed() < CACHE_TTL {
                    return Ok(*price);
                }
            }
        }
        let quotes = self.fetch_with_retry().await?;
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        for (name, quote) in &quotes {
            if let Some(price) = Decimal::from_f64(quote.usd) {
                for known in ["bitcoin", "binancecoin", "solana"] {
                    if name == known {
                        cache.insert(known, (now, price));
                    }
                }
            }
        }
        cache
            .get(id)
            .map(|(_, price)| *price)
            .ok_or(PriceError::Missing(id))
    }

    /// USD value of a raw amount.
    pub async fn usd_value(
        &self,
        chain: Chain,
        token: Token,
        amount: RawAmount,
    ) -> Result<Decimal, PriceError> {
        let price = self.usd_price(chain, token).await?;
        let raw: i128 = u128::try_from(amount.0)
            .ok()
            .and_then(|v| i128::try_from(v).ok())
            .ok_or(PriceError::AmountOverflow(amount))?;
        let whole = Decimal::from_i128_with_scale(raw, token_decimals(chain, token));
        Ok(whole * price)
    }

    async fn fetch_with_retry(&self) -> Result<HashMap<String, QuoteUsd>, PriceError> {
        let mut backoff = RETRY_BACKOFF;
        let mut last_error = String::new();
        for attempt in 1..=RETRIES {
            match self.fetch().await {
                Ok(quotes) => return Ok(quotes),
                Err(e) => {
                    last_error = e;
                    tracing::warn!(attempt, error = %last_error, "price fetch failed");
                    if attempt < RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(PriceError::Fetch(last_error))
    }

    async fn fetch(&self) -> Result<HashMap<String, QuoteUsd>, String> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

impl Default for PriceService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::ToPrimitive;

    #[tokio::test]
    async fn stablecoins_are_a_constant_dollar() {
        let service = PriceService::new();
        let price = service.usd_price(Chain::Bsc, Token::Usdt).await.unwrap();
        assert_eq!(price, Decimal::ONE);
    }

    #[tokio::test]
    async fn usd_value_scales_by_token_decimals() {
        let service = PriceService::new();
        // 5 USDT on SOL: 6 decimals.
        let value = service
            .usd_value(Chain::Sol, Token::Usdt, RawAmount::from_u64(5_000_000))
            .await
            .unwrap();
        assert_eq!(value.to_i64(), Some(5));
        // 50 USDC on BSC: 18 decimals.
        let value = service
            .usd_value(
                Chain::Bsc,
                Token::Usdc,
                "50000000000000000000".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(value.to_i64(), Some(50));
    }

    #[test]
    fn decimals_table() {
        assert_eq!(token_decimals(Chain::Btc, Token::Native), 8);
        assert_eq!(token_decimals(Chain::Bsc, Token::Native), 18);
        assert_eq!(token_decimals(Chain::Sol, Token::Native), 9);
        assert_eq!(token_decimals(Chain::Sol, Token::Usdc), 6);
    }
}
