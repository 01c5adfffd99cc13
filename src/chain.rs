//! Core chain vocabulary shared by every subsystem.
//!
//! - [`Chain`] — the three supported chains (BTC, BSC, SOL).
//! - [`Network`] — mainnet or testnet, fixed at process startup.
//! - [`Token`] — NATIVE plus the stablecoins supported per chain.
//! - [`RawAmount`] — an amount in the token's smallest unit, carried as an
//!   arbitrary-precision integer and serialized as a decimal string.
//!
//! Amounts are always raw smallest-unit integers; decimal conversion is
//! strictly a presentation concern of the UI.

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::str::FromStr;

/// A supported chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Btc,
    Bsc,
    Sol,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Btc, Chain::Bsc, Chain::Sol];

    /// Canonical lowercase name used in URLs, the store, and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Btc => "btc",
            Chain::Bsc => "bsc",
            Chain::Sol => "sol",
        }
    }

    /// Tokens supported on this chain, NATIVE first.
    pub fn tokens(&self) -> &'static [Token] {
        match self {
            Chain::Btc => &[Token::Native],
            Chain::Bsc => &[Token::Native, Token::Usdc, Token::Usdt],
            Chain::Sol => &[Token::Native, Token::Usdc, Token::Usdt],
        }
    }

    pub fn supports(&self, token: Token) -> bool {
        self.tokens().contains(&token)
    }

    /// Inbound confirmation threshold used by the poller.
    pub fn confirmation_threshold(&self) -> u64 {
        match self {
            Chain::Btc => 1,
            Chain::Bsc => 12,
            // SOL uses `finalized` commitment rather than a depth count; one
            // finalized observation is terminal.
            Chain::Sol => 1,
        }
    }

    /// Poller tick interval in seconds.
    pub fn poll_interval_secs(&self) -> u64 {
        match self {
            Chain::Btc => 60,
            Chain::Bsc => 5,
            Chain::Sol => 5,
        }
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Chain::Btc),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "sol" | "solana" => Ok(Chain::Sol),
            other => Err(ChainParseError::UnknownChain(other.to_string())),
        }
    }
}

impl Serialize for Chain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Chain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainParseError {
    #[error("unknown chain {0:?}, expected one of btc, bsc, sol")]
    UnknownChain(String),
    #[error("unknown network {0:?}, expected mainnet or testnet")]
    UnknownNetwork(String),
    #[error("token {token} is not supported on {chain}")]
    UnsupportedToken { chain: Chain, token: Token },
    #[error("unknown token {0:?}, expected one of NATIVE, USDC, USDT")]
    UnknownToken(String),
}

/// The network the whole process operates on.
///
/// Fixed from the environment at startup; every store row carries it and
/// every query filters on it. It is not selectable at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    /// BIP-44/84 coin type for BTC derivation.
    pub fn btc_coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        }
    }

    pub fn btc_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// EIP-155 chain id for BSC.
    pub fn bsc_chain_id(&self) -> u64 {
        match self {
            Network::Mainnet => 56,
            Network::Testnet => 97,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(ChainParseError::UnknownNetwork(other.to_string())),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A token tracked by the scanner and swept by the engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Native,
    Usdc,
    Usdt,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Token::Native => "NATIVE",
            Token::Usdc => "USDC",
            Token::Usdt => "USDT",
        }
    }

    pub fn is_stablecoin(&self) -> bool {
        matches!(self, Token::Usdc | Token::Usdt)
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Token {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NATIVE" => Ok(Token::Native),
            "USDC" => Ok(Token::Usdc),
            "USDT" => Ok(Token::Usdt),
            other => Err(ChainParseError::UnknownToken(other.to_string())),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An amount in a token's smallest unit (satoshi, wei, lamport, or the
/// token's base unit).
///
/// BSC wei values routinely exceed 2^53 and occasionally 2^64, so amounts are
/// carried as [`U256`] end to end and serialized as decimal strings to avoid
/// precision loss in JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawAmount(pub U256);

impl RawAmount {
    pub const ZERO: RawAmount = RawAmount(U256::ZERO);

    pub fn from_u64(v: u64) -> Self {
        RawAmount(U256::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The amount as a `u64`, for chains whose native unit fits (BTC, SOL).
    pub fn to_u64(&self) -> Option<u64> {
        u64::try_from(self.0).ok()
    }

    pub fn checked_sub(&self, rhs: RawAmount) -> Option<RawAmount> {
        self.0.checked_sub(rhs.0).map(RawAmount)
    }

    pub fn saturating_sub(&self, rhs: RawAmount) -> RawAmount {
        RawAmount(self.0.saturating_sub(rhs.0))
    }
}

impl Add for RawAmount {
    type Output = RawAmount;

    fn add(self, rhs: RawAmount) -> RawAmount {
        RawAmount(self.0 + rhs.0)
    }
}

impl Sub for RawAmount {
    type Output = RawAmount;

    fn sub(self, rhs: RawAmount) -> RawAmount {
        RawAmount(self.0 - rhs.0)
    }
}

impl From<u64> for RawAmount {
    fn from(v: u64) -> Self {
        RawAmount(U256::from(v))
    }
}

impl From<U256> for RawAmount {
    fn from(v: U256) -> Self {
        RawAmount(v)
    }
}

impl Display for RawAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // U256 displays as a decimal integer.
        write!(f, "{}", self.0)
    }
}

impl FromStr for RawAmount {
    type Err = RawAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RawAmountParseError(s.to_string()));
        }
        U256::from_str_radix(s, 10)
            .map(RawAmount)
            .map_err(|_| RawAmountParseError(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("amount {0:?} is not a non-negative integer decimal string")]
pub struct RawAmountParseError(pub String);

impl Serialize for RawAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RawAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Seconds since the Unix epoch.
///
/// Serialized as a plain integer; SQLite stores it as INTEGER.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimestamp(pub i64);

impl UnixTimestamp {
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        UnixTimestamp(secs)
    }

    pub fn seconds_since(&self, earlier: UnixTimestamp) -> i64 {
        self.0 - earlier.0
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_roundtrip() {
        for chain in Chain::ALL {
            assert_eq!(chain.as_str().parse::<Chain>().unwrap(), chain);
        }
        assert!("doge".parse::<Chain>().is_err());
    }

    #[test]
    fn btc_supports_native_only() {
        assert!(Chain::Btc.supports(Token::Native));
        assert!(!Chain::Btc.supports(Token::Usdc));
        assert!(Chain::Bsc.supports(Token::Usdt));
        assert!(Chain::Sol.supports(Token::Usdc));
    }

    #[test]
    fn raw_amount_parses_decimal_strings() {
        let amount: RawAmount = "340282366920938463463374607431768211456".parse().unwrap();
        assert_eq!(
            amount.to_string(),
            "340282366920938463463374607431768211456"
        );
        assert!("".parse::<RawAmount>().is_err());
        assert!("-5".parse::<RawAmount>().is_err());
        assert!("1.5".parse::<RawAmount>().is_err());
        assert!("0x10".parse::<RawAmount>().is_err());
    }

    #[test]
    fn raw_amount_serializes_as_string() {
        let amount = RawAmount::from_u64(21_000_000);
        assert_eq!(
            serde_json::to_string(&amount).unwrap(),
            "\"21000000\"".to_string()
        );
        let back: RawAmount = serde_json::from_str("\"21000000\"").unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn network_is_distinct_per_chain_parameters() {
        assert_eq!(Network::Mainnet.bsc_chain_id(), 56);
        assert_eq!(Network::Testnet.bsc_chain_id(), 97);
        assert_eq!(Network::Mainnet.btc_coin_type(), 0);
        assert_eq!(Network::Testnet.btc_coin_type(), 1);
    }
}
