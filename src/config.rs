//! Configuration for the HDPay server.
//!
//! Everything is sourced from CLI flags with environment-variable fallbacks
//! (`.env` values are loaded by `main` before parsing). The network is fixed
//! here for the lifetime of the process; no runtime switching.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::chain::{Network, UnixTimestamp};

/// CLI arguments and environment configuration for the HDPay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "hdpay")]
#[command(about = "HD wallet derivation, balance scanning, and sweep server")]
pub struct Config {
    /// Path to the BIP-39 mnemonic file. Read on each derivation, never cached.
    #[arg(long, env = "MNEMONIC_FILE")]
    pub mnemonic_file: PathBuf,

    /// Network to operate on: mainnet or testnet.
    #[arg(long, env = "NETWORK")]
    pub network: Network,

    /// Port for the main (localhost-only) HTTP API.
    #[arg(long, env = "PORT", default_value_t = 8899)]
    pub port: u16,

    /// Port for the poller HTTP API.
    #[arg(long, env = "POLLER_PORT", default_value_t = 8900)]
    pub poller_port: u16,

    /// Path of the SQLite database file.
    #[arg(long, env = "DB_PATH", default_value = "hdpay.db")]
    pub db_path: PathBuf,

    /// Number of addresses derived per chain at init.
    #[arg(long, env = "ADDRESS_COUNT", default_value_t = 1000)]
    pub address_count: u32,

    /// BscScan API key for the poller's BSC transaction queries.
    #[arg(long, env = "BSCSCAN_API_KEY")]
    pub bscscan_api_key: Option<String>,

    /// Extra premium BSC RPC endpoint, tried before the public defaults.
    #[arg(long, env = "BSC_RPC_URL")]
    pub bsc_rpc_url: Option<String>,

    /// Extra premium Solana RPC endpoint, tried before the public defaults.
    #[arg(long, env = "SOL_RPC_URL")]
    pub sol_rpc_url: Option<String>,

    /// Poller watch cutoff floor: `YYYY-MM-DD` or Unix seconds.
    #[arg(long, env = "POLLER_START_DATE", value_parser = parse_start_date)]
    pub poller_start_date: Option<UnixTimestamp>,

    /// Poller admin username.
    #[arg(long, env = "POLLER_ADMIN_USER")]
    pub poller_admin_user: Option<String>,

    /// Bcrypt hash of the poller admin password.
    #[arg(long, env = "POLLER_ADMIN_PASSWORD_HASH")]
    pub poller_admin_password_hash: Option<String>,

    /// Comma-separated source-IP allowlist for internet-facing poller routes.
    #[arg(long, env = "POLLER_IP_ALLOWLIST", value_delimiter = ',')]
    pub poller_ip_allowlist: Vec<IpAddr>,

    /// Path of the poller tier configuration file.
    #[arg(long, env = "TIERS_FILE", default_value = "tiers.json")]
    pub tiers_file: PathBuf,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mnemonic file {0} is not readable: {1}")]
    MnemonicUnreadable(PathBuf, std::io::Error),
    #[error("mnemonic file {0} does not contain a valid BIP-39 mnemonic: {1}")]
    MnemonicInvalid(PathBuf, bip39::Error),
    #[error("poller admin user set without POLLER_ADMIN_PASSWORD_HASH (or vice versa)")]
    PartialAdminCredentials,
}

impl Config {
    /// Parse configuration and verify the parts whose failure must abort
    /// startup: the mnemonic file must exist and hold a valid mnemonic, and
    /// admin credentials must be all-or-nothing.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(&self.mnemonic_file)
            .map_err(|e| ConfigError::MnemonicUnreadable(self.mnemonic_file.clone(), e))?;
        bip39::Mnemonic::parse_normalized(raw.trim())
            .map_err(|e| ConfigError::MnemonicInvalid(self.mnemonic_file.clone(), e))?;
        if self.poller_admin_user.is_some() != self.poller_admin_password_hash.is_some() {
            return Err(ConfigError::PartialAdminCredentials);
        }
        Ok(())
    }
}

/// Accepts either Unix seconds or a `YYYY-MM-DD` date (midnight UTC).
fn parse_start_date(s: &str) -> Result<UnixTimestamp, String> {
    if let Ok(secs) = s.parse::<i64>() {
        if secs < 0 {
            return Err("start date must not be before the epoch".to_string());
        }
        return Ok(UnixTimestamp(secs));
    }
    let mut parts = s.splitn(3, '-');
    let (y, m, d) = match (parts.next(), parts.next(), parts.next()) {
        (Some(y), Some(m), Some(d)) => (y, m, d),
        _ => return Err(format!("{s:?} is neither Unix seconds nor YYYY-MM-DD")),
    };
    let year: i64 = y.parse().map_err(|_| format!("bad year in {s:?}"))?;
    let month: u32 = m.parse().map_err(|_| format!("bad month in {s:?}"))?;
    let day: u32 = d.parse().map_err(|_| format!("bad day in {s:?}"))?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(format!("{s:?} is out of range"));
    }
    Ok(UnixTimestamp(days_from_civil(year, month, day) * 86_400))
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_date_accepts_unix_seconds() {
        assert_eq!(
            parse_start_date("1700000000").unwrap(),
            UnixTimestamp(1_700_000_000)
        );
    }

    #[test]
    fn start_date_accepts_civil_dates() {
        assert_eq!(parse_start_date("1970-01-01").unwrap(), UnixTimestamp(0));
        assert_eq!(
            parse_start_date("2024-01-01").unwrap(),
            UnixTimestamp(1_704_067_200)
        );
        assert_eq!(
            parse_start_date("2000-03-01").unwrap(),
            UnixTimestamp(951_868_800)
        );
    }

    #[test]
    fn start_date_rejects_garbage() {
        assert!(parse_start_date("yesterday").is_err());
        assert!(parse_start_date("2024-13-01").is_err());
        assert!(parse_start_date("-1").is_err());
    }
}
