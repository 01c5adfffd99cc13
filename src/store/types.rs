//! Row types and status enums persisted by the store.
//!
//! Status enums are closed sum types with explicit transition rules; the
//! "uncertain" terminal is first-class and never folded into "failed".

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::chain::{Chain, RawAmount, Token, UnixTimestamp};

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), " {:?}"), other)),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

str_enum! {
    /// Scan lifecycle per (network, chain).
    ScanStatus {
        Idle => "idle",
        Scanning => "scanning",
        Paused => "paused",
    }
}

str_enum! {
    /// Direction of a recorded transaction relative to our addresses.
    Direction {
        In => "in",
        Out => "out",
    }
}

str_enum! {
    /// Status of a recorded transaction.
    ///
    /// Advancement is monotonic; `confirmed` is terminal and in particular
    /// never degrades to `uncertain`.
    TxStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        Failed => "failed",
        Uncertain => "uncertain",
    }
}

impl TxStatus {
    /// Whether a stored `self` may advance to `next`.
    pub fn may_advance_to(&self, next: TxStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => false,
            (TxStatus::Confirmed, _) => false,
            (TxStatus::Pending, _) => true,
            // A transaction whose finality was unverifiable may later be
            // observed confirmed or failed.
            (TxStatus::Uncertain, TxStatus::Confirmed | TxStatus::Failed) => true,
            (TxStatus::Failed, _) => false,
            _ => false,
        }
    }
}

str_enum! {
    /// Lifecycle of one in-flight sweep transaction.
    TxStateStatus {
        Building => "building",
        Signed => "signed",
        Broadcast => "broadcast",
        Confirmed => "confirmed",
        Failed => "failed",
        Dismissed => "dismissed",
        Uncertain => "uncertain",
    }
}

impl TxStateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStateStatus::Confirmed
                | TxStateStatus::Failed
                | TxStateStatus::Dismissed
                | TxStateStatus::Uncertain
        )
    }
}

str_enum! {
    /// What kind of transaction a tx-state row tracks.
    TxStateKind {
        Sweep => "sweep",
        Preseed => "preseed",
    }
}

str_enum! {
    /// Circuit breaker state persisted for the health endpoint.
    CircuitState {
        Closed => "closed",
        Open => "open",
        HalfOpen => "half-open",
    }
}

str_enum! {
    /// Coarse provider health derived from breaker state.
    ProviderStatus {
        Healthy => "healthy",
        Degraded => "degraded",
        Down => "down",
    }
}

str_enum! {
    /// Lifecycle of a poller watch.
    WatchStatus {
        Active => "active",
        Completed => "completed",
        Expired => "expired",
        Cancelled => "cancelled",
    }
}

impl WatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchStatus::Active)
    }
}

/// A derived receive address.
#[derive(Clone, Debug, Serialize)]
pub struct AddressRow {
    pub chain: Chain,
    pub index: u32,
    pub address: String,
}

/// A scanned balance in raw smallest units.
#[derive(Clone, Debug, Serialize)]
pub struct BalanceRow {
    pub chain: Chain,
    pub index: u32,
    pub token: Token,
    pub amount: RawAmount,
    pub last_scanned_at: UnixTimestamp,
}

/// Scan progress per (network, chain).
#[derive(Clone, Debug, Serialize)]
pub struct ScanStateRow {
    pub chain: Chain,
    pub last_scanned_index: i64,
    pub max_scan_id: i64,
    pub status: ScanStatus,
    pub started_at: Option<UnixTimestamp>,
    pub updated_at: UnixTimestamp,
}

/// A recorded on-chain transaction, inbound or outbound.
#[derive(Clone, Debug, Serialize)]
pub struct TxRecord {
    pub chain: Chain,
    pub tx_hash: String,
    pub direction: Direction,
    pub token: Token,
    pub amount: RawAmount,
    pub from_addr: String,
    pub to_addr: String,
    pub block_number: Option<i64>,
    pub block_time: Option<UnixTimestamp>,
    pub gas: Option<RawAmount>,
    pub status: TxStatus,
    pub created_at: UnixTimestamp,
}

/// One in-flight transaction of a sweep, persisted for reconciliation.
#[derive(Clone, Debug, Serialize)]
pub struct TxStateRow {
    pub sweep_id: String,
    pub chain: Chain,
    pub address_index: u32,
    pub kind: TxStateKind,
    pub nonce: Option<i64>,
    pub tx_hash: Option<String>,
    pub status: TxStateStatus,
    pub attempt: i64,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

/// Provider health snapshot row.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderHealthRow {
    pub provider: String,
    pub chain: Chain,
    pub circuit_state: CircuitState,
    pub consecutive_failures: i64,
    pub last_success_at: Option<UnixTimestamp>,
    pub last_failure_at: Option<UnixTimestamp>,
    pub status: ProviderStatus,
}

/// A poller watch row.
#[derive(Clone, Debug, Serialize)]
pub struct WatchRow {
    pub watch_id: String,
    pub chain: Chain,
    pub address: String,
    pub status: WatchStatus,
    pub started_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
    pub completed_at: Option<UnixTimestamp>,
    pub poll_count: i64,
    pub last_poll_at: Option<UnixTimestamp>,
    pub last_poll_result: Option<String>,
}

/// Points ledger row, one per (address, chain).
///
/// Invariants: `0 ≤ unclaimed ≤ total`; `pending` never counts toward
/// `total`; `total` never decreases.
#[derive(Clone, Debug, Serialize)]
pub struct PointsRow {
    pub chain: Chain,
    pub address: String,
    pub unclaimed: i64,
    pub pending: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_is_monotonic() {
        assert!(TxStatus::Pending.may_advance_to(TxStatus::Confirmed));
        assert!(TxStatus::Pending.may_advance_to(TxStatus::Uncertain));
        assert!(TxStatus::Uncertain.may_advance_to(TxStatus::Confirmed));
        assert!(!TxStatus::Confirmed.may_advance_to(TxStatus::Uncertain));
        assert!(!TxStatus::Confirmed.may_advance_to(TxStatus::Pending));
        assert!(!TxStatus::Failed.may_advance_to(TxStatus::Pending));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            TxStateStatus::Building,
            TxStateStatus::Signed,
            TxStateStatus::Broadcast,
            TxStateStatus::Confirmed,
            TxStateStatus::Failed,
            TxStateStatus::Dismissed,
            TxStateStatus::Uncertain,
        ] {
            assert_eq!(s.as_str().parse::<TxStateStatus>().unwrap(), s);
        }
        assert!("half-open".parse::<CircuitState>().is_ok());
        assert!("halfopen".parse::<CircuitState>().is_err());
    }

    #[test]
    fn terminal_watch_states() {
        assert!(!WatchStatus::Active.is_terminal());
        assert!(WatchStatus::Completed.is_terminal());
        assert!(WatchStatus::Expired.is_terminal());
        assert!(WatchStatus::Cancelled.is_terminal());
    }
}
