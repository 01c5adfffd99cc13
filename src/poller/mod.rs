//! Poller: inbound-transaction detection on arbitrary watched addresses and
//! the tiered USD → points ledger the game server polls.

pub mod auth;
pub mod http;
pub mod price;
pub mod tiers;
pub mod watcher;
