//! HDPay: a self-hosted, localhost-only HD wallet payment service.
//!
//! One BIP-39 mnemonic drives a fixed cohort of deterministic receive
//! addresses on BTC (BIP-84 bech32), BSC (BIP-44, EIP-55) and SOL (SLIP-10
//! ed25519). The service scans their balances through rotating free public
//! APIs, sweeps funded addresses into a single destination with
//! chain-specific batch transactions, and streams progress to the UI over
//! SSE. A companion poller watches arbitrary addresses for inbound
//! transfers and credits a tiered USD → points ledger.
//!
//! Private keys are derived immediately before signing and wiped right
//! after; nothing secret is ever persisted or logged.

pub mod chain;
pub mod config;
pub mod derive;
pub mod engine;
pub mod events;
pub mod http;
pub mod poller;
pub mod providers;
pub mod scanner;
pub mod sig_down;
pub mod store;
pub mod telemetry;
