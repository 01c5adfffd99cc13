//! Tracing setup.
//!
//! HDPay is a single-user localhost tool, so logs go to stdout through the
//! standard `tracing-subscriber` fmt layer. Verbosity is controlled by
//! `RUST_LOG` with an `info` default.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// Call once, before anything logs. Returns quietly if a subscriber is
/// already installed (tests install their own).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
