//! HTTP error envelope.
//!
//! Every error leaves the boundary as `{"error": {"code", "message"}}` with
//! a code from a fixed vocabulary, so the UI can map codes to stable message
//! templates. Transient provider conditions surface as retryable codes, not
//! failures.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::chain::ChainParseError;
use crate::engine::EngineError;
use crate::poller::tiers::TierError;
use crate::poller::watcher::WatchError;
use crate::providers::PoolError;
use crate::scanner::ScanError;
use crate::store::StoreError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = self.message, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<ChainParseError> for ApiError {
    fn from(e: ChainParseError) -> Self {
        ApiError::bad_request("invalid_chain", e.to_string())
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match &e {
            ScanError::AlreadyRunning(_) => ApiError::conflict("scan_in_progress", e.to_string()),
            ScanError::NotRunning(_) => ApiError::conflict("scan_not_running", e.to_string()),
            ScanError::NoAddresses(_) => ApiError::bad_request("no_addresses", e.to_string()),
            ScanError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match &e {
            PoolError::Client(_) => ApiError::bad_request("provider_rejected", e.to_string()),
            PoolError::Exhausted { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "providers_exhausted", e.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::Busy(_) => ApiError::conflict("sweep_in_progress", e.to_string()),
            EngineError::InvalidDestination(_) => {
                ApiError::bad_request("invalid_address", e.to_string())
            }
            EngineError::UnsupportedToken { .. } => {
                ApiError::bad_request("unsupported_token", e.to_string())
            }
            EngineError::NothingToSweep => ApiError::bad_request("nothing_to_sweep", e.to_string()),
            EngineError::UtxoValidationFailed(_) => {
                ApiError::bad_request("utxo_validation_failed", e.to_string())
            }
            EngineError::GasPriceSpike { .. } => {
                ApiError::bad_request("gas_price_spike", e.to_string())
            }
            EngineError::InsufficientPreseedSource { .. }
            | EngineError::InsufficientFeePayer { .. } => {
                ApiError::bad_request("insufficient_balance", e.to_string())
            }
            EngineError::FeePayerRequired | EngineError::GasSourceRequired => {
                ApiError::bad_request("missing_parameter", e.to_string())
            }
            EngineError::Pool(pool) => match pool {
                PoolError::Client(_) => ApiError::bad_request("provider_rejected", e.to_string()),
                PoolError::Exhausted { .. } => {
                    ApiError::new(StatusCode::BAD_GATEWAY, "providers_exhausted", e.to_string())
                }
            },
            EngineError::Store(_) | EngineError::Internal(_) => ApiError::internal(e.to_string()),
            EngineError::Derive(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<WatchError> for ApiError {
    fn from(e: WatchError) -> Self {
        match &e {
            WatchError::InvalidAddress { .. } => {
                ApiError::bad_request("invalid_address", e.to_string())
            }
            WatchError::AlreadyWatched => {
                ApiError::conflict("address_already_watched", e.to_string())
            }
            WatchError::NotFound(_) => ApiError::not_found("watch_not_found", e.to_string()),
            WatchError::AlreadyTerminal(_) => ApiError::conflict("watch_terminal", e.to_string()),
            WatchError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<TierError> for ApiError {
    fn from(e: TierError) -> Self {
        ApiError::bad_request("invalid_tiers", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;

    #[test]
    fn conflict_codes_for_busy_subsystems() {
        let err: ApiError = ScanError::AlreadyRunning(Chain::Btc).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "scan_in_progress");

        let err: ApiError = EngineError::Busy(Chain::Bsc).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "sweep_in_progress");
    }

    #[test]
    fn utxo_divergence_is_client_fatal() {
        let err: ApiError = EngineError::UtxoValidationFailed("count".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "utxo_validation_failed");
    }
}
