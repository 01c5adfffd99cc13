//! The main (localhost-only) HTTP API: addresses, scans, sweeps, health,
//! settings, transaction history, and the two SSE streams.

pub mod error;
pub mod middleware;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors, trace};

use crate::chain::{Chain, Network, Token};
use crate::engine::bsc::BscEngine;
use crate::engine::reconciler::orphaned_sweeps;
use crate::engine::{SweepEngine, SweepRequest};
use crate::events::{self, EventHub, HubEvent};
use crate::providers::ScanBackend;
use crate::scanner::Scanner;
use crate::store::{Direction, Store, TxStatus};

use error::ApiError;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Settings keys the UI may change; everything else is read-only.
const MUTABLE_SETTINGS: &[&str] = &[
    "preview_divergence_count_pct",
    "preview_divergence_value_pct",
    "gas_preseed_amount",
];

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub network: Network,
    pub scanner: Arc<Scanner>,
    pub engines: Arc<HashMap<Chain, Arc<dyn SweepEngine>>>,
    pub bsc_engine: Arc<BscEngine>,
    pub backends: Arc<Vec<Arc<dyn ScanBackend>>>,
    pub scan_hub: Arc<EventHub>,
    pub tx_hub: Arc<EventHub>,
}

impl AppState {
    fn engine(&self, chain: Chain) -> Result<Arc<dyn SweepEngine>, ApiError> {
        self.engines
            .get(&chain)
            .cloned()
            .ok_or_else(|| ApiError::bad_request("invalid_chain", format!("no engine for {chain}")))
    }
}

/// Builds the complete router, middleware included.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/addresses/{chain}", get(get_addresses))
        .route("/api/addresses/{chain}/export", get(export_addresses))
        .route("/api/scan/start", post(start_scan))
        .route("/api/scan/stop", post(stop_scan))
        .route("/api/scan/status", get(scan_status))
        .route("/api/scan/sse", get(scan_sse))
        .route("/api/send/preview", post(send_preview))
        .route("/api/send/execute", post(send_execute))
        .route("/api/send/gas-preseed", post(gas_preseed))
        .route("/api/send/sweep/{id}", get(sweep_status))
        .route("/api/send/pending", get(pending_sweeps))
        .route("/api/send/dismiss/{id}", post(dismiss_sweep))
        .route("/api/send/sse", get(tx_sse))
        .route("/api/health/providers", get(provider_health))
        .route("/api/settings", get(get_settings))
        .route("/api/settings", put(put_settings))
        .route("/api/reset/balances", post(reset_balances))
        .route("/api/reset/all", post(reset_all2))
        .route("/api/transactions", get(get_transactions))
        .layer(axum::middleware::from_fn(middleware::csrf_guard))
        .layer(axum::middleware::from_fn(middleware::host_guard))
        .layer(trace::TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT])
                .allow_headers(cors::Any),
        )
        .with_state(state)
}

fn parse_chain(raw: &str) -> Result<Chain, ApiError> {
    raw.parse::<Chain>().map_err(ApiError::from)
}

// ----------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressPageQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
    has_balance: Option<bool>,
    token: Option<Token>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceView {
    token: Token,
    amount: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddressView {
    index: u32,
    address: String,
    balances: Vec<BalanceView>,
}

async fn get_addresses(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Query(query): Query<AddressPageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = parse_chain(&chain)?;
    let page_size = query.page_size.clamp(1, 500);
    let (rows, total) = state
        .store
        .addresses_page(chain, query.page, page_size, query.has_balance, query.token)
        .await?;
    let items: Vec<AddressView> = rows
        .into_iter()
        .map(|(address, balances)| AddressView {
            index: address.index,
            address: address.address,
            balances: balances
                .into_iter()
                .map(|b| BalanceView {
                    token: b.token,
                    amount: b.amount.to_string(),
                })
                .collect(),
        })
        .collect();
    Ok(Json(json!({
        "chain": chain,
        "page": query.page,
        "pageSize": page_size,
        "total": total,
        "items": items,
    })))
}

async fn export_addresses(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = parse_chain(&chain)?;
    let rows = state.store.addresses_export(chain).await?;
    let items: Vec<AddressView> = rows
        .into_iter()
        .map(|(address, balances)| AddressView {
            index: address.index,
            address: address.address,
            balances: balances
                .into_iter()
                .map(|b| BalanceView {
                    token: b.token,
                    amount: b.amount.to_string(),
                })
                .collect(),
        })
        .collect();
    Ok(Json(items))
}

// ----------------------------------------------------------------------
// Scan
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct StartScanBody {
    chain: Chain,
    #[serde(rename = "maxID")]
    max_id: u32,
}

async fn start_scan(
    State(state): State<AppState>,
    Json(body): Json<StartScanBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.scanner.start(body.chain, body.max_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"started": body.chain}))))
}

#[derive(Deserialize)]
struct StopScanBody {
    chain: Chain,
}

async fn stop_scan(
    State(state): State<AppState>,
    Json(body): Json<StopScanBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.scanner.stop(body.chain)?;
    Ok(Json(json!({"stopped": body.chain})))
}

async fn scan_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let states = state.store.all_scan_states().await?;
    let mut funded = HashMap::new();
    for chain in Chain::ALL {
        funded.insert(chain, state.store.funded_count(chain).await?);
    }
    Ok(Json(json!({"scans": states, "fundedCounts": funded})))
}

async fn scan_sse(State(state): State<AppState>) -> impl IntoResponse {
    let resync = state.scanner.state_events().await;
    let subscription = state.scan_hub.subscribe(resync);
    Sse::new(subscription.into_stream())
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
}

async fn tx_sse(State(state): State<AppState>) -> impl IntoResponse {
    let resync = match state.store.non_terminal_tx_states().await {
        Ok(rows) => vec![HubEvent::new(events::TX_STATUS, &json!({"snapshot": rows}))],
        Err(_) => Vec::new(),
    };
    let subscription = state.tx_hub.subscribe(resync);
    Sse::new(subscription.into_stream())
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
}

// ----------------------------------------------------------------------
// Send
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct SendBody {
    chain: Chain,
    #[serde(flatten)]
    request: SweepRequest,
}

async fn send_preview(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine(body.chain)?;
    let preview = engine.preview(&body.request).await?;
    Ok(Json(preview))
}

async fn send_execute(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine(body.chain)?;
    let started = engine.execute(body.request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreseedBody {
    source_index: u32,
    token: Token,
}

async fn gas_preseed(
    State(state): State<AppState>,
    Json(body): Json<PreseedBody>,
) -> Result<impl IntoResponse, ApiError> {
    let started = state
        .bsc_engine
        .gas_preseed(body.source_index, body.token)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn sweep_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.store.tx_states_for_sweep(&id).await?;
    if rows.is_empty() {
        return Err(ApiError::not_found("sweep_not_found", format!("no sweep {id}")));
    }
    Ok(Json(json!({"sweepId": id, "txStates": rows})))
}

async fn pending_sweeps(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let orphans = orphaned_sweeps(&state.store).await?;
    Ok(Json(orphans))
}

async fn dismiss_sweep(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let dismissed = state.store.dismiss_sweep(&id).await?;
    if dismissed == 0 {
        return Err(ApiError::not_found(
            "sweep_not_found",
            format!("no open tx-state for sweep {id}"),
        ));
    }
    Ok(Json(json!({"sweepId": id, "dismissed": dismissed})))
}

// ----------------------------------------------------------------------
// Health, settings, resets, history
// ----------------------------------------------------------------------

async fn provider_health(State(state): State<AppState>) -> impl IntoResponse {
    let mut rows = Vec::new();
    for backend in state.backends.iter() {
        rows.extend(backend.health());
    }
    Json(rows)
}

async fn get_settings(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let settings = state.store.all_settings().await?;
    Ok(Json(json!({
        "network": state.network,
        "mutableKeys": MUTABLE_SETTINGS,
        "settings": settings,
    })))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    for key in body.keys() {
        if !MUTABLE_SETTINGS.contains(&key.as_str()) {
            return Err(ApiError::bad_request(
                "setting_not_mutable",
                format!("{key} cannot be changed at runtime"),
            ));
        }
    }
    for (key, value) in &body {
        if value.parse::<f64>().is_err() {
            return Err(ApiError::bad_request(
                "invalid_setting_value",
                format!("{key} must be numeric"),
            ));
        }
        state.store.put_setting(key, value).await?;
    }
    Ok(Json(json!({"updated": body.len()})))
}

async fn reset_balances(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.store.reset_balances().await?;
    Ok(Json(json!({"network": state.network, "deletedBalances": deleted})))
}

#[axum::debug_handler]
async fn reset_all2(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    for chain in Chain::ALL {
        if state.scanner.is_scanning(chain) {
            return Err(ApiError::conflict(
                "scan_in_progress",
                format!("stop the {chain} scan before resetting"),
            ));
        }
    }
    state.store.reset_all2().await?;
    Ok(Json(json!({"network": state.network, "reset": "all"})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxHistoryQuery {
    chain: Option<Chain>,
    direction: Option<Direction>,
    token: Option<Token>,
    status: Option<TxStatus>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

async fn get_transactions(
    State(state): State<AppState>,
    Query(query): Query<TxHistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page_size = query.page_size.clamp(1, 500);
    let (records, total) = state
        .store
        .transactions_page(
            query.chain,
            query.direction,
            query.token,
            query.status,
            query.page,
            page_size,
        )
        .await?;
    Ok(Json(json!({
        "page": query.page,
        "pageSize": page_size,
        "total": total,
        "items": records,
    })))
}
