//! The poller's own HTTP surface, on its own port.
//!
//! Game-server routes (watch + points) are gated by a source-IP allowlist
//! (loopback always passes); dashboard routes require an admin session
//! cookie backed by bcrypt credentials.

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::chain::Chain;
use crate::http::error::ApiError;
use crate::store::{Store, WatchStatus};

use super::auth::AdminAuth;
use super::watcher::Watcher;

const ADMIN_COOKIE: &str = "hdpay_admin";

#[derive(Clone)]
pub struct PollerState {
    pub store: Store,
    pub watcher: Arc<Watcher>,
    pub auth: Arc<AdminAuth>,
    pub allowlist: Arc<Vec<IpAddr>>,
}

pub fn router(state: PollerState) -> Router {
    let api = Router::new()
        .route("/api/watch", post(create_watch))
        .route("/api/watch/{id}", delete(cancel_watch))
        .route("/api/watches", get(list_watches))
        .route("/api/points", get(all_points))
        .route("/api/points/pending", get(pending_points))
        .route("/api/points/claim", post(claim_points))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            allowlist_guard,
        ));

    let admin = Router::new()
        .route("/api/dashboard/summary", get(dashboard_summary))
        .route("/api/errors", get(system_errors))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_guard,
        ));

    Router::new()
        .route("/api/login", post(login))
        .merge(api)
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ----------------------------------------------------------------------
// Guards
// ----------------------------------------------------------------------

async fn allowlist_guard(
    State(state): State<PollerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = peer.ip();
    let allowed = ip.is_loopback() || state.allowlist.contains(&ip);
    if !allowed {
        tracing::warn!(peer = %ip, "rejected non-allowlisted source");
        return ApiError::new(
            StatusCode::FORBIDDEN,
            "source_not_allowed",
            "source address is not allowlisted",
        )
        .into_response();
    }
    next.run(request).await
}

fn session_token(request: &Request) -> Option<String> {
    let raw = request.headers().get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(ADMIN_COOKIE) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

async fn admin_guard(State(state): State<PollerState>, request: Request, next: Next) -> Response {
    let authorized = session_token(&request)
        .map(|token| state.auth.validate(&token))
        .unwrap_or(false);
    if !authorized {
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "session_required",
            "log in to use the dashboard",
        )
        .into_response();
    }
    next.run(request).await
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<PollerState>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, ApiError> {
    let token = state
        .auth
        .login(&body.username, &body.password)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "bad username or password",
            )
        })?;
    let cookie = format!("{ADMIN_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age=3600");
    let mut response = Json(json!({"ok": true})).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(response)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWatchBody {
    chain: Chain,
    address: String,
    duration_secs: Option<i64>,
}

async fn create_watch(
    State(state): State<PollerState>,
    Json(body): Json<CreateWatchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .watcher
        .create(body.chain, body.address, body.duration_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn cancel_watch(
    State(state): State<PollerState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.watcher.cancel(&id).await?;
    Ok(Json(json!({"cancelled": id})))
}

#[derive(Deserialize)]
struct ListWatchesQuery {
    #[serde(default)]
    all: bool,
}

async fn list_watches(
    State(state): State<PollerState>,
    Query(query): Query<ListWatchesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.store.watches(!query.all).await?;
    Ok(Json(rows))
}

async fn all_points(State(state): State<PollerState>) -> Result<impl IntoResponse, ApiError> {
    let rows = state.store.all_points().await?;
    Ok(Json(rows))
}

async fn pending_points(State(state): State<PollerState>) -> Result<impl IntoResponse, ApiError> {
    let rows = state.store.all_points().await?;
    let pending: Vec<_> = rows.into_iter().filter(|p| p.pending > 0).collect();
    Ok(Json(pending))
}

#[derive(Deserialize)]
struct ClaimBody {
    addresses: Vec<ClaimEntry>,
}

#[derive(Deserialize)]
struct ClaimEntry {
    chain: Chain,
    address: String,
}

async fn claim_points(
    State(state): State<PollerState>,
    Json(body): Json<ClaimBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.addresses.is_empty() {
        return Err(ApiError::bad_request(
            "empty_claim",
            "claim needs at least one address",
        ));
    }
    let claims: Vec<(Chain, String)> = body
        .addresses
        .into_iter()
        .map(|e| (e.chain, e.address))
        .collect();
    let claimed = state.store.claim_points(&claims).await?;
    Ok(Json(json!({"claimedAccounts": claimed})))
}

async fn dashboard_summary(
    State(state): State<PollerState>,
) -> Result<impl IntoResponse, ApiError> {
    let watches = state.store.watches(false).await?;
    let mut by_status: std::collections::HashMap<&'static str, usize> =
        std::collections::HashMap::new();
    for watch in &watches {
        *by_status
            .entry(match watch.status {
                WatchStatus::Active => "active",
                WatchStatus::Completed => "completed",
                WatchStatus::Expired => "expired",
                WatchStatus::Cancelled => "cancelled",
            })
            .or_default() += 1;
    }
    let points = state.store.all_points().await?;
    let unclaimed: i64 = points.iter().map(|p| p.unclaimed).sum();
    let pending: i64 = points.iter().map(|p| p.pending).sum();
    let total: i64 = points.iter().map(|p| p.total).sum();
    Ok(Json(json!({
        "watches": by_status,
        "points": {"unclaimed": unclaimed, "pending": pending, "total": total},
        "accounts": points.len(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorsQuery {
    #[serde(default = "default_error_page")]
    page: u32,
    #[serde(default = "default_error_page_size")]
    page_size: u32,
}

fn default_error_page() -> u32 {
    1
}

fn default_error_page_size() -> u32 {
    100
}

async fn system_errors(
    State(state): State<PollerState>,
    Query(query): Query<ErrorsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .store
        .system_errors_page(query.page, query.page_size.clamp(1, 500))
        .await?;
    let items: Vec<_> = rows
        .into_iter()
        .map(|(source, message, at)| json!({"source": source, "message": message, "at": at}))
        .collect();
    Ok(Json(items))
}
