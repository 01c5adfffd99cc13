//! Boundary middleware: localhost enforcement and the CSRF cookie pattern.
//!
//! The main API binds to localhost only, and the Host header is checked on
//! top of that so DNS-rebinding pages in a local browser cannot reach it.
//! GET responses issue a CSRF cookie; mutating methods must echo the cookie
//! value in `X-CSRF-Token`.

use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::RngCore;

use super::error::ApiError;

pub const CSRF_COOKIE: &str = "hdpay_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Rejects any request whose Host header is not localhost.
pub async fn host_guard(request: Request, next: Next) -> Response {
    let host_ok = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| {
            let name = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
            name == "localhost" || name == "127.0.0.1" || name == "[::1]"
        })
        .unwrap_or(false);
    if !host_ok {
        return ApiError::new(
            StatusCode::FORBIDDEN,
            "host_not_allowed",
            "this service only answers to localhost",
        )
        .into_response();
    }
    next.run(request).await
}

fn cookie_value(request: &Request, name: &str) -> Option<String> {
    let header = request.headers().get(header::COOKIE)?.to_str().ok()?;
    for pair in header.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

/// GET issues the token cookie; mutating methods must echo it in a header.
pub async fn csrf_guard(request: Request, next: Next) -> Response {
    let cookie = cookie_value(&request, CSRF_COOKIE);
    let mutating = !matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    );

    if mutating {
        let presented = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let valid = match (&cookie, &presented) {
            (Some(c), Some(p)) => !c.is_empty() && c == p,
            _ => false,
        };
        if !valid {
            return ApiError::new(
                StatusCode::FORBIDDEN,
                "csrf_token_invalid",
                "missing or mismatched CSRF token",
            )
            .into_response();
        }
        return next.run(request).await;
    }

    let mut response = next.run(request).await;
    if cookie.is_none() {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        // Not HttpOnly: the dashboard reads the cookie to echo it back in
        // the header.
        let value = format!(
            "{CSRF_COOKIE}={}; Path=/; SameSite=Strict",
            hex::encode(bytes)
        );
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}
