// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate the `X-API-Key` header against the configured secret.
///
/// Fails closed: with no secret configured, nothing authenticates.
pub fn validate_api_key(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::Unauthorized);
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if constant_time_eq(provided, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Best-effort client identity for rate limiting: `X-Forwarded-For` first
/// hop, else the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<&SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().map(str::trim).unwrap_or_default();
        if !first.is_empty() {
            return Some(first.to_owned());
        }
    }
    peer.map(|addr| addr.ip().to_string())
}

/// Client address resolved by the ingress middleware and stashed as a
/// request extension, so handlers need no transport-specific extractor.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub Option<String>);

/// Axum middleware enforcing the admin shared secret on `/admin` routes.
pub async fn admin_auth_layer(
    state: State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !req.uri().path().starts_with("/admin") {
        return next.run(req).await;
    }

    if let Err(code) = validate_api_key(req.headers(), state.config.admin_api_key.as_deref()) {
        return code.to_http_response("Unauthorized").into_response();
    }

    next.run(req).await
}

/// Axum middleware applying the per-IP ingress limit to every HTTP route.
/// Also resolves and stashes [`ClientAddr`] for downstream handlers.
pub async fn ingress_limit_layer(
    state: State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0);
    let client = client_ip(req.headers(), peer.as_ref());
    req.extensions_mut().insert(ClientAddr(client.clone()));
    let key = client.unwrap_or_else(|| "unknown".to_owned());

    let admission = state.ingress.admit(&key);
    if !admission.allowed {
        let retry_after = admission.retry_after_ms.unwrap_or(60_000).div_ceil(1000);
        let (status, body) = ApiError::TooManyRequests.to_http_response("Too many requests");
        let mut response = (status, body).into_response();
        if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
        return response;
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
