// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the control plane.

pub mod admin;
pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` with the full route surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Client plane
        .route("/ws", get(ws::ws_handler))
        .route("/beacon", post(http::beacon))
        // Health (authless, rate-limited like everything else)
        .route("/health", get(http::health))
        // Admin plane
        .route("/admin/sessions", get(admin::list_sessions))
        .route("/admin/sessions/{session_hash}", get(admin::get_session))
        .route("/admin/sessions/{session_hash}/upspin", post(admin::upspin))
        .route("/admin/sessions/{session_hash}/downspin", post(admin::downspin))
        .route("/admin/sessions/{session_hash}/terminate", post(admin::terminate))
        .route("/admin/sessions/{session_hash}/notify", post(admin::notify))
        .route("/admin/sessions/{session_hash}/redirect", post(admin::redirect))
        .route("/admin/analytics", get(admin::analytics))
        .route("/admin/high-risk", get(admin::high_risk))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/batch-action", post(admin::batch_action))
        // Middleware (innermost first: auth runs after the ingress limit)
        .layer(middleware::from_fn_with_state(state.clone(), auth::admin_auth_layer))
        .layer(middleware::from_fn_with_state(state.clone(), auth::ingress_limit_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
