// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public (non-admin) HTTP handlers: the unload beacon and health.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use bytes::Bytes;

use crate::protocol::valid_session_hash;
use crate::sink::EventRow;
use crate::state::{epoch_ms, rss_kb, AppState};
use crate::transport::auth::ClientAddr;

/// Beacon bodies past this size are acknowledged and discarded.
const MAX_BEACON_BYTES: usize = 1_048_576;

/// `POST /beacon` — fire-and-forget event ingestion for page unload.
///
/// Always `204 No Content`, even for garbage: the sender is mid-unload and
/// cannot act on errors. Parsing and enqueueing happen off the response path.
pub async fn beacon(
    State(state): State<Arc<AppState>>,
    Extension(ClientAddr(peer_ip)): Extension<ClientAddr>,
    body: Bytes,
) -> StatusCode {
    if body.len() <= MAX_BEACON_BYTES {
        tokio::spawn(async move {
            ingest_beacon(&state, &body, peer_ip.as_deref());
        });
    }
    StatusCode::NO_CONTENT
}

fn ingest_beacon(state: &AppState, body: &[u8], peer_ip: Option<&str>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        tracing::debug!("beacon: unparseable body dropped");
        return;
    };
    let Some(events) = value.get("events").and_then(|e| e.as_array()) else {
        return;
    };

    let now = epoch_ms();
    let mut accepted = 0usize;
    for raw in events {
        let Some(hash) = raw.get("sessionHash").and_then(|h| h.as_str()) else {
            continue;
        };
        if !valid_session_hash(hash) {
            continue;
        }
        if state.sink.enqueue(EventRow::normalize(raw, hash, peer_ip, now)) {
            accepted += 1;
        }
    }
    tracing::trace!(total = events.len(), accepted, "beacon ingested");
}

/// `GET /health` — 200 when every dependency reports healthy, else 503.
///
/// Dependencies are reported by role; an unconfigured one is vacuously
/// healthy so store-less single-node deployments stay green.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let events = state.events.healthy().await;
    let sessions = state.sessions.healthy().await;
    // The in-process bus is always up; the NATS mirror is optional transport.
    let bus = true;

    let healthy = bus && events && sessions;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = Json(serde_json::json!({
        "healthy": healthy,
        "bus": bus,
        "events": events,
        "sessions": sessions,
        "uptime": state.uptime_secs(),
        "memory": rss_kb(),
        "timestamp": epoch_ms(),
    }));
    (status, body)
}
