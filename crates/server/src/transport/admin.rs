// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin REST surface: session queries, command issuance, analytics.
//!
//! Every mutating route validates its input, writes a pending audit record,
//! publishes on the command bus, and answers with the generated command id
//! so operators can correlate acks. Store reads degrade to empty collections.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::protocol::{
    valid_session_hash, Command, CommandEnvelope, CommandStatus, SessionMode, ToastKind,
};
use crate::registry::TransitionError;
use crate::state::{epoch_ms, AppState};
use crate::store::CommandAudit;
use crate::transport::auth::ClientAddr;

// -- Request types ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DownspinRequest {
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ToastKind>,
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RedirectRequest {
    pub url: Option<String>,
    #[serde(rename = "newTab")]
    pub new_tab: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct BatchActionRequest {
    pub action: String,
    #[serde(rename = "sessionHashes")]
    pub session_hashes: Vec<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Operator identity attached to audit rows. The shared-secret scheme has no
/// principal of its own, so the id rides in an optional header.
struct AdminIdent {
    id: String,
    ip: Option<String>,
}

impl AdminIdent {
    fn from_request(headers: &HeaderMap, client: &ClientAddr) -> Self {
        let id = headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .unwrap_or("admin")
            .to_owned();
        Self { id, ip: client.0.clone() }
    }
}

// -- Command issuance ---------------------------------------------------------

enum IssueError {
    Terminated,
}

/// Shared command path: optional mode transition, audit write-through,
/// best-effort bus publish.
async fn issue_command(
    state: &AppState,
    session_hash: &str,
    mode_change: Option<(SessionMode, u64)>,
    command: Command,
    admin: &AdminIdent,
) -> Result<CommandEnvelope, IssueError> {
    let now = epoch_ms();

    if let Some((mode, latency_ms)) = mode_change {
        match state.registry.transition(session_hash, mode, latency_ms, now).await {
            Ok(applied) => state.writer.set_mode(session_hash, applied.mode, applied.latency_ms),
            Err(TransitionError::Terminated) => return Err(IssueError::Terminated),
        }
    }

    let envelope = CommandEnvelope::new(command, now);
    let payload = serde_json::to_value(&envelope)
        .ok()
        .and_then(|v| v.get("payload").cloned())
        .unwrap_or(serde_json::Value::Null);
    state.writer.log_command(CommandAudit {
        id: envelope.id.clone(),
        session_hash: session_hash.to_owned(),
        command_type: envelope.command_type().to_owned(),
        payload,
        admin_id: admin.id.clone(),
        admin_ip: admin.ip.clone(),
        status: CommandStatus::Pending,
        created_at: now,
    });

    state.bus.publish(session_hash, envelope.clone()).await;
    Ok(envelope)
}

fn check_hash(session_hash: &str) -> Result<(), axum::response::Response> {
    if valid_session_hash(session_hash) {
        Ok(())
    } else {
        Err(ApiError::BadRequest.to_http_response("invalid session hash").into_response())
    }
}

// -- Read handlers ------------------------------------------------------------

/// `GET /admin/sessions?minutes=N`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> impl IntoResponse {
    let minutes = query.minutes.unwrap_or(60);
    if !(1..=1440).contains(&minutes) {
        return ApiError::BadRequest
            .to_http_response("minutes must be between 1 and 1440")
            .into_response();
    }

    let since = epoch_ms().saturating_sub(minutes * 60_000);
    let sessions = state.sessions.get_active_sessions(since).await;
    Json(serde_json::json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
    .into_response()
}

/// `GET /admin/sessions/{hash}` — durable row, event timeline, command history.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }

    let row = state.sessions.get_session(&session_hash).await;
    let session = match row {
        Some(row) => serde_json::to_value(row).unwrap_or(serde_json::Value::Null),
        None => {
            // Store miss or degraded: fall back to live state if we hold it.
            let Some(entry) = state.registry.get(&session_hash).await else {
                return ApiError::NotFound.to_http_response("session not found").into_response();
            };
            let mode = entry.mode_state();
            let meta = entry.meta();
            serde_json::json!({
                "session_hash": entry.session_hash,
                "ip": meta.ip,
                "country_code": meta.geo.country_code,
                "city": meta.geo.city,
                "mode": mode.mode.as_str(),
                "current_latency_ms": mode.latency_ms,
                "total_events": entry.total_events.load(Ordering::Relaxed),
                "risk_score": entry.risk_score.load(Ordering::Relaxed),
                "is_bot": entry.is_bot.load(Ordering::Relaxed),
                "connected": entry.connected.load(Ordering::Relaxed),
                "first_seen": entry.first_seen_ms,
                "last_seen": entry.last_seen_ms.load(Ordering::Relaxed),
            })
        }
    };

    let timeline = state.events.recent_events(&session_hash, 100).await;
    let commands = state.sessions.get_command_history(&session_hash, 50).await;
    Json(serde_json::json!({
        "success": true,
        "session": session,
        "timeline": timeline,
        "commands": commands,
    }))
    .into_response()
}

/// `GET /admin/analytics?hours=N`
pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> impl IntoResponse {
    let hours = query.hours.unwrap_or(24);
    if !(1..=720).contains(&hours) {
        return ApiError::BadRequest
            .to_http_response("hours must be between 1 and 720")
            .into_response();
    }

    let cutoff = epoch_ms().saturating_sub(hours * 3_600_000);
    let summary = state.events.summary(cutoff).await;
    let geo_distribution = state.events.geo_distribution(cutoff).await;
    let bot_candidates = state.events.bot_candidates(cutoff).await;
    let db_stats = state.events.db_stats().await;
    let dashboard = state.sessions.get_dashboard_stats().await;
    Json(serde_json::json!({
        "success": true,
        "summary": summary,
        "geoDistribution": geo_distribution,
        "botCandidates": bot_candidates,
        "dbStats": db_stats,
        "dashboard": dashboard,
    }))
    .into_response()
}

/// `GET /admin/high-risk`
pub async fn high_risk(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.sessions.get_high_risk_sessions().await;
    Json(serde_json::json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// `GET /admin/stats` — live gauges, no store round-trips.
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry.stats().await;
    let connections: Vec<serde_json::Value> = state
        .registry
        .connection_stats()
        .await
        .iter()
        .map(|c| {
            serde_json::json!({
                "connectionId": c.connection_id,
                "sessionHash": c.session_hash.lock().clone(),
                "peerIp": c.peer_ip,
                "connectedAt": c.connected_at_ms,
                "lastActivityAt": c.last_activity_ms.load(Ordering::Relaxed),
                "eventCount": c.event_count.load(Ordering::Relaxed),
            })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "websocket": {
            "totalConnections": state.total_connections.load(Ordering::Relaxed),
            "activeConnections": registry.active_connections,
            "rateLimiter": state.limiter.stats(),
            "connections": connections,
        },
        "sessions": registry,
        "sink": state.sink.stats(),
        "bus": state.bus.stats(),
        "online": state.bus.online(),
        "timestamp": epoch_ms(),
    }))
}

// -- Command handlers ---------------------------------------------------------

/// `POST /admin/sessions/{hash}/upspin`
pub async fn upspin(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }
    let admin = AdminIdent::from_request(&headers, &client);

    match issue_command(
        &state,
        &session_hash,
        Some((SessionMode::Upspin, 0)),
        Command::SetLatency { latency_ms: 0 },
        &admin,
    )
    .await
    {
        Ok(command) => Json(serde_json::json!({
            "success": true,
            "sessionHash": session_hash,
            "mode": "upspin",
            "command": command,
        }))
        .into_response(),
        Err(IssueError::Terminated) => terminated_response(&session_hash),
    }
}

/// `POST /admin/sessions/{hash}/downspin`
pub async fn downspin(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
    body: Option<Json<DownspinRequest>>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }
    let latency_ms = body.and_then(|Json(b)| b.latency_ms).unwrap_or(2000);
    if latency_ms > 60_000 {
        return ApiError::BadRequest
            .to_http_response("latency_ms must be at most 60000")
            .into_response();
    }
    let admin = AdminIdent::from_request(&headers, &client);

    match issue_command(
        &state,
        &session_hash,
        Some((SessionMode::Downspin, latency_ms)),
        Command::SetLatency { latency_ms },
        &admin,
    )
    .await
    {
        Ok(command) => Json(serde_json::json!({
            "success": true,
            "sessionHash": session_hash,
            "latency_ms": latency_ms,
            "command": command,
        }))
        .into_response(),
        Err(IssueError::Terminated) => terminated_response(&session_hash),
    }
}

/// `POST /admin/sessions/{hash}/terminate`
pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
    body: Option<Json<TerminateRequest>>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Session terminated by operator".to_owned());
    let admin = AdminIdent::from_request(&headers, &client);

    match issue_command(
        &state,
        &session_hash,
        Some((SessionMode::Terminated, 0)),
        Command::Terminate { reason: reason.clone() },
        &admin,
    )
    .await
    {
        Ok(command) => Json(serde_json::json!({
            "success": true,
            "sessionHash": session_hash,
            "reason": reason,
            "command": command,
        }))
        .into_response(),
        Err(IssueError::Terminated) => terminated_response(&session_hash),
    }
}

/// `POST /admin/sessions/{hash}/notify`
pub async fn notify(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
    body: Option<Json<NotifyRequest>>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }
    let Some(Json(req)) = body else {
        return ApiError::BadRequest.to_http_response("message is required").into_response();
    };
    let Some(message) = req.message.filter(|m| !m.is_empty()) else {
        return ApiError::BadRequest.to_http_response("message is required").into_response();
    };
    let admin = AdminIdent::from_request(&headers, &client);

    let command = Command::ToastAlert {
        message,
        kind: req.kind.unwrap_or_default(),
        duration: req.duration.unwrap_or(5000),
    };
    match issue_command(&state, &session_hash, None, command, &admin).await {
        Ok(command) => Json(serde_json::json!({
            "success": true,
            "sessionHash": session_hash,
            "command": command,
        }))
        .into_response(),
        Err(IssueError::Terminated) => terminated_response(&session_hash),
    }
}

/// `POST /admin/sessions/{hash}/redirect`
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(session_hash): Path<String>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
    body: Option<Json<RedirectRequest>>,
) -> impl IntoResponse {
    if let Err(resp) = check_hash(&session_hash) {
        return resp;
    }
    let Some(url) = body.as_ref().and_then(|Json(b)| b.url.clone()).filter(|u| !u.is_empty())
    else {
        return ApiError::BadRequest.to_http_response("url is required").into_response();
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return ApiError::BadRequest
            .to_http_response("url must be http or https")
            .into_response();
    }
    let new_tab = body.and_then(|Json(b)| b.new_tab).unwrap_or(false);
    let admin = AdminIdent::from_request(&headers, &client);

    match issue_command(&state, &session_hash, None, Command::Redirect { url, new_tab }, &admin)
        .await
    {
        Ok(command) => Json(serde_json::json!({
            "success": true,
            "sessionHash": session_hash,
            "command": command,
        }))
        .into_response(),
        Err(IssueError::Terminated) => terminated_response(&session_hash),
    }
}

/// `POST /admin/batch-action`
pub async fn batch_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Extension(client): Extension<ClientAddr>,
    Json(req): Json<BatchActionRequest>,
) -> impl IntoResponse {
    let latency_ms = req
        .payload
        .as_ref()
        .and_then(|p| p.get("latency_ms"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(2000);
    let reason = req
        .payload
        .as_ref()
        .and_then(|p| p.get("reason"))
        .and_then(|r| r.as_str())
        .unwrap_or("Session terminated by operator")
        .to_owned();

    let plan: Option<(SessionMode, u64, Command)> = match req.action.as_str() {
        "upspin" => Some((SessionMode::Upspin, 0, Command::SetLatency { latency_ms: 0 })),
        "downspin" => {
            Some((SessionMode::Downspin, latency_ms, Command::SetLatency { latency_ms }))
        }
        "terminate" => {
            Some((SessionMode::Terminated, 0, Command::Terminate { reason: reason.clone() }))
        }
        _ => None,
    };
    let Some((mode, latency, command)) = plan else {
        return ApiError::BadRequest.to_http_response("unknown action").into_response();
    };

    let admin = AdminIdent::from_request(&headers, &client);
    let mut results = Vec::with_capacity(req.session_hashes.len());
    for session_hash in &req.session_hashes {
        if !valid_session_hash(session_hash) {
            results.push(serde_json::json!({
                "sessionHash": session_hash,
                "success": false,
                "error": "invalid session hash",
            }));
            continue;
        }
        match issue_command(&state, session_hash, Some((mode, latency)), command.clone(), &admin)
            .await
        {
            Ok(cmd) => results.push(serde_json::json!({
                "sessionHash": session_hash,
                "success": true,
                "commandId": cmd.id,
            })),
            Err(IssueError::Terminated) => results.push(serde_json::json!({
                "sessionHash": session_hash,
                "success": false,
                "error": "terminated",
            })),
        }
    }

    Json(serde_json::json!({
        "success": true,
        "action": req.action,
        "count": results.len(),
        "results": results,
    }))
    .into_response()
}

/// Sticky-terminated refusal: state unchanged, no command published.
fn terminated_response(session_hash: &str) -> axum::response::Response {
    Json(serde_json::json!({
        "success": false,
        "sessionHash": session_hash,
        "error": "terminated",
    }))
    .into_response()
}
