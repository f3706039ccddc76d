// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-socket connection handler.
//!
//! Lifecycle: accept → `connected` greeting → (handshake binds a session) →
//! frame loop → close. The loop multiplexes inbound frames, the bounded
//! outbound queue, the keepalive timer, and cancellation (server shutdown,
//! supersession, slow-consumer overflow).
//!
//! Inbound processing order per frame: parse, liveness, pre-bind gate,
//! admission, dispatch. Every failure short of a socket error drops the
//! frame and keeps the connection alive.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::limiter::DenyReason;
use crate::protocol::{
    valid_session_hash, ClientFrame, Command, CommandEnvelope, CommandStatus, ServerFrame,
    SessionMode,
};
use crate::registry::{BindError, ConnectionHandle, ConnectionStat, SessionEntry, SessionMeta};
use crate::state::{epoch_ms, AppState};
use crate::store::CommandAudit;
use crate::transport::auth::ClientAddr;

const BAN_NOTICE: &str = "Too many requests - temporarily banned";

/// `GET /ws` — upgrade a client socket.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientAddr(peer_ip)): Extension<ClientAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, peer_ip))
}

enum FrameOutcome {
    Continue,
    /// Send one last frame, then close with the given reason.
    CloseAfter(Box<ServerFrame>, &'static str),
    Close(&'static str),
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, peer_ip: Option<String>) {
    let connection_id = format!("c-{}", uuid::Uuid::new_v4());
    state.total_connections.fetch_add(1, Ordering::Relaxed);

    let now = epoch_ms();
    let stat = state.registry.register_connection(&connection_id, peer_ip.clone(), now).await;
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.config.outbound_queue);
    let handle = ConnectionHandle::new(connection_id.clone(), outbound_tx);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let greeting = ServerFrame::Connected { connection_id: connection_id.clone(), timestamp: now };
    if send_frame(&mut ws_tx, &greeting).await.is_err() {
        state.registry.remove_connection(&connection_id).await;
        return;
    }
    tracing::debug!(connection = %connection_id, peer = ?peer_ip, "connection accepted");

    let mut bound: Option<Arc<SessionEntry>> = None;
    let mut close_reason: &'static str = "peer_closed";

    let ping_period = state.config.ping_interval();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                close_reason = "shutdown";
                break;
            }
            _ = handle.cancel.cancelled() => {
                close_reason = handle.close_reason().unwrap_or("cancelled");
                break;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            close_reason = "write_error";
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                let now = epoch_ms();
                let idle = now.saturating_sub(stat.last_activity_ms.load(Ordering::Relaxed));
                if idle > state.config.idle_timeout_ms {
                    close_reason = "idle_timeout";
                    break;
                }
                if send_frame(&mut ws_tx, &ServerFrame::Ping { timestamp: now }).await.is_err() {
                    close_reason = "write_error";
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stat.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
                        let outcome = handle_frame(
                            &state, &handle, &stat, &mut bound, peer_ip.as_deref(), text.as_str(),
                        )
                        .await;
                        match outcome {
                            FrameOutcome::Continue => {}
                            FrameOutcome::CloseAfter(frame, reason) => {
                                let _ = send_frame(&mut ws_tx, &frame).await;
                                close_reason = reason;
                                break;
                            }
                            FrameOutcome::Close(reason) => {
                                close_reason = reason;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and protocol-level ping/pong count as traffic.
                        stat.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
                    }
                    Some(Err(_)) => {
                        close_reason = "read_error";
                        break;
                    }
                }
            }
        }
    }

    // Teardown: detach, free the presence slot, persist the disconnect.
    if let Some(hash) = state.registry.unbind(&connection_id).await {
        state.bus.track_unbind(&hash);
        state.writer.set_connected(&hash, false, epoch_ms());
    }
    state.registry.remove_connection(&connection_id).await;
    tracing::debug!(connection = %connection_id, reason = close_reason, "connection closed");
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(frame) else {
        return Ok(());
    };
    ws_tx.send(Message::Text(json.into())).await
}

async fn handle_frame(
    state: &Arc<AppState>,
    handle: &ConnectionHandle,
    stat: &ConnectionStat,
    bound: &mut Option<Arc<SessionEntry>>,
    peer_ip: Option<&str>,
    text: &str,
) -> FrameOutcome {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(connection = %handle.connection_id, err = %e, "unparseable frame dropped");
            return FrameOutcome::Continue;
        }
    };
    let now = epoch_ms();

    let frame_type =
        value.get("type").and_then(|v| v.as_str()).unwrap_or("").to_owned();
    let frame_hash = value.get("sessionHash").and_then(|v| v.as_str()).map(str::to_owned);

    // Pre-bind gate: without a session hash, an unbound connection may only
    // hand-shake.
    if bound.is_none() && frame_hash.is_none() && frame_type != "handshake" {
        tracing::trace!(connection = %handle.connection_id, frame_type, "pre-bind frame dropped");
        return FrameOutcome::Continue;
    }

    let admit_key = bound
        .as_ref()
        .map(|e| e.session_hash.clone())
        .or(frame_hash)
        .unwrap_or_else(|| handle.connection_id.clone());

    let admission = state.limiter.admit(&admit_key);
    if !admission.allowed {
        return match admission.reason {
            Some(DenyReason::Banned) => {
                let envelope =
                    CommandEnvelope::new(Command::Terminate { reason: BAN_NOTICE.into() }, now);
                FrameOutcome::CloseAfter(
                    Box::new(ServerFrame::Command { command: envelope }),
                    "banned",
                )
            }
            _ => {
                let stats = state.limiter.violation_stats(&admit_key);
                state.writer.violation(&admit_key, stats.count, now);
                if stats.should_throttle && state.config.auto_throttle {
                    auto_throttle(state, &admit_key, now).await;
                }
                FrameOutcome::Continue
            }
        };
    }

    // Terminated sessions ignore all inbound traffic.
    if bound.as_ref().is_some_and(|e| e.mode_state().mode == SessionMode::Terminated) {
        return FrameOutcome::Continue;
    }

    let frame: ClientFrame = match serde_json::from_value(value) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(connection = %handle.connection_id, frame_type, err = %e, "unknown frame dropped");
            return FrameOutcome::Continue;
        }
    };

    match frame {
        ClientFrame::Handshake { session_hash, metadata } => {
            if !valid_session_hash(&session_hash) {
                tracing::warn!(connection = %handle.connection_id, "handshake with malformed session hash dropped");
                return FrameOutcome::Continue;
            }
            let geo = peer_ip.map(|ip| state.geo.lookup_str(ip)).unwrap_or_default();
            let meta =
                SessionMeta { ip: peer_ip.map(str::to_owned), geo, client: metadata };
            match state.registry.bind(handle.clone(), &session_hash, meta.clone(), now).await {
                Ok(entry) => {
                    *bound = Some(entry);
                    state.bus.track_bind(&session_hash);
                    state.writer.upsert_session(&session_hash, meta, now);
                    tracing::info!(connection = %handle.connection_id, session = %session_hash, "session bound");
                    FrameOutcome::Continue
                }
                Err(BindError::Terminated) => FrameOutcome::Close("terminated"),
            }
        }

        ClientFrame::Batch { session_hash, events, .. } => {
            if !valid_session_hash(&session_hash) {
                return FrameOutcome::Continue;
            }
            ingest_events(state, stat, &session_hash, &events, peer_ip, now).await;
            FrameOutcome::Continue
        }

        ClientFrame::Event { session_hash, fields } => {
            ingest_single(state, stat, bound, "event", session_hash, fields, peer_ip, now).await
        }

        ClientFrame::Interaction { session_hash, fields } => {
            ingest_single(state, stat, bound, "interaction", session_hash, fields, peer_ip, now)
                .await
        }

        ClientFrame::CommandAck { command_id, result, .. } => {
            let error = result
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(|e| e.as_str())
                .map(str::to_owned);
            let status =
                if error.is_some() { CommandStatus::Failed } else { CommandStatus::Acknowledged };
            state.writer.command_status(&command_id, status, error, now);
            FrameOutcome::Continue
        }

        ClientFrame::Pong { .. } => FrameOutcome::Continue,
    }
}

/// Single `event`/`interaction` frame: the enum tag is the event type, so it
/// is restored into the raw record before normalization.
#[allow(clippy::too_many_arguments)]
async fn ingest_single(
    state: &Arc<AppState>,
    stat: &ConnectionStat,
    bound: &Option<Arc<SessionEntry>>,
    event_type: &str,
    session_hash: Option<String>,
    mut fields: serde_json::Map<String, serde_json::Value>,
    peer_ip: Option<&str>,
    now: u64,
) -> FrameOutcome {
    let Some(hash) = session_hash.or_else(|| bound.as_ref().map(|e| e.session_hash.clone()))
    else {
        return FrameOutcome::Continue;
    };
    if !valid_session_hash(&hash) {
        return FrameOutcome::Continue;
    }
    fields.insert("type".to_owned(), serde_json::Value::String(event_type.to_owned()));
    let raw = serde_json::Value::Object(fields);
    ingest_events(state, stat, &hash, std::slice::from_ref(&raw), peer_ip, now).await;
    FrameOutcome::Continue
}

/// Stamp, normalize, and enqueue a slice of raw events, then update the
/// session's counters and risk.
async fn ingest_events(
    state: &Arc<AppState>,
    stat: &ConnectionStat,
    session_hash: &str,
    events: &[serde_json::Value],
    peer_ip: Option<&str>,
    now: u64,
) {
    let mut accepted = 0u64;
    for raw in events {
        let row = crate::sink::EventRow::normalize(raw, session_hash, peer_ip, now);
        if state.sink.enqueue(row) {
            accepted += 1;
        }
    }
    if accepted == 0 && !events.is_empty() {
        tracing::debug!(session = %session_hash, "event queue full, batch dropped");
    }

    let delta = events.len() as u64;
    stat.event_count.fetch_add(delta, Ordering::Relaxed);

    let entry = state.registry.get_or_create(session_hash, now).await;
    state.registry.touch(session_hash, delta, now).await;
    state.writer.increment_events(session_hash, delta, now);

    let risk = state.limiter.assess_risk(session_hash);
    if entry.apply_risk(risk.score, risk.is_bot) {
        state.writer.set_risk(
            session_hash,
            entry.risk_score.load(Ordering::Relaxed),
            entry.is_bot.load(Ordering::Relaxed),
        );
    }
}

/// Push a session into downspin with the configured throttle latency, at
/// most once per debounce window. The command travels the bus like any
/// admin-issued one, with a synthetic operator identity in the audit.
async fn auto_throttle(state: &Arc<AppState>, session_hash: &str, now: u64) {
    if !valid_session_hash(session_hash) {
        // Pre-bind keys are connection ids; nothing to throttle yet.
        return;
    }
    let entry = state.registry.get_or_create(session_hash, now).await;
    if !entry.claim_throttle_slot(now, state.config.throttle_debounce_ms) {
        return;
    }

    let latency_ms = state.config.throttle_latency_ms;
    match state.registry.transition(session_hash, SessionMode::Downspin, latency_ms, now).await {
        Ok(mode) => {
            state.writer.set_mode(session_hash, mode.mode, mode.latency_ms);
        }
        Err(_) => return,
    }

    let envelope = CommandEnvelope::new(Command::SetLatency { latency_ms }, now);
    state.writer.log_command(CommandAudit {
        id: envelope.id.clone(),
        session_hash: session_hash.to_owned(),
        command_type: envelope.command_type().to_owned(),
        payload: serde_json::json!({ "latency_ms": latency_ms }),
        admin_id: "auto-throttle".to_owned(),
        admin_ip: None,
        status: CommandStatus::Pending,
        created_at: now,
    });
    tracing::info!(session = %session_hash, latency_ms, "auto-throttle engaged");
    state.bus.publish(session_hash, envelope).await;
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
