// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::ServerConfig;
use crate::geo::GeoResolver;
use crate::registry::ConnectionStat;
use crate::store::events::EventStore;
use crate::store::sessions::SessionStore;
use crate::store::writer::spawn_writer;

const HASH: &str = "abcdef0123456789";

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        admin_api_key: Some("test-secret".into()),
        node_id: Some("node-test".into()),
        event_store_url: None,
        session_store_url: None,
        require_stores: false,
        store_connect_timeout_ms: 2000,
        store_op_timeout_ms: 30_000,
        nats_url: None,
        nats_prefix: "traffic".into(),
        bus_publish_timeout_ms: 1000,
        rl_capacity: 20,
        rl_refill_rate: 5,
        rl_refill_interval_ms: 1000,
        rl_max_events_per_second: 5.0,
        auto_throttle: true,
        throttle_latency_ms: 2000,
        throttle_debounce_ms: 5000,
        ban_threshold: 50,
        ban_duration_ms: 300_000,
        rl_idle_eviction_ms: 3_600_000,
        http_rate_limit: 100,
        ping_interval_ms: 30_000,
        idle_timeout_ms: 90_000,
        outbound_queue: 256,
        sink_max_queue: 10_000,
        sink_batch_size: 100,
        sink_flush_interval_ms: 5_000,
        sink_requeue_limit: 1_000,
        geoip_data: None,
        stats_refresh_ms: 60_000,
        event_retention_days: 30,
        session_retention_days: 7,
    }
}

fn test_state_with(tweak: impl FnOnce(&mut ServerConfig)) -> Arc<AppState> {
    let mut config = test_config();
    tweak(&mut config);
    let shutdown = CancellationToken::new();
    let events = Arc::new(EventStore::disabled());
    let sessions = Arc::new(SessionStore::disabled());
    let (writer, _handle) =
        spawn_writer(Arc::clone(&sessions), Arc::clone(&events), shutdown.clone());
    Arc::new(AppState::new(config, events, sessions, writer, GeoResolver::load(None), shutdown))
}

fn test_state() -> Arc<AppState> {
    test_state_with(|_| {})
}

struct Conn {
    handle: ConnectionHandle,
    stat: Arc<ConnectionStat>,
    rx: mpsc::Receiver<ServerFrame>,
    bound: Option<Arc<SessionEntry>>,
}

async fn open_connection(state: &Arc<AppState>, id: &str) -> Conn {
    let stat = state.registry.register_connection(id, Some("8.8.8.8".into()), epoch_ms()).await;
    let (tx, rx) = mpsc::channel(state.config.outbound_queue);
    Conn { handle: ConnectionHandle::new(id.to_owned(), tx), stat, rx, bound: None }
}

async fn feed(state: &Arc<AppState>, conn: &mut Conn, frame: serde_json::Value) -> FrameOutcome {
    handle_frame(state, &conn.handle, &conn.stat, &mut conn.bound, Some("8.8.8.8"), &frame.to_string())
        .await
}

fn handshake_frame() -> serde_json::Value {
    serde_json::json!({
        "type": "handshake",
        "sessionHash": HASH,
        "metadata": {"screenWidth": 1920, "screenHeight": 1080, "timezone": "UTC"}
    })
}

#[tokio::test]
async fn handshake_binds_and_enriches() -> anyhow::Result<()> {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;

    let outcome = feed(&state, &mut conn, handshake_frame()).await;
    assert!(matches!(outcome, FrameOutcome::Continue));

    let entry = conn.bound.as_ref().ok_or_else(|| anyhow::anyhow!("not bound"))?;
    assert_eq!(entry.session_hash, HASH);
    assert!(entry.connected.load(Ordering::Relaxed));
    assert!(state.bus.holds(HASH), "presence tracks the bind");

    let meta = entry.meta();
    assert_eq!(meta.ip.as_deref(), Some("8.8.8.8"));
    assert_eq!(meta.geo.country_code.as_deref(), Some("US"));
    assert_eq!(meta.client.screen_width, Some(1920));
    assert!(conn.rx.try_recv().is_err(), "handshake pushes no unsolicited frames");
    Ok(())
}

#[tokio::test]
async fn handshake_with_bad_hash_is_dropped() {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;

    let frame = serde_json::json!({"type": "handshake", "sessionHash": "nope"});
    let outcome = feed(&state, &mut conn, frame).await;
    assert!(matches!(outcome, FrameOutcome::Continue));
    assert!(conn.bound.is_none());
}

#[tokio::test]
async fn handshake_to_terminated_session_closes() -> anyhow::Result<()> {
    let state = test_state();
    state
        .registry
        .transition(HASH, SessionMode::Terminated, 0, epoch_ms())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let mut conn = open_connection(&state, "c-1").await;
    let outcome = feed(&state, &mut conn, handshake_frame()).await;
    assert!(matches!(outcome, FrameOutcome::Close("terminated")));
    Ok(())
}

#[tokio::test]
async fn prebind_gate_drops_hashless_frames() {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;

    let outcome = feed(&state, &mut conn, serde_json::json!({"type": "batch"})).await;
    assert!(matches!(outcome, FrameOutcome::Continue));
    assert_eq!(state.sink.stats().queue_depth, 0);
    assert_eq!(state.limiter.stats().tracked_keys, 0, "gated frames never reach admission");
}

#[tokio::test]
async fn unparseable_frame_keeps_connection() {
    let state = test_state();
    let conn = open_connection(&state, "c-1").await;
    let mut bound = None;
    let outcome = handle_frame(&state, &conn.handle, &conn.stat, &mut bound, None, "{not json").await;
    assert!(matches!(outcome, FrameOutcome::Continue));
}

#[tokio::test]
async fn batch_ingests_touches_and_scores() -> anyhow::Result<()> {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;

    let batch = serde_json::json!({
        "type": "batch",
        "sessionHash": HASH,
        "events": [
            {"type": "interaction", "interactionType": "click"},
            {"type": "event", "name": "scroll"}
        ]
    });
    let outcome = feed(&state, &mut conn, batch).await;
    assert!(matches!(outcome, FrameOutcome::Continue));

    assert_eq!(state.sink.stats().queue_depth, 2);
    assert_eq!(conn.stat.event_count.load(Ordering::Relaxed), 2);
    let entry = conn.bound.as_ref().ok_or_else(|| anyhow::anyhow!("not bound"))?;
    assert_eq!(entry.total_events.load(Ordering::Relaxed), 2);
    Ok(())
}

#[tokio::test]
async fn single_event_frame_ingests() {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;

    let frame = serde_json::json!({
        "type": "interaction",
        "sessionHash": HASH,
        "interactionType": "click"
    });
    feed(&state, &mut conn, frame).await;
    assert_eq!(state.sink.stats().queue_depth, 1);
}

#[tokio::test]
async fn banned_session_gets_terminate_and_close() -> anyhow::Result<()> {
    let state = test_state_with(|c| {
        c.rl_capacity = 1;
        c.rl_refill_rate = 1;
        c.rl_refill_interval_ms = 60_000;
        c.ban_threshold = 2;
        c.auto_throttle = false;
    });
    let mut conn = open_connection(&state, "c-1").await;

    // Handshake spends the only token; two denials cross the threshold.
    feed(&state, &mut conn, handshake_frame()).await;
    for _ in 0..2 {
        let outcome = feed(&state, &mut conn, serde_json::json!({"type": "pong"})).await;
        assert!(matches!(outcome, FrameOutcome::Continue), "denied frames drop silently");
    }

    let outcome = feed(&state, &mut conn, serde_json::json!({"type": "pong"})).await;
    match outcome {
        FrameOutcome::CloseAfter(frame, reason) => {
            assert_eq!(reason, "banned");
            match *frame {
                ServerFrame::Command { command } => {
                    match command.command {
                        Command::Terminate { reason } => assert_eq!(reason, BAN_NOTICE),
                        other => anyhow::bail!("expected TERMINATE, got {other:?}"),
                    }
                }
                other => anyhow::bail!("expected command frame, got {other:?}"),
            }
        }
        _ => anyhow::bail!("expected CloseAfter"),
    }
    Ok(())
}

#[tokio::test]
async fn violation_pressure_triggers_debounced_autothrottle() -> anyhow::Result<()> {
    let state = test_state_with(|c| {
        c.rl_capacity = 1;
        c.rl_refill_rate = 1;
        c.rl_refill_interval_ms = 60_000;
        c.rl_max_events_per_second = 2.0;
        c.ban_threshold = 1000;
    });
    let mut bus_rx = state.bus.subscribe();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;

    // Burst of denied frames pushes eps past the soft threshold.
    for _ in 0..5 {
        feed(&state, &mut conn, serde_json::json!({"type": "pong"})).await;
    }

    let delivery = bus_rx.try_recv()?;
    assert_eq!(delivery.session_hash, HASH);
    assert!(matches!(delivery.command.command, Command::SetLatency { latency_ms: 2000 }));

    let entry = conn.bound.as_ref().ok_or_else(|| anyhow::anyhow!("not bound"))?;
    let mode = entry.mode_state();
    assert_eq!(mode.mode, SessionMode::Downspin);
    assert_eq!(mode.latency_ms, 2000);

    // Debounce: the continuing burst publishes no second command.
    for _ in 0..5 {
        feed(&state, &mut conn, serde_json::json!({"type": "pong"})).await;
    }
    assert!(bus_rx.try_recv().is_err(), "one auto-throttle command per window");
    Ok(())
}

#[tokio::test]
async fn terminated_session_ignores_inbound() -> anyhow::Result<()> {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;
    state
        .registry
        .transition(HASH, SessionMode::Terminated, 0, epoch_ms())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let batch = serde_json::json!({
        "type": "batch",
        "sessionHash": HASH,
        "events": [{"type": "interaction"}]
    });
    let outcome = feed(&state, &mut conn, batch).await;
    assert!(matches!(outcome, FrameOutcome::Continue));
    assert_eq!(state.sink.stats().queue_depth, 0, "terminated sessions ingest nothing");
    Ok(())
}

#[tokio::test]
async fn command_ack_is_accepted() {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;

    let ack = serde_json::json!({
        "type": "command_ack",
        "sessionHash": HASH,
        "commandId": "cmd-1",
        "commandType": "SET_LATENCY",
        "result": {"ok": true}
    });
    let outcome = feed(&state, &mut conn, ack).await;
    assert!(matches!(outcome, FrameOutcome::Continue));
}

#[tokio::test]
async fn unknown_frame_type_is_dropped() {
    let state = test_state();
    let mut conn = open_connection(&state, "c-1").await;
    feed(&state, &mut conn, handshake_frame()).await;

    let outcome =
        feed(&state, &mut conn, serde_json::json!({"type": "mystery", "sessionHash": HASH})).await;
    assert!(matches!(outcome, FrameOutcome::Continue));
}
