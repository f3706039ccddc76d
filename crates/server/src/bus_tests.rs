// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::ServerConfig;
use crate::geo::GeoResolver;
use crate::protocol::Command;
use crate::registry::{ConnectionHandle, SessionMeta};
use crate::store::events::EventStore;
use crate::store::sessions::SessionStore;
use crate::store::writer::spawn_writer;

const HASH: &str = "abcdef0123456789";

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        admin_api_key: None,
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

fn test_state() -> Arc<AppState> {
    let shutdown = CancellationToken::new();
    let events = Arc::new(EventStore::disabled());
    let sessions = Arc::new(SessionStore::disabled());
    let (writer, _handle) = spawn_writer(Arc::clone(&sessions), Arc::clone(&events), shutdown.clone());
    Arc::new(AppState::new(
        test_config(),
        events,
        sessions,
        writer,
        GeoResolver::load(None),
        shutdown,
    ))
}

fn envelope(latency_ms: u64) -> CommandEnvelope {
    CommandEnvelope::new(Command::SetLatency { latency_ms }, 1_000)
}

#[tokio::test]
async fn publish_reaches_local_subscriber_in_order() -> anyhow::Result<()> {
    let bus = CommandBus::new("n1".into(), "traffic", 1000);
    let mut rx = bus.subscribe();

    bus.publish(HASH, envelope(100)).await;
    bus.publish(HASH, envelope(200)).await;

    let first = rx.try_recv()?;
    let second = rx.try_recv()?;
    assert_eq!(first.session_hash, HASH);
    assert_eq!(first.origin_node, "n1");
    match (first.command.command, second.command.command) {
        (Command::SetLatency { latency_ms: a }, Command::SetLatency { latency_ms: b }) => {
            assert_eq!((a, b), (100, 200), "per-session publish order is preserved");
        }
        other => anyhow::bail!("unexpected commands {other:?}"),
    }
    Ok(())
}

#[test]
fn presence_tracks_binds() {
    let bus = CommandBus::new("n1".into(), "traffic", 1000);
    assert_eq!(bus.online(), 0);

    bus.track_bind(HASH);
    assert!(bus.holds(HASH));
    assert_eq!(bus.online(), 1);

    bus.track_unbind(HASH);
    assert!(!bus.holds(HASH));
    assert_eq!(bus.online(), 0);
}

#[tokio::test]
async fn stats_count_publishes() {
    let bus = CommandBus::new("n1".into(), "traffic", 1000);
    bus.publish(HASH, envelope(1)).await;
    bus.publish(HASH, envelope(2)).await;
    assert_eq!(bus.stats().published, 2);
}

#[tokio::test]
async fn dispatcher_delivers_to_bound_connection() -> anyhow::Result<()> {
    let state = test_state();
    let _dispatcher = spawn_dispatcher(Arc::clone(&state));

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let handle = ConnectionHandle::new("c-1".into(), tx);
    state.registry.register_connection("c-1", None, 1_000).await;
    let bound = state.registry.bind(handle, HASH, SessionMeta::default(), 1_000).await;
    assert!(bound.is_ok());

    state.bus.publish(HASH, envelope(2000)).await;

    let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await?;
    match frame {
        Some(ServerFrame::Command { command }) => {
            assert!(matches!(command.command, Command::SetLatency { latency_ms: 2000 }));
        }
        other => anyhow::bail!("expected command frame, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn dispatcher_drops_for_unknown_session() {
    let state = test_state();
    let _dispatcher = spawn_dispatcher(Arc::clone(&state));

    // No binding anywhere; publish must not error or wedge the dispatcher.
    state.bus.publish("feedfacefeedface", envelope(1)).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(state.bus.stats().published, 1);
}

#[tokio::test]
async fn delivery_round_trips_through_serde() -> anyhow::Result<()> {
    let delivery = CommandDelivery {
        session_hash: HASH.into(),
        origin_node: "n1".into(),
        command: envelope(2000),
    };
    let bytes = serde_json::to_vec(&delivery)?;
    let back: CommandDelivery = serde_json::from_slice(&bytes)?;
    assert_eq!(back.session_hash, HASH);
    assert_eq!(back.origin_node, "n1");
    assert!(matches!(back.command.command, Command::SetLatency { latency_ms: 2000 }));
    Ok(())
}
