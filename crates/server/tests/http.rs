// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the HTTP surface.
//!
//! Uses `axum_test::TestServer` against a router whose stores are disabled,
//! so every store-backed read exercises the degraded path.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use tokio_util::sync::CancellationToken;

use spindle::config::ServerConfig;
use spindle::geo::GeoResolver;
use spindle::protocol::SessionMode;
use spindle::state::AppState;
use spindle::store::events::EventStore;
use spindle::store::sessions::SessionStore;
use spindle::store::writer::spawn_writer;
use spindle::transport::build_router;

const HASH: &str = "abcdef0123456789abcdef0123456789";
const API_KEY: &str = "test-secret";

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        admin_api_key: Some(API_KEY.into()),
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

fn test_state(config: ServerConfig) -> Arc<AppState> {
    let shutdown = CancellationToken::new();
    let events = Arc::new(EventStore::disabled());
    let sessions = Arc::new(SessionStore::disabled());
    let (writer, _handle) =
        spawn_writer(Arc::clone(&sessions), Arc::clone(&events), shutdown.clone());
    Arc::new(AppState::new(config, events, sessions, writer, GeoResolver::load(None), shutdown))
}

fn test_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(build_router(state)).expect("failed to create test server")
}

// ── health & beacon ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_green_without_stores() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["healthy"], true);
    assert_eq!(body["bus"], true);
    assert_eq!(body["events"], true);
    assert_eq!(body["sessions"], true);
    assert!(body["uptime"].is_number());
}

#[tokio::test]
async fn beacon_returns_204_for_wellformed_and_enqueues() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let body = serde_json::json!({
        "events": [
            {"type": "interaction", "sessionHash": HASH, "interactionType": "click"},
            {"type": "event", "sessionHash": HASH},
            {"type": "event"}
        ]
    });
    let resp = server.post("/beacon").json(&body).await;
    resp.assert_status(StatusCode::NO_CONTENT);

    // Ingestion is off the response path.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(state.sink.stats().queue_depth, 2, "hashless events are skipped");
}

#[tokio::test]
async fn beacon_returns_204_for_garbage() {
    let server = test_server(test_state(test_config()));
    let resp = server.post("/beacon").text("{definitely not json").await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.post("/beacon").text("").await;
    resp.assert_status(StatusCode::NO_CONTENT);
}

// ── admin auth ────────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_without_key_is_401_and_writes_nothing() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let resp = server.post(&format!("/admin/sessions/{HASH}/terminate")).await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "Unauthorized");

    assert!(state.registry.get(HASH).await.is_none(), "refused calls must not mutate state");
}

#[tokio::test]
async fn admin_with_wrong_key_is_401() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/admin/sessions").add_header("x-api-key", "wrong").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_auth_fails_closed_without_configured_key() {
    let mut config = test_config();
    config.admin_api_key = None;
    let server = test_server(test_state(config));

    let resp = server.get("/admin/stats").add_header("x-api-key", "anything").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_needs_no_key() {
    let server = test_server(test_state(test_config()));
    server.get("/health").await.assert_status_ok();
}

// ── admin reads ───────────────────────────────────────────────────────────

#[tokio::test]
async fn list_sessions_degrades_to_empty() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/admin/sessions").add_header("x-api-key", API_KEY).await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["count"], 0);
    assert_eq!(body["sessions"], serde_json::json!([]));
}

#[tokio::test]
async fn list_sessions_validates_minutes() {
    let server = test_server(test_state(test_config()));
    for bad in ["0", "1441"] {
        let resp = server
            .get("/admin/sessions")
            .add_query_param("minutes", bad)
            .add_header("x-api-key", API_KEY)
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn get_unknown_session_is_404() {
    let server = test_server(test_state(test_config()));
    let resp = server.get(&format!("/admin/sessions/{HASH}")).add_header("x-api-key", API_KEY).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_session_with_bad_hash_is_400() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/admin/sessions/zzz").add_header("x-api-key", API_KEY).await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_session_falls_back_to_live_state() {
    let state = test_state(test_config());
    state.registry.get_or_create(HASH, 1_000).await;
    let server = test_server(Arc::clone(&state));

    let resp = server.get(&format!("/admin/sessions/{HASH}")).add_header("x-api-key", API_KEY).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["session"]["session_hash"], HASH);
    assert_eq!(body["session"]["mode"], "normal");
    assert_eq!(body["timeline"], serde_json::json!([]));
}

#[tokio::test]
async fn analytics_degrades_and_validates_hours() {
    let server = test_server(test_state(test_config()));

    let resp = server.get("/admin/analytics").add_header("x-api-key", API_KEY).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["summary"], serde_json::json!({}));
    assert_eq!(body["geoDistribution"], serde_json::json!([]));

    let resp = server
        .get("/admin/analytics")
        .add_query_param("hours", "721")
        .add_header("x-api-key", API_KEY)
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn high_risk_degrades_to_empty() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/admin/high-risk").add_header("x-api-key", API_KEY).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn stats_reports_gauges() {
    let server = test_server(test_state(test_config()));
    let resp = server.get("/admin/stats").add_header("x-api-key", API_KEY).await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["websocket"]["totalConnections"], 0);
    assert_eq!(body["websocket"]["activeConnections"], 0);
    assert!(body["websocket"]["rateLimiter"]["tracked_keys"].is_number());
    assert_eq!(body["online"], 0);
    assert!(body["timestamp"].is_number());
}

// ── admin commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn downspin_defaults_and_reports_command() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/downspin"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"latency_ms": 2000}))
        .await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionHash"], HASH);
    assert_eq!(body["latency_ms"], 2000);
    assert_eq!(body["command"]["type"], "SET_LATENCY");
    assert_eq!(body["command"]["payload"]["latency_ms"], 2000);
    assert!(body["command"]["id"].as_str().is_some_and(|s| !s.is_empty()));

    let entry = state.registry.get(HASH).await;
    let mode = entry.map(|e| e.mode_state());
    assert_eq!(mode.map(|m| (m.mode, m.latency_ms)), Some((SessionMode::Downspin, 2000)));
}

#[tokio::test]
async fn downspin_without_body_uses_2000() {
    let server = test_server(test_state(test_config()));
    let resp = server
        .post(&format!("/admin/sessions/{HASH}/downspin"))
        .add_header("x-api-key", API_KEY)
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["latency_ms"], 2000);
}

#[tokio::test]
async fn upspin_forces_zero_latency() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/upspin"))
        .add_header("x-api-key", API_KEY)
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["mode"], "upspin");
    assert_eq!(body["command"]["payload"]["latency_ms"], 0);

    let entry = state.registry.get(HASH).await;
    let mode = entry.map(|e| e.mode_state());
    assert_eq!(mode.map(|m| (m.mode, m.latency_ms)), Some((SessionMode::Upspin, 0)));
}

#[tokio::test]
async fn terminate_is_sticky() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/terminate"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"reason": "abuse"}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["command"]["type"], "TERMINATE");

    // A later upspin is refused and changes nothing.
    let resp = server
        .post(&format!("/admin/sessions/{HASH}/upspin"))
        .add_header("x-api-key", API_KEY)
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "terminated");

    let entry = state.registry.get(HASH).await;
    assert_eq!(entry.map(|e| e.mode_state().mode), Some(SessionMode::Terminated));
}

#[tokio::test]
async fn notify_requires_message() {
    let server = test_server(test_state(test_config()));

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/notify"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/notify"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"message": "maintenance soon", "type": "warning"}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["command"]["type"], "TOAST_ALERT");
    assert_eq!(body["command"]["payload"]["type"], "warning");
}

#[tokio::test]
async fn redirect_requires_http_url() {
    let server = test_server(test_state(test_config()));

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/redirect"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/redirect"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"url": "javascript:alert(1)"}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let resp = server
        .post(&format!("/admin/sessions/{HASH}/redirect"))
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"url": "https://example.com", "newTab": true}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["command"]["payload"]["newTab"], true);
}

#[tokio::test]
async fn batch_action_applies_per_entry() {
    let state = test_state(test_config());
    let server = test_server(Arc::clone(&state));

    let other = "feedfacefeedface";
    let resp = server
        .post("/admin/batch-action")
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({
            "action": "downspin",
            "sessionHashes": [HASH, other, "bad hash"],
            "payload": {"latency_ms": 3000}
        }))
        .await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["count"], 3);
    assert_eq!(body["results"][0]["success"], true);
    assert_eq!(body["results"][1]["success"], true);
    assert_eq!(body["results"][2]["success"], false);

    let mode = state.registry.get(other).await.map(|e| e.mode_state());
    assert_eq!(mode.map(|m| m.latency_ms), Some(3000));
}

#[tokio::test]
async fn batch_action_rejects_unknown_action() {
    let server = test_server(test_state(test_config()));
    let resp = server
        .post("/admin/batch-action")
        .add_header("x-api-key", API_KEY)
        .json(&serde_json::json!({"action": "explode", "sessionHashes": [HASH]}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

// ── ingress rate limit ────────────────────────────────────────────────────

#[tokio::test]
async fn ingress_limit_returns_429_past_budget() {
    let mut config = test_config();
    config.http_rate_limit = 3;
    let server = test_server(test_state(config));

    for _ in 0..3 {
        server.get("/health").await.assert_status_ok();
    }
    let resp = server.get("/health").await;
    resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().get("retry-after").is_some());
}
