// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::*;

fn row(n: u32) -> EventRow {
    EventRow::normalize(
        &serde_json::json!({"type": "interaction", "seq": n}),
        "abcdef0123456789",
        Some("8.8.8.8"),
        1_000,
    )
}

fn small_sink() -> EventSink {
    EventSink::new(SinkConfig { max_queue: 5, batch_size: 2, flush_interval_ms: 50, requeue_limit: 3 })
}

// ── normalization ─────────────────────────────────────────────────────────

#[test]
fn normalize_stamps_identity_and_timestamp() {
    let raw = serde_json::json!({"type": "interaction", "interactionType": "click"});
    let row = EventRow::normalize(&raw, "abcdef0123456789", Some("8.8.8.8"), 42_000);

    assert_eq!(row.session_hash, "abcdef0123456789");
    assert_eq!(row.event_type, "interaction");
    assert_eq!(row.interaction_type.as_deref(), Some("click"));
    assert_eq!(row.ip, Some(u32::from(std::net::Ipv4Addr::new(8, 8, 8, 8))));
    assert_eq!(row.timestamp_ms, 42_000, "server stamps missing timestamps");
}

#[test]
fn normalize_keeps_client_timestamp_when_present() {
    let raw = serde_json::json!({"type": "event", "timestamp": 7_777u64});
    let row = EventRow::normalize(&raw, "abcdef0123456789", None, 42_000);
    assert_eq!(row.timestamp_ms, 7_777);
}

#[test]
fn normalize_clamps_numeric_ranges() {
    let raw = serde_json::json!({
        "type": "event",
        "screenWidth": 99_999,
        "screenHeight": -5,
        "latencyMs": 999_999,
        "latitude": 123.0,
        "longitude": -999.0,
        "batteryLevel": 350.0,
        "riskScore": 400
    });
    let row = EventRow::normalize(&raw, "abcdef0123456789", None, 1_000);

    assert_eq!(row.screen_width, Some(10_000));
    assert_eq!(row.screen_height, Some(0));
    assert_eq!(row.latency_ms, Some(60_000));
    assert_eq!(row.latitude, Some(90.0));
    assert_eq!(row.longitude, Some(-180.0));
    assert_eq!(row.battery_level, Some(100.0));
    assert_eq!(row.risk_score, Some(100));
}

#[test]
fn normalize_rejects_non_ipv4_peers() {
    let raw = serde_json::json!({"type": "event"});
    assert_eq!(EventRow::normalize(&raw, "a", Some("2001:db8::1"), 0).ip, None);
    assert_eq!(EventRow::normalize(&raw, "a", Some("999.1.1.1"), 0).ip, None);
    assert_eq!(EventRow::normalize(&raw, "a", Some("8.8.8"), 0).ip, None);
    assert_eq!(EventRow::normalize(&raw, "a", None, 0).ip, None);
}

#[test]
fn normalize_truncates_payload_bytes() {
    let big = "x".repeat(50_000);
    let raw = serde_json::json!({"type": "event", "blob": big});
    let row = EventRow::normalize(&raw, "abcdef0123456789", None, 0);
    assert!(row.payload.len() <= 10_000);
}

#[test]
fn normalize_bounds_string_fields() {
    let raw = serde_json::json!({
        "type": "t".repeat(500),
        "pageUrl": "u".repeat(5_000),
        "element": "e".repeat(5_000)
    });
    let row = EventRow::normalize(&raw, "abcdef0123456789", None, 0);
    assert_eq!(row.event_type.len(), 64);
    assert_eq!(row.page_url.map(|s| s.len()), Some(2_048));
    assert_eq!(row.element.map(|s| s.len()), Some(512));
}

#[test]
fn ipv4_conversion_matches_network_order() {
    assert_eq!(ipv4_to_u32("1.2.3.4"), Some(0x0102_0304));
    assert_eq!(ipv4_to_u32("0.0.0.0"), Some(0));
    assert_eq!(ipv4_to_u32("255.255.255.255"), Some(u32::MAX));
}

// ── queue discipline ──────────────────────────────────────────────────────

#[test]
fn queue_bound_is_enforced_and_drops_counted() {
    let sink = small_sink();
    for n in 0..5 {
        assert!(sink.enqueue(row(n)));
    }
    assert!(!sink.enqueue(row(5)), "sixth enqueue exceeds the bound");
    assert!(!sink.enqueue(row(6)));

    let stats = sink.stats();
    assert_eq!(stats.queue_depth, 5);
    assert_eq!(stats.dropped, 2);
}

#[test]
fn close_refuses_enqueue() {
    let sink = small_sink();
    sink.close();
    assert!(!sink.enqueue(row(0)));
    assert_eq!(sink.stats().dropped, 1);
}

#[test]
fn take_batch_respects_batch_size_and_order() {
    let sink = small_sink();
    for n in 0..5 {
        sink.enqueue(row(n));
    }
    let batch = sink.take_batch();
    assert_eq!(batch.len(), 2);
    assert!(batch[0].payload.contains("\"seq\":0"));
    assert!(batch[1].payload.contains("\"seq\":1"));
    assert_eq!(sink.stats().queue_depth, 3);
}

#[test]
fn requeue_restores_head_order_within_limit() {
    let sink = small_sink();
    sink.enqueue(row(10));

    // Failed batch of 2 goes back in front of the remaining row.
    sink.requeue_front(vec![row(0), row(1)]);
    let batch = sink.take_batch();
    assert!(batch[0].payload.contains("\"seq\":0"));
    assert!(batch[1].payload.contains("\"seq\":1"));

    let rest = sink.take_batch();
    assert!(rest[0].payload.contains("\"seq\":10"));
}

#[test]
fn requeue_beyond_limit_drops_the_tail() {
    let sink = small_sink();
    // requeue_limit is 3: one of four survives only up to the limit.
    sink.requeue_front(vec![row(0), row(1), row(2), row(3)]);
    assert_eq!(sink.stats().queue_depth, 3);
    assert_eq!(sink.stats().dropped, 1);
}

// ── flusher ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn flusher_drains_queue_with_disabled_store() {
    let sink = Arc::new(small_sink());
    let store = Arc::new(EventStore::disabled());
    let shutdown = CancellationToken::new();
    let handle = spawn_flusher(Arc::clone(&sink), store, shutdown.clone());

    for n in 0..4 {
        sink.enqueue(row(n));
    }

    // Batch-size notify plus the 50ms timer drain the queue quickly.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(sink.stats().queue_depth, 0);
    assert_eq!(sink.stats().flushed, 4);

    shutdown.cancel();
    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn shutdown_performs_final_drain() {
    let sink = Arc::new(EventSink::new(SinkConfig {
        max_queue: 100,
        batch_size: 50,
        flush_interval_ms: 60_000,
        requeue_limit: 10,
    }));
    let store = Arc::new(EventStore::disabled());
    let shutdown = CancellationToken::new();
    let handle = spawn_flusher(Arc::clone(&sink), store, shutdown.clone());

    for n in 0..7 {
        sink.enqueue(row(n));
    }

    // Neither the timer nor the batch threshold has fired; shutdown must
    // still drain the residue.
    shutdown.cancel();
    let joined = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
    assert!(joined.is_ok());
    assert_eq!(sink.stats().queue_depth, 0);
    assert_eq!(sink.stats().flushed, 7);
    assert!(!sink.enqueue(row(99)), "sink refuses enqueue after shutdown");
}
