// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batched, bounded, drop-on-overflow write path into the event log.
//!
//! Producers enqueue normalized rows without blocking; a single flusher task
//! drains the queue in batches on a timer or when a full batch is pending.
//! The queue never grows past its bound — overflow drops (and counts) rather
//! than backing up the socket plane. On flush failure a bounded prefix is
//! re-queued at the head; during shutdown enqueueing is refused and the
//! residue is drained with one final flush.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::store::events::EventStore;

const MAX_TYPE_LEN: usize = 64;
const MAX_URL_LEN: usize = 2048;
const MAX_ELEMENT_LEN: usize = 512;
const MAX_COUNTRY_LEN: usize = 8;
const MAX_PAYLOAD_BYTES: usize = 10_000;

/// Sink tunables.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub max_queue: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Maximum events restored to the head of the queue after a failed flush.
    pub requeue_limit: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { max_queue: 10_000, batch_size: 100, flush_interval_ms: 5_000, requeue_limit: 1_000 }
    }
}

/// One normalized event row, ready for the append-only store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRow {
    pub session_hash: String,
    pub event_type: String,
    pub interaction_type: Option<String>,
    pub page_url: Option<String>,
    pub element: Option<String>,
    /// IPv4 as a 32-bit integer; non-IPv4 peers are null.
    pub ip: Option<u32>,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub latency_ms: Option<u32>,
    pub battery_level: Option<f64>,
    pub risk_score: Option<u8>,
    pub timestamp_ms: u64,
    /// Raw event JSON, truncated to the payload byte cap.
    pub payload: String,
}

impl EventRow {
    /// Normalize a raw client event: stamp identity, validate the peer IP,
    /// clamp numeric ranges, bound string lengths, truncate the payload.
    pub fn normalize(
        raw: &serde_json::Value,
        session_hash: &str,
        peer_ip: Option<&str>,
        now_ms: u64,
    ) -> Self {
        let get_str = |key: &str, cap: usize| {
            raw.get(key).and_then(|v| v.as_str()).map(|s| truncate(s, cap))
        };
        let get_f64 = |key: &str| raw.get(key).and_then(serde_json::Value::as_f64);

        let event_type = raw
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| truncate(s, MAX_TYPE_LEN))
            .unwrap_or_else(|| "event".to_owned());

        let timestamp_ms = raw.get("timestamp").and_then(serde_json::Value::as_u64).unwrap_or(now_ms);

        Self {
            session_hash: truncate(session_hash, 128),
            event_type,
            interaction_type: get_str("interactionType", MAX_TYPE_LEN),
            page_url: get_str("pageUrl", MAX_URL_LEN),
            element: get_str("element", MAX_ELEMENT_LEN),
            ip: peer_ip.and_then(ipv4_to_u32),
            country_code: get_str("countryCode", MAX_COUNTRY_LEN),
            latitude: get_f64("latitude").map(|v| v.clamp(-90.0, 90.0)),
            longitude: get_f64("longitude").map(|v| v.clamp(-180.0, 180.0)),
            screen_width: get_f64("screenWidth").map(|v| clamp_u32(v, 10_000)),
            screen_height: get_f64("screenHeight").map(|v| clamp_u32(v, 10_000)),
            latency_ms: get_f64("latencyMs").map(|v| clamp_u32(v, 60_000)),
            battery_level: get_f64("batteryLevel").map(|v| v.clamp(0.0, 100.0)),
            risk_score: get_f64("riskScore").map(|v| clamp_u32(v, 100) as u8),
            timestamp_ms,
            payload: truncate_bytes(&raw.to_string(), MAX_PAYLOAD_BYTES),
        }
    }
}

/// Parse a dotted-quad IPv4 string into its integer form. IPv6 and malformed
/// input yield `None`.
pub fn ipv4_to_u32(addr: &str) -> Option<u32> {
    addr.parse::<std::net::Ipv4Addr>().ok().map(u32::from)
}

fn clamp_u32(value: f64, max: u32) -> u32 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, f64::from(max)) as u32
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

/// Sink gauges for `/admin/stats`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SinkStats {
    pub queue_depth: usize,
    pub dropped: u64,
    pub flushed: u64,
}

/// The bounded event queue. Cheap to share; the flusher owns draining.
pub struct EventSink {
    config: SinkConfig,
    queue: Mutex<VecDeque<EventRow>>,
    notify: Notify,
    accepting: AtomicBool,
    dropped: AtomicU64,
    flushed: AtomicU64,
}

impl EventSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    /// Enqueue one row. Returns false (and counts a drop) when the queue is
    /// full or the sink is shutting down.
    pub fn enqueue(&self, row: EventRow) -> bool {
        if !self.accepting.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let pending = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue {
                drop(queue);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            queue.push_back(row);
            queue.len()
        };
        if pending >= self.config.batch_size {
            self.notify.notify_one();
        }
        true
    }

    /// Refuse further enqueues; the flusher drains what remains.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            queue_depth: self.queue.lock().len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }

    fn take_batch(&self) -> Vec<EventRow> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(self.config.batch_size);
        queue.drain(..n).collect()
    }

    /// Restore a failed batch to the head of the queue, bounded by the
    /// re-queue limit and the queue capacity. Order is preserved.
    fn requeue_front(&self, mut rows: Vec<EventRow>) {
        let keep = rows.len().min(self.config.requeue_limit);
        let overflow = rows.len() - keep;
        rows.truncate(keep);

        let mut queue = self.queue.lock();
        let mut dropped = overflow as u64;
        for row in rows.into_iter().rev() {
            if queue.len() >= self.config.max_queue {
                dropped += 1;
                continue;
            }
            queue.push_front(row);
        }
        drop(queue);
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(dropped, "event sink: dropped events after failed flush");
        }
    }
}

/// Spawn the flusher task. Runs until shutdown, then drains the residue with
/// one final flush pass.
pub fn spawn_flusher(
    sink: Arc<EventSink>,
    store: Arc<EventStore>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = std::time::Duration::from_millis(sink.config.flush_interval_ms);
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
                _ = sink.notify.notified() => {}
            }
            flush_pending(&sink, &store).await;
        }

        sink.close();
        flush_pending(&sink, &store).await;
        let stats = sink.stats();
        tracing::info!(flushed = stats.flushed, dropped = stats.dropped, "event sink drained");
    })
}

async fn flush_pending(sink: &EventSink, store: &EventStore) {
    loop {
        let batch = sink.take_batch();
        if batch.is_empty() {
            return;
        }
        let len = batch.len() as u64;
        match store.insert_events(&batch).await {
            Ok(()) => {
                sink.flushed.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(err = %e, batch = len, "event flush failed, re-queueing");
                sink.requeue_front(batch);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;
