// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::bus::CommandBus;
use crate::config::ServerConfig;
use crate::geo::GeoResolver;
use crate::limiter::RateLimiter;
use crate::registry::SessionRegistry;
use crate::sink::EventSink;
use crate::store::events::EventStore;
use crate::store::sessions::SessionStore;
use crate::store::writer::StoreWriter;

/// Shared server state, owned by `run()` and handed to every task by Arc.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    /// Socket-plane limiter, keyed by session hash (connection id pre-bind).
    pub limiter: RateLimiter,
    /// HTTP ingress limiter, keyed by client IP.
    pub ingress: RateLimiter,
    pub sink: Arc<EventSink>,
    pub bus: CommandBus,
    pub events: Arc<EventStore>,
    pub sessions: Arc<SessionStore>,
    pub writer: StoreWriter,
    pub geo: GeoResolver,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    /// Sockets accepted over the process lifetime.
    pub total_connections: AtomicU64,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        events: Arc<EventStore>,
        sessions: Arc<SessionStore>,
        writer: StoreWriter,
        geo: GeoResolver,
        shutdown: CancellationToken,
    ) -> Self {
        let node_id =
            config.node_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            registry: SessionRegistry::new(),
            limiter: RateLimiter::new(config.limiter_config()),
            ingress: RateLimiter::new(config.ingress_config()),
            sink: Arc::new(EventSink::new(config.sink_config())),
            bus: CommandBus::new(node_id, &config.nats_prefix, config.bus_publish_timeout_ms),
            events,
            sessions,
            writer,
            geo,
            shutdown,
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            config,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Resident set size in kilobytes, when the platform exposes it.
pub fn rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}
