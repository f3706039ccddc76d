// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::limiter::LimiterConfig;
use crate::sink::SinkConfig;
use crate::store::StoreTimeouts;

/// Configuration for the spindle control plane.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "spindle", about = "Traffic-shaping control plane")]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "SPINDLE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8787, env = "SPINDLE_PORT")]
    pub port: u16,

    /// Shared secret for the admin API (`X-API-Key`). If unset, every admin
    /// request is refused.
    #[arg(long, env = "SPINDLE_ADMIN_API_KEY")]
    pub admin_api_key: Option<String>,

    /// Node identifier used by the command bus. Defaults to a random UUID.
    #[arg(long, env = "SPINDLE_NODE_ID")]
    pub node_id: Option<String>,

    // -- Stores ---------------------------------------------------------------
    /// Postgres URL for the append-only event store. Unset runs degraded.
    #[arg(long, env = "SPINDLE_EVENT_STORE_URL")]
    pub event_store_url: Option<String>,

    /// Postgres URL for the transactional session store. Unset runs degraded.
    #[arg(long, env = "SPINDLE_SESSION_STORE_URL")]
    pub session_store_url: Option<String>,

    /// Fail startup unless both stores are configured and reachable.
    #[arg(long, default_value_t = false, env = "SPINDLE_REQUIRE_STORES")]
    pub require_stores: bool,

    /// Store connect deadline in milliseconds.
    #[arg(long, default_value_t = 2000, env = "SPINDLE_STORE_CONNECT_TIMEOUT_MS")]
    pub store_connect_timeout_ms: u64,

    /// Store operation deadline in milliseconds.
    #[arg(long, default_value_t = 30000, env = "SPINDLE_STORE_OP_TIMEOUT_MS")]
    pub store_op_timeout_ms: u64,

    // -- Command bus ----------------------------------------------------------
    /// NATS URL for multi-node command fan-out. Unset runs single-node.
    #[arg(long, env = "SPINDLE_NATS_URL")]
    pub nats_url: Option<String>,

    /// Subject prefix for bus traffic.
    #[arg(long, default_value = "traffic", env = "SPINDLE_NATS_PREFIX")]
    pub nats_prefix: String,

    /// Bus publish deadline in milliseconds.
    #[arg(long, default_value_t = 1000, env = "SPINDLE_BUS_PUBLISH_TIMEOUT_MS")]
    pub bus_publish_timeout_ms: u64,

    // -- Rate limiting --------------------------------------------------------
    /// Token bucket capacity per session.
    #[arg(long, default_value_t = 20, env = "SPINDLE_RL_CAPACITY")]
    pub rl_capacity: u64,

    /// Tokens restored per refill interval.
    #[arg(long, default_value_t = 5, env = "SPINDLE_RL_REFILL_RATE")]
    pub rl_refill_rate: u64,

    /// Refill interval in milliseconds.
    #[arg(long, default_value_t = 1000, env = "SPINDLE_RL_REFILL_INTERVAL_MS")]
    pub rl_refill_interval_ms: u64,

    /// Soft violations-per-second threshold for auto-throttle.
    #[arg(long, default_value_t = 5.0, env = "SPINDLE_RL_MAX_EPS")]
    pub rl_max_events_per_second: f64,

    /// Automatically downspin sessions that trip the soft threshold.
    #[arg(long, default_value_t = true, env = "SPINDLE_AUTO_THROTTLE",
          action = clap::ArgAction::Set)]
    pub auto_throttle: bool,

    /// Latency injected by auto-throttle, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "SPINDLE_THROTTLE_LATENCY_MS")]
    pub throttle_latency_ms: u64,

    /// Minimum spacing between auto-throttle commands per session.
    #[arg(long, default_value_t = 5000, env = "SPINDLE_THROTTLE_DEBOUNCE_MS")]
    pub throttle_debounce_ms: u64,

    /// Violations before a session is banned.
    #[arg(long, default_value_t = 50, env = "SPINDLE_BAN_THRESHOLD")]
    pub ban_threshold: u32,

    /// Ban duration in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "SPINDLE_BAN_DURATION_MS")]
    pub ban_duration_ms: u64,

    /// Idle age after which rate-limiter state is evicted, in milliseconds.
    #[arg(long, default_value_t = 3_600_000, env = "SPINDLE_RL_EVICTION_MS")]
    pub rl_idle_eviction_ms: u64,

    /// HTTP ingress limit: requests per client IP per minute.
    #[arg(long, default_value_t = 100, env = "SPINDLE_HTTP_RATE_LIMIT")]
    pub http_rate_limit: u64,

    // -- Sockets --------------------------------------------------------------
    /// Keepalive ping interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SPINDLE_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// Close connections with no traffic for this long, in milliseconds.
    #[arg(long, default_value_t = 90_000, env = "SPINDLE_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,

    /// Outbound frame queue capacity per connection.
    #[arg(long, default_value_t = 256, env = "SPINDLE_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,

    // -- Event sink -----------------------------------------------------------
    /// Event queue bound; overflow drops.
    #[arg(long, default_value_t = 10_000, env = "SPINDLE_SINK_MAX_QUEUE")]
    pub sink_max_queue: usize,

    /// Events per flush batch.
    #[arg(long, default_value_t = 100, env = "SPINDLE_SINK_BATCH_SIZE")]
    pub sink_batch_size: usize,

    /// Flush interval in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "SPINDLE_SINK_FLUSH_INTERVAL_MS")]
    pub sink_flush_interval_ms: u64,

    /// Maximum events re-queued after a failed flush.
    #[arg(long, default_value_t = 1_000, env = "SPINDLE_SINK_REQUEUE_LIMIT")]
    pub sink_requeue_limit: usize,

    // -- Enrichment & maintenance --------------------------------------------
    /// Optional GeoIP table (JSON array of {cidr, country, city, lat, lon, isp}).
    #[arg(long, env = "SPINDLE_GEOIP_DATA")]
    pub geoip_data: Option<std::path::PathBuf>,

    /// Dashboard snapshot refresh interval in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SPINDLE_STATS_REFRESH_MS")]
    pub stats_refresh_ms: u64,

    /// Event retention in days for the time-series store.
    #[arg(long, default_value_t = 30, env = "SPINDLE_EVENT_RETENTION_DAYS")]
    pub event_retention_days: u64,

    /// Disconnected-session retention in days for the session store.
    #[arg(long, default_value_t = 7, env = "SPINDLE_SESSION_RETENTION_DAYS")]
    pub session_retention_days: u64,
}

impl ServerConfig {
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            capacity: self.rl_capacity,
            refill_rate: self.rl_refill_rate,
            refill_interval_ms: self.rl_refill_interval_ms,
            max_events_per_second: self.rl_max_events_per_second,
            ban_threshold: self.ban_threshold,
            ban_duration_ms: self.ban_duration_ms,
            idle_eviction_ms: self.rl_idle_eviction_ms,
        }
    }

    /// Ingress profile: a window's worth of requests as burst, refilled per
    /// minute, with bans disabled (HTTP denial is just a 429).
    pub fn ingress_config(&self) -> LimiterConfig {
        LimiterConfig {
            capacity: self.http_rate_limit,
            refill_rate: self.http_rate_limit,
            refill_interval_ms: 60_000,
            max_events_per_second: f64::MAX,
            ban_threshold: u32::MAX,
            ban_duration_ms: 0,
            idle_eviction_ms: self.rl_idle_eviction_ms,
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            max_queue: self.sink_max_queue,
            batch_size: self.sink_batch_size,
            flush_interval_ms: self.sink_flush_interval_ms,
            requeue_limit: self.sink_requeue_limit,
        }
    }

    pub fn store_timeouts(&self) -> StoreTimeouts {
        StoreTimeouts {
            connect: std::time::Duration::from_millis(self.store_connect_timeout_ms),
            op: std::time::Duration::from_millis(self.store_op_timeout_ms),
        }
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval_ms)
    }

    pub fn stats_refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stats_refresh_ms)
    }
}
