// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transactional session store: durable session rows keyed by hash, the
//! mutable command audit, and the materialized dashboard snapshot.
//!
//! Writes arrive through the writer mailbox so per-hash ordering holds; every
//! operation degrades on error rather than propagating.

use sqlx::{PgPool, Row};

use super::{open_pool, with_deadline, CommandAudit, StoreTimeouts};
use crate::protocol::{CommandStatus, SessionMode};
use crate::registry::SessionMeta;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_hash       TEXT PRIMARY KEY,
    ip                 TEXT,
    country_code       TEXT,
    city               TEXT,
    isp                TEXT,
    latitude           DOUBLE PRECISION,
    longitude          DOUBLE PRECISION,
    user_agent         TEXT,
    page_url           TEXT,
    referrer           TEXT,
    screen_width       INTEGER,
    screen_height      INTEGER,
    timezone           TEXT,
    network_type       TEXT,
    battery_level      DOUBLE PRECISION,
    mode               TEXT NOT NULL DEFAULT 'normal',
    current_latency_ms INTEGER NOT NULL DEFAULT 0,
    total_events       BIGINT NOT NULL DEFAULT 0,
    risk_score         SMALLINT NOT NULL DEFAULT 0,
    is_bot             BOOLEAN NOT NULL DEFAULT FALSE,
    violation_count    INTEGER NOT NULL DEFAULT 0,
    connected          BOOLEAN NOT NULL DEFAULT FALSE,
    first_seen         BIGINT NOT NULL,
    last_seen          BIGINT NOT NULL,
    last_violation_at  BIGINT
);
CREATE INDEX IF NOT EXISTS sessions_last_seen_idx ON sessions (last_seen);
CREATE INDEX IF NOT EXISTS sessions_risk_idx ON sessions (risk_score);

CREATE TABLE IF NOT EXISTS commands (
    id              TEXT PRIMARY KEY,
    session_hash    TEXT NOT NULL,
    command_type    TEXT NOT NULL,
    payload         TEXT,
    admin_id        TEXT,
    admin_ip        TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    error_message   TEXT,
    created_at      BIGINT NOT NULL,
    acknowledged_at BIGINT
);
CREATE INDEX IF NOT EXISTS commands_hash_idx ON commands (session_hash, created_at);

CREATE TABLE IF NOT EXISTS dashboard_stats (
    id           INTEGER PRIMARY KEY,
    data         TEXT NOT NULL,
    refreshed_at BIGINT NOT NULL
);
"#;

/// Durable session row as served to the admin API.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SessionRow {
    pub session_hash: String,
    pub ip: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub user_agent: Option<String>,
    pub page_url: Option<String>,
    pub referrer: Option<String>,
    pub screen_width: Option<i32>,
    pub screen_height: Option<i32>,
    pub timezone: Option<String>,
    pub network_type: Option<String>,
    pub battery_level: Option<f64>,
    pub mode: String,
    pub current_latency_ms: i32,
    pub total_events: i64,
    pub risk_score: i16,
    pub is_bot: bool,
    pub violation_count: i32,
    pub connected: bool,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_violation_at: Option<i64>,
}

/// Command audit row as served to the admin API.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CommandRow {
    pub id: String,
    pub session_hash: String,
    pub command_type: String,
    pub payload: Option<String>,
    pub admin_id: Option<String>,
    pub admin_ip: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub acknowledged_at: Option<i64>,
}

/// The transactional store adapter.
pub struct SessionStore {
    pool: Option<PgPool>,
    timeouts: StoreTimeouts,
}

impl SessionStore {
    pub async fn connect(url: Option<&str>, timeouts: StoreTimeouts) -> Self {
        let pool = open_pool("sessions", url, timeouts).await;
        let store = Self { pool, timeouts };
        store.ensure_schema().await;
        store
    }

    /// Adapter with no backing pool, for tests and store-less deployments.
    pub fn disabled() -> Self {
        Self { pool: None, timeouts: StoreTimeouts::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    async fn ensure_schema(&self) {
        let Some(pool) = &self.pool else { return };
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Err(e) = sqlx::query(statement).execute(pool).await {
                tracing::warn!(err = %e, "session store: schema statement failed");
            }
        }
    }

    // -- Writes (called from the writer mailbox) ------------------------------

    pub async fn upsert_session(
        &self,
        session_hash: &str,
        meta: &SessionMeta,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "INSERT INTO sessions (session_hash, ip, country_code, city, isp, latitude, \
             longitude, user_agent, page_url, referrer, screen_width, screen_height, timezone, \
             network_type, battery_level, connected, first_seen, last_seen) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, TRUE, $16, $16) \
             ON CONFLICT (session_hash) DO UPDATE SET \
               ip = EXCLUDED.ip, country_code = EXCLUDED.country_code, city = EXCLUDED.city, \
               isp = EXCLUDED.isp, latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude, \
               user_agent = EXCLUDED.user_agent, page_url = EXCLUDED.page_url, \
               referrer = EXCLUDED.referrer, screen_width = EXCLUDED.screen_width, \
               screen_height = EXCLUDED.screen_height, timezone = EXCLUDED.timezone, \
               network_type = EXCLUDED.network_type, battery_level = EXCLUDED.battery_level, \
               connected = TRUE, last_seen = EXCLUDED.last_seen",
        )
        .bind(session_hash)
        .bind(&meta.ip)
        .bind(&meta.geo.country_code)
        .bind(&meta.geo.city)
        .bind(&meta.geo.isp)
        .bind(meta.geo.latitude)
        .bind(meta.geo.longitude)
        .bind(&meta.client.user_agent)
        .bind(&meta.client.page_url)
        .bind(&meta.client.referrer)
        .bind(meta.client.screen_width.map(|v| v.min(10_000) as i32))
        .bind(meta.client.screen_height.map(|v| v.min(10_000) as i32))
        .bind(&meta.client.timezone)
        .bind(&meta.client.network_type)
        .bind(meta.client.battery_level.map(|v| v.clamp(0.0, 100.0)))
        .bind(now_ms as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn set_connected(
        &self,
        session_hash: &str,
        connected: bool,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "UPDATE sessions SET connected = $2, last_seen = GREATEST(last_seen, $3) \
             WHERE session_hash = $1",
        )
        .bind(session_hash)
        .bind(connected)
        .bind(now_ms as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn increment_event_count(
        &self,
        session_hash: &str,
        delta: u64,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "UPDATE sessions SET total_events = total_events + $2, \
             last_seen = GREATEST(last_seen, $3) WHERE session_hash = $1",
        )
        .bind(session_hash)
        .bind(delta as i64)
        .bind(now_ms as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn set_mode(
        &self,
        session_hash: &str,
        mode: SessionMode,
        latency_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "UPDATE sessions SET mode = $2, current_latency_ms = $3 WHERE session_hash = $1",
        )
        .bind(session_hash)
        .bind(mode.as_str())
        .bind(latency_ms.min(60_000) as i32);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn set_risk(
        &self,
        session_hash: &str,
        risk_score: u8,
        is_bot: bool,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "UPDATE sessions SET risk_score = GREATEST(risk_score, $2), is_bot = $3 \
             WHERE session_hash = $1",
        )
        .bind(session_hash)
        .bind(i16::from(risk_score.min(100)))
        .bind(is_bot);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn increment_violations(
        &self,
        session_hash: &str,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "UPDATE sessions SET violation_count = violation_count + 1, \
             last_violation_at = $2 WHERE session_hash = $1",
        )
        .bind(session_hash)
        .bind(now_ms as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn log_command(&self, audit: &CommandAudit) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "INSERT INTO commands (id, session_hash, command_type, payload, admin_id, admin_ip, \
             status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&audit.id)
        .bind(&audit.session_hash)
        .bind(&audit.command_type)
        .bind(audit.payload.to_string())
        .bind(&audit.admin_id)
        .bind(&audit.admin_ip)
        .bind(audit.status.as_str())
        .bind(audit.created_at as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        error_message: Option<&str>,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let acknowledged_at = matches!(status, CommandStatus::Acknowledged | CommandStatus::Failed)
            .then_some(now_ms as i64);
        let query = sqlx::query(
            "UPDATE commands SET status = $2, error_message = COALESCE($3, error_message), \
             acknowledged_at = COALESCE($4, acknowledged_at) WHERE id = $1",
        )
        .bind(command_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(acknowledged_at);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    /// Remove disconnected sessions idle past the retention cutoff.
    pub async fn purge_disconnected(&self, cutoff_ms: u64) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        let query = sqlx::query(
            "DELETE FROM sessions WHERE connected = FALSE AND last_seen < $1",
        )
        .bind(cutoff_ms as i64)
        .execute(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::warn!(err = %e, "session store: purge failed");
                0
            }
        }
    }

    // -- Reads ---------------------------------------------------------------

    pub async fn get_active_sessions(&self, since_ms: u64) -> Vec<SessionRow> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE last_seen >= $1 ORDER BY last_seen DESC LIMIT 1000",
        )
        .bind(since_ms as i64)
        .fetch_all(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, "session store: active sessions read failed");
                Vec::new()
            }
        }
    }

    pub async fn get_session(&self, session_hash: &str) -> Option<SessionRow> {
        let pool = self.pool.as_ref()?;
        let query = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE session_hash = $1",
        )
        .bind(session_hash)
        .fetch_optional(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(err = %e, "session store: session read failed");
                None
            }
        }
    }

    pub async fn get_high_risk_sessions(&self) -> Vec<SessionRow> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE risk_score > 60 OR is_bot \
             ORDER BY risk_score DESC LIMIT 200",
        )
        .fetch_all(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, "session store: high-risk read failed");
                Vec::new()
            }
        }
    }

    pub async fn get_command_history(&self, session_hash: &str, limit: i64) -> Vec<CommandRow> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM commands WHERE session_hash = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(session_hash)
        .bind(limit.clamp(1, 500))
        .fetch_all(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, "session store: command history read failed");
                Vec::new()
            }
        }
    }

    /// Last materialized dashboard snapshot, `{}` when absent or degraded.
    pub async fn get_dashboard_stats(&self) -> serde_json::Value {
        let Some(pool) = &self.pool else { return serde_json::json!({}) };
        let query = sqlx::query("SELECT data FROM dashboard_stats WHERE id = 1").fetch_optional(pool);
        match with_deadline(self.timeouts.op, query).await {
            Ok(Some(row)) => {
                let data: String = row.get("data");
                serde_json::from_str(&data).unwrap_or_else(|_| serde_json::json!({}))
            }
            Ok(None) => serde_json::json!({}),
            Err(e) => {
                tracing::warn!(err = %e, "session store: dashboard read failed");
                serde_json::json!({})
            }
        }
    }

    /// Recompute and persist the dashboard snapshot.
    pub async fn refresh_dashboard_stats(&self, now_ms: u64) {
        let Some(pool) = &self.pool else { return };
        let query = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE connected) AS connected, \
                    COUNT(*) FILTER (WHERE mode = 'upspin') AS upspin, \
                    COUNT(*) FILTER (WHERE mode = 'downspin') AS downspin, \
                    COUNT(*) FILTER (WHERE mode = 'terminated') AS terminated, \
                    COUNT(*) FILTER (WHERE is_bot) AS bots, \
                    COALESCE(AVG(risk_score), 0)::DOUBLE PRECISION AS avg_risk \
             FROM sessions",
        )
        .fetch_one(pool);

        let snapshot = match with_deadline(self.timeouts.op, query).await {
            Ok(row) => serde_json::json!({
                "total_sessions": row.get::<i64, _>("total"),
                "connected": row.get::<i64, _>("connected"),
                "upspin": row.get::<i64, _>("upspin"),
                "downspin": row.get::<i64, _>("downspin"),
                "terminated": row.get::<i64, _>("terminated"),
                "bots": row.get::<i64, _>("bots"),
                "avg_risk": row.get::<f64, _>("avg_risk"),
                "refreshed_at": now_ms,
            }),
            Err(e) => {
                tracing::warn!(err = %e, "session store: dashboard refresh failed");
                return;
            }
        };

        let upsert = sqlx::query(
            "INSERT INTO dashboard_stats (id, data, refreshed_at) VALUES (1, $1, $2) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, \
             refreshed_at = EXCLUDED.refreshed_at",
        )
        .bind(snapshot.to_string())
        .bind(now_ms as i64)
        .execute(pool);
        if let Err(e) = with_deadline(self.timeouts.op, upsert).await {
            tracing::warn!(err = %e, "session store: dashboard write failed");
        }
    }

    /// Liveness probe under the connect deadline. Unconfigured reports true.
    pub async fn healthy(&self) -> bool {
        let Some(pool) = &self.pool else { return true };
        with_deadline(self.timeouts.connect, sqlx::query("SELECT 1").execute(pool)).await.is_ok()
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}
