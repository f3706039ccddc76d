// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only time-series store: telemetry events, the command log, and
//! rate-limit violations. All queries are parameterized and time-windowed;
//! retention is enforced by the maintenance loop via [`EventStore::prune`].

use sqlx::{PgPool, Row};

use super::{open_pool, with_deadline, CommandAudit, StoreTimeouts};
use crate::sink::EventRow;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    session_hash     TEXT NOT NULL,
    event_type       TEXT NOT NULL,
    interaction_type TEXT,
    page_url         TEXT,
    element          TEXT,
    ip               BIGINT,
    country_code     TEXT,
    latitude         DOUBLE PRECISION,
    longitude        DOUBLE PRECISION,
    screen_width     INTEGER,
    screen_height    INTEGER,
    latency_ms       INTEGER,
    battery_level    DOUBLE PRECISION,
    risk_score       SMALLINT,
    ts               BIGINT NOT NULL,
    payload          TEXT
);
CREATE INDEX IF NOT EXISTS events_hash_ts_idx ON events (session_hash, ts);
CREATE INDEX IF NOT EXISTS events_ts_idx ON events (ts);

CREATE TABLE IF NOT EXISTS command_log (
    command_id   TEXT NOT NULL,
    session_hash TEXT NOT NULL,
    command_type TEXT NOT NULL,
    payload      TEXT,
    admin_id     TEXT,
    admin_ip     TEXT,
    ts           BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS command_log_ts_idx ON command_log (ts);

CREATE TABLE IF NOT EXISTS rate_violations (
    session_hash TEXT NOT NULL,
    count        INTEGER NOT NULL,
    ts           BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS rate_violations_ts_idx ON rate_violations (ts);
"#;

/// The append-only store adapter. With no pool every write is a logged no-op
/// and every read returns an empty collection.
pub struct EventStore {
    pool: Option<PgPool>,
    timeouts: StoreTimeouts,
}

impl EventStore {
    pub async fn connect(url: Option<&str>, timeouts: StoreTimeouts) -> Self {
        let pool = open_pool("events", url, timeouts).await;
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
                tracing::warn!(err = %e, "event store: schema statement failed");
            }
        }
    }

    /// Append a batch of normalized rows. An error here makes the sink
    /// re-queue the batch, so the failure is surfaced rather than swallowed.
    pub async fn insert_events(&self, rows: &[EventRow]) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO events (session_hash, event_type, interaction_type, page_url, element, \
             ip, country_code, latitude, longitude, screen_width, screen_height, latency_ms, \
             battery_level, risk_score, ts, payload) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.session_hash)
                .push_bind(&row.event_type)
                .push_bind(&row.interaction_type)
                .push_bind(&row.page_url)
                .push_bind(&row.element)
                .push_bind(row.ip.map(i64::from))
                .push_bind(&row.country_code)
                .push_bind(row.latitude)
                .push_bind(row.longitude)
                .push_bind(row.screen_width.map(|v| v as i32))
                .push_bind(row.screen_height.map(|v| v as i32))
                .push_bind(row.latency_ms.map(|v| v as i32))
                .push_bind(row.battery_level)
                .push_bind(row.risk_score.map(i16::from))
                .push_bind(row.timestamp_ms as i64)
                .push_bind(&row.payload);
        });

        with_deadline(self.timeouts.op, qb.build().execute(pool)).await?;
        Ok(())
    }

    /// Append-only copy of an issued command.
    pub async fn log_command(&self, audit: &CommandAudit) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "INSERT INTO command_log (command_id, session_hash, command_type, payload, admin_id, \
             admin_ip, ts) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&audit.id)
        .bind(&audit.session_hash)
        .bind(&audit.command_type)
        .bind(audit.payload.to_string())
        .bind(&audit.admin_id)
        .bind(&audit.admin_ip)
        .bind(audit.created_at as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    /// Record a rate-limit violation snapshot.
    pub async fn log_violation(
        &self,
        session_hash: &str,
        count: u32,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let query = sqlx::query(
            "INSERT INTO rate_violations (session_hash, count, ts) VALUES ($1, $2, $3)",
        )
        .bind(session_hash)
        .bind(count as i32)
        .bind(now_ms as i64);
        with_deadline(self.timeouts.op, query.execute(pool)).await?;
        Ok(())
    }

    /// Most recent events for a session, newest first. Degrades to empty.
    pub async fn recent_events(&self, session_hash: &str, limit: i64) -> Vec<serde_json::Value> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query(
            "SELECT event_type, interaction_type, page_url, ts, payload FROM events \
             WHERE session_hash = $1 ORDER BY ts DESC LIMIT $2",
        )
        .bind(session_hash)
        .bind(limit.clamp(1, 1000))
        .fetch_all(pool);

        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "event_type": row.get::<String, _>("event_type"),
                        "interaction_type": row.get::<Option<String>, _>("interaction_type"),
                        "page_url": row.get::<Option<String>, _>("page_url"),
                        "ts": row.get::<i64, _>("ts"),
                        "payload": row.get::<Option<String>, _>("payload"),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(err = %e, "event store: timeline read failed");
                Vec::new()
            }
        }
    }

    /// Aggregate counts over the trailing window.
    pub async fn summary(&self, cutoff_ms: u64) -> serde_json::Value {
        let Some(pool) = &self.pool else { return serde_json::json!({}) };
        let query = sqlx::query(
            "SELECT COUNT(*) AS total_events, \
                    COUNT(DISTINCT session_hash) AS unique_sessions, \
                    COUNT(*) FILTER (WHERE event_type = 'interaction') AS interactions \
             FROM events WHERE ts >= $1",
        )
        .bind(cutoff_ms as i64)
        .fetch_one(pool);

        match with_deadline(self.timeouts.op, query).await {
            Ok(row) => serde_json::json!({
                "total_events": row.get::<i64, _>("total_events"),
                "unique_sessions": row.get::<i64, _>("unique_sessions"),
                "interactions": row.get::<i64, _>("interactions"),
            }),
            Err(e) => {
                tracing::warn!(err = %e, "event store: summary read failed");
                serde_json::json!({})
            }
        }
    }

    /// Session counts per country over the trailing window.
    pub async fn geo_distribution(&self, cutoff_ms: u64) -> Vec<serde_json::Value> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query(
            "SELECT country_code, COUNT(DISTINCT session_hash) AS sessions FROM events \
             WHERE ts >= $1 AND country_code IS NOT NULL \
             GROUP BY country_code ORDER BY sessions DESC LIMIT 100",
        )
        .bind(cutoff_ms as i64)
        .fetch_all(pool);

        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "country_code": row.get::<Option<String>, _>("country_code"),
                        "sessions": row.get::<i64, _>("sessions"),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(err = %e, "event store: geo read failed");
                Vec::new()
            }
        }
    }

    /// Sessions whose recorded risk peaked above the bot-watch line.
    pub async fn bot_candidates(&self, cutoff_ms: u64) -> Vec<serde_json::Value> {
        let Some(pool) = &self.pool else { return Vec::new() };
        let query = sqlx::query(
            "SELECT session_hash, MAX(risk_score) AS peak_risk, COUNT(*) AS events FROM events \
             WHERE ts >= $1 AND risk_score IS NOT NULL \
             GROUP BY session_hash HAVING MAX(risk_score) > 60 \
             ORDER BY peak_risk DESC LIMIT 50",
        )
        .bind(cutoff_ms as i64)
        .fetch_all(pool);

        match with_deadline(self.timeouts.op, query).await {
            Ok(rows) => rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "session_hash": row.get::<String, _>("session_hash"),
                        "peak_risk": row.get::<Option<i16>, _>("peak_risk"),
                        "events": row.get::<i64, _>("events"),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(err = %e, "event store: bot candidates read failed");
                Vec::new()
            }
        }
    }

    /// Row counts per table, for the analytics `dbStats` block.
    pub async fn db_stats(&self) -> serde_json::Value {
        let Some(pool) = &self.pool else { return serde_json::json!({}) };
        let query = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM events) AS events, \
                    (SELECT COUNT(*) FROM command_log) AS commands, \
                    (SELECT COUNT(*) FROM rate_violations) AS violations",
        )
        .fetch_one(pool);

        match with_deadline(self.timeouts.op, query).await {
            Ok(row) => serde_json::json!({
                "events": row.get::<i64, _>("events"),
                "commands": row.get::<i64, _>("commands"),
                "violations": row.get::<i64, _>("violations"),
            }),
            Err(e) => {
                tracing::warn!(err = %e, "event store: db stats read failed");
                serde_json::json!({})
            }
        }
    }

    /// Drop rows older than the retention cutoff. Returns deleted row count.
    pub async fn prune(&self, cutoff_ms: u64) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        let mut deleted = 0u64;
        for table in ["events", "command_log", "rate_violations"] {
            let sql = format!("DELETE FROM {table} WHERE ts < $1");
            let query = sqlx::query(&sql).bind(cutoff_ms as i64).execute(pool);
            match with_deadline(self.timeouts.op, query).await {
                Ok(done) => deleted += done.rows_affected(),
                Err(e) => tracing::warn!(err = %e, table, "event store: prune failed"),
            }
        }
        deleted
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
