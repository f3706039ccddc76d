// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable storage adapters.
//!
//! Two stores with distinct roles: an append-only time-series store for
//! events, the command log, and rate-limit violations (`events.rs`), and a
//! transactional store for session metadata, command audit, and dashboard
//! stats (`sessions.rs`). Both degrade gracefully — a missing URL, a dead
//! server, or a deadline exceedance never propagates past the adapter; the
//! in-memory registry stays the live source of truth.
//!
//! Writes that must stay ordered per session hash go through the single
//! writer mailbox (`writer.rs`).

pub mod events;
pub mod sessions;
pub mod writer;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connection deadlines shared by both adapters.
#[derive(Debug, Clone, Copy)]
pub struct StoreTimeouts {
    pub connect: Duration,
    pub op: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self { connect: Duration::from_secs(2), op: Duration::from_secs(30) }
    }
}

/// Open a pool for an optional URL. `None` (or a failed connect) yields no
/// pool and the adapter runs disabled.
pub(crate) async fn open_pool(
    role: &'static str,
    url: Option<&str>,
    timeouts: StoreTimeouts,
) -> Option<PgPool> {
    let url = url?;
    let result = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(timeouts.connect)
        .connect(url)
        .await;
    match result {
        Ok(pool) => {
            tracing::info!(role, "store connected");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(role, err = %e, "store unavailable, running degraded");
            None
        }
    }
}

/// Run a store future under the op deadline, flattening timeout and query
/// errors into one result.
pub(crate) async fn with_deadline<T>(
    op: Duration,
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(op, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(anyhow::anyhow!("store operation deadline exceeded")),
    }
}

/// Audit record for an issued command, as persisted by both stores.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandAudit {
    pub id: String,
    pub session_hash: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub admin_id: String,
    pub admin_ip: Option<String>,
    pub status: crate::protocol::CommandStatus,
    pub created_at: u64,
}
