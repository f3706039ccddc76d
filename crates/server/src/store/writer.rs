// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-consumer write mailbox for durable session state.
//!
//! Producers (connection handlers, the admin API, the command dispatcher)
//! never await the stores directly; they enqueue a job and move on. One
//! consumer applies jobs in arrival order, which totally orders writes per
//! session hash without holding any session lock across store I/O.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::EventStore;
use super::sessions::SessionStore;
use super::CommandAudit;
use crate::protocol::{CommandStatus, SessionMode};
use crate::registry::SessionMeta;

const MAILBOX_CAPACITY: usize = 4096;

/// A unit of durable work.
#[derive(Debug)]
pub enum StoreJob {
    UpsertSession { session_hash: String, meta: SessionMeta, now_ms: u64 },
    SetConnected { session_hash: String, connected: bool, now_ms: u64 },
    IncrementEvents { session_hash: String, delta: u64, now_ms: u64 },
    SetMode { session_hash: String, mode: SessionMode, latency_ms: u64 },
    SetRisk { session_hash: String, score: u8, is_bot: bool },
    Violation { session_hash: String, count: u32, now_ms: u64 },
    LogCommand(CommandAudit),
    CommandStatus { command_id: String, status: CommandStatus, error: Option<String>, now_ms: u64 },
}

/// Cheap handle for enqueueing jobs. A full mailbox drops the job with a
/// warning; durable writes are best-effort.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<StoreJob>,
}

impl StoreWriter {
    pub fn submit(&self, job: StoreJob) {
        if let Err(e) = self.tx.try_send(job) {
            tracing::warn!(err = %e, "store writer: mailbox full, dropping write");
        }
    }

    pub fn upsert_session(&self, session_hash: &str, meta: SessionMeta, now_ms: u64) {
        self.submit(StoreJob::UpsertSession { session_hash: session_hash.to_owned(), meta, now_ms });
    }

    pub fn set_connected(&self, session_hash: &str, connected: bool, now_ms: u64) {
        self.submit(StoreJob::SetConnected {
            session_hash: session_hash.to_owned(),
            connected,
            now_ms,
        });
    }

    pub fn increment_events(&self, session_hash: &str, delta: u64, now_ms: u64) {
        self.submit(StoreJob::IncrementEvents {
            session_hash: session_hash.to_owned(),
            delta,
            now_ms,
        });
    }

    pub fn set_mode(&self, session_hash: &str, mode: SessionMode, latency_ms: u64) {
        self.submit(StoreJob::SetMode { session_hash: session_hash.to_owned(), mode, latency_ms });
    }

    pub fn set_risk(&self, session_hash: &str, score: u8, is_bot: bool) {
        self.submit(StoreJob::SetRisk { session_hash: session_hash.to_owned(), score, is_bot });
    }

    pub fn violation(&self, session_hash: &str, count: u32, now_ms: u64) {
        self.submit(StoreJob::Violation { session_hash: session_hash.to_owned(), count, now_ms });
    }

    pub fn log_command(&self, audit: CommandAudit) {
        self.submit(StoreJob::LogCommand(audit));
    }

    pub fn command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        error: Option<String>,
        now_ms: u64,
    ) {
        self.submit(StoreJob::CommandStatus {
            command_id: command_id.to_owned(),
            status,
            error,
            now_ms,
        });
    }
}

/// Spawn the mailbox consumer. On shutdown the remaining backlog is drained
/// before the task exits.
pub fn spawn_writer(
    sessions: Arc<SessionStore>,
    events: Arc<EventStore>,
    shutdown: CancellationToken,
) -> (StoreWriter, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
    let writer = StoreWriter { tx };

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => {
                    match job {
                        Some(job) => apply(&sessions, &events, job).await,
                        None => return,
                    }
                }
            }
        }
        // Drain whatever was enqueued before shutdown.
        while let Ok(job) = rx.try_recv() {
            apply(&sessions, &events, job).await;
        }
        tracing::debug!("store writer drained");
    });

    (writer, handle)
}

async fn apply(sessions: &SessionStore, events: &EventStore, job: StoreJob) {
    match job {
        StoreJob::UpsertSession { session_hash, meta, now_ms } => {
            if let Err(e) = sessions.upsert_session(&session_hash, &meta, now_ms).await {
                tracing::warn!(session = %session_hash, err = %e, "upsert failed");
            }
        }
        StoreJob::SetConnected { session_hash, connected, now_ms } => {
            // Disconnect marks race with fast reconnect storms; retry once so
            // the flag is not silently lost on a transient store error.
            if let Err(e) = sessions.set_connected(&session_hash, connected, now_ms).await {
                tracing::debug!(session = %session_hash, err = %e, "set_connected failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if let Err(e) = sessions.set_connected(&session_hash, connected, now_ms).await {
                    tracing::warn!(session = %session_hash, err = %e, "set_connected dropped");
                }
            }
        }
        StoreJob::IncrementEvents { session_hash, delta, now_ms } => {
            if let Err(e) = sessions.increment_event_count(&session_hash, delta, now_ms).await {
                tracing::warn!(session = %session_hash, err = %e, "event count update failed");
            }
        }
        StoreJob::SetMode { session_hash, mode, latency_ms } => {
            if let Err(e) = sessions.set_mode(&session_hash, mode, latency_ms).await {
                tracing::warn!(session = %session_hash, err = %e, "mode update failed");
            }
        }
        StoreJob::SetRisk { session_hash, score, is_bot } => {
            if let Err(e) = sessions.set_risk(&session_hash, score, is_bot).await {
                tracing::warn!(session = %session_hash, err = %e, "risk update failed");
            }
        }
        StoreJob::Violation { session_hash, count, now_ms } => {
            if let Err(e) = sessions.increment_violations(&session_hash, now_ms).await {
                tracing::warn!(session = %session_hash, err = %e, "violation count update failed");
            }
            if let Err(e) = events.log_violation(&session_hash, count, now_ms).await {
                tracing::warn!(session = %session_hash, err = %e, "violation log failed");
            }
        }
        StoreJob::LogCommand(audit) => {
            if let Err(e) = sessions.log_command(&audit).await {
                tracing::warn!(command = %audit.id, err = %e, "command audit write failed");
            }
            if let Err(e) = events.log_command(&audit).await {
                tracing::warn!(command = %audit.id, err = %e, "command log append failed");
            }
        }
        StoreJob::CommandStatus { command_id, status, error, now_ms } => {
            if let Err(e) = sessions
                .update_command_status(&command_id, status, error.as_deref(), now_ms)
                .await
            {
                tracing::warn!(command = %command_id, err = %e, "command status update failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
