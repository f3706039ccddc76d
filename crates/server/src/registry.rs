// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory session registry: the live mapping from session hash to state,
//! and from connection id to its socket-side bookkeeping.
//!
//! At most one connection may be bound to a session hash on this node; a
//! re-handshake supersedes (and closes) the older connection. `terminated`
//! is a sticky terminal mode — binds and transitions against it are refused
//! and only the terminal notice itself may still be delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::geo::GeoInfo;
use crate::protocol::{ClientMetadata, ServerFrame, SessionMode};

/// Mode plus its self-imposed latency; mutated only under the entry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeState {
    pub mode: SessionMode,
    pub latency_ms: u64,
}

impl Default for ModeState {
    fn default() -> Self {
        Self { mode: SessionMode::Normal, latency_ms: 0 }
    }
}

/// Network and device metadata captured at handshake time.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub ip: Option<String>,
    pub geo: GeoInfo,
    pub client: ClientMetadata,
}

/// Handle to the socket currently bound to a session: where outbound frames
/// go, and how to schedule the socket's close.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub outbound: mpsc::Sender<ServerFrame>,
    pub cancel: CancellationToken,
    close_reason: Arc<OnceLock<&'static str>>,
}

impl ConnectionHandle {
    pub fn new(connection_id: String, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            connection_id,
            outbound,
            cancel: CancellationToken::new(),
            close_reason: Arc::new(OnceLock::new()),
        }
    }

    /// Schedule this socket to close. The first reason wins.
    pub fn close(&self, reason: &'static str) {
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        self.close_reason.get().copied()
    }
}

/// Live state for one session hash.
pub struct SessionEntry {
    pub session_hash: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: AtomicU64,
    pub total_events: AtomicU64,
    pub risk_score: AtomicU8,
    pub is_bot: AtomicBool,
    pub connected: AtomicBool,
    /// Epoch ms of the last auto-throttle command, for the 5 s debounce.
    pub last_throttle_ms: AtomicU64,
    mode: Mutex<ModeState>,
    meta: Mutex<SessionMeta>,
    bound: Mutex<Option<ConnectionHandle>>,
}

impl SessionEntry {
    fn new(session_hash: String, now: u64) -> Self {
        Self {
            session_hash,
            first_seen_ms: now,
            last_seen_ms: AtomicU64::new(now),
            total_events: AtomicU64::new(0),
            risk_score: AtomicU8::new(0),
            is_bot: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            last_throttle_ms: AtomicU64::new(0),
            mode: Mutex::new(ModeState::default()),
            meta: Mutex::new(SessionMeta::default()),
            bound: Mutex::new(None),
        }
    }

    pub fn mode_state(&self) -> ModeState {
        *self.mode.lock()
    }

    pub fn meta(&self) -> SessionMeta {
        self.meta.lock().clone()
    }

    pub fn bound_connection_id(&self) -> Option<String> {
        self.bound.lock().as_ref().map(|h| h.connection_id.clone())
    }

    /// Raise the stored risk score; it never decreases. Returns true when
    /// the stored value changed.
    pub fn apply_risk(&self, score: u8, is_bot: bool) -> bool {
        let score = score.min(100);
        let prev = self.risk_score.fetch_max(score, Ordering::Relaxed);
        if score > prev {
            self.is_bot.store(is_bot, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Claim an auto-throttle slot if the debounce window has elapsed.
    pub fn claim_throttle_slot(&self, now: u64, window_ms: u64) -> bool {
        let last = self.last_throttle_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < window_ms {
            return false;
        }
        self.last_throttle_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Per-socket bookkeeping, kept for stats and for resolving a connection
/// back to its bound session on close.
pub struct ConnectionStat {
    pub connection_id: String,
    pub peer_ip: Option<String>,
    pub connected_at_ms: u64,
    pub last_activity_ms: AtomicU64,
    pub event_count: AtomicU64,
    pub session_hash: Mutex<Option<String>>,
}

/// Why a bind was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    Terminated,
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    Terminated,
}

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    Delivered,
    NoConnection,
    Terminated,
    Overflow,
}

/// Registry gauges for `/admin/stats`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RegistryStats {
    pub sessions_in_memory: usize,
    pub connected_sessions: usize,
    pub active_connections: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    connections: RwLock<HashMap<String, Arc<ConnectionStat>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()), connections: RwLock::new(HashMap::new()) }
    }

    // -- Connections ----------------------------------------------------------

    /// Track a freshly accepted socket.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        peer_ip: Option<String>,
        now: u64,
    ) -> Arc<ConnectionStat> {
        let stat = Arc::new(ConnectionStat {
            connection_id: connection_id.to_owned(),
            peer_ip,
            connected_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            event_count: AtomicU64::new(0),
            session_hash: Mutex::new(None),
        });
        self.connections.write().await.insert(connection_id.to_owned(), Arc::clone(&stat));
        stat
    }

    pub async fn remove_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    // -- Sessions -------------------------------------------------------------

    pub async fn get(&self, session_hash: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(session_hash).map(Arc::clone)
    }

    /// Fetch or create the in-memory entry for a hash. Detached entries (no
    /// bound connection) are how admin transitions reach sessions that are
    /// not currently connected to this node.
    pub async fn get_or_create(&self, session_hash: &str, now: u64) -> Arc<SessionEntry> {
        if let Some(entry) = self.get(session_hash).await {
            return entry;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(session_hash.to_owned())
                .or_insert_with(|| Arc::new(SessionEntry::new(session_hash.to_owned(), now))),
        )
    }

    /// Bind a connection to a session hash. A previous binding on this node
    /// is detached and its socket scheduled to close ("superseded").
    pub async fn bind(
        &self,
        handle: ConnectionHandle,
        session_hash: &str,
        meta: SessionMeta,
        now: u64,
    ) -> Result<Arc<SessionEntry>, BindError> {
        let entry = self.get_or_create(session_hash, now).await;
        if entry.mode_state().mode == SessionMode::Terminated {
            return Err(BindError::Terminated);
        }

        let connection_id = handle.connection_id.clone();
        let superseded = {
            let mut bound = entry.bound.lock();
            bound.replace(handle)
        };
        if let Some(prev) = superseded {
            if prev.connection_id != connection_id {
                tracing::info!(
                    session = %session_hash,
                    old_connection = %prev.connection_id,
                    new_connection = %connection_id,
                    "superseding previous connection"
                );
                prev.close("superseded");
            }
        }

        *entry.meta.lock() = meta;
        entry.connected.store(true, Ordering::Relaxed);
        entry.last_seen_ms.store(now, Ordering::Relaxed);

        if let Some(stat) = self.connections.read().await.get(&connection_id) {
            *stat.session_hash.lock() = Some(session_hash.to_owned());
        }

        Ok(entry)
    }

    /// Detach a connection. Idempotent; marks the session disconnected only
    /// if this connection was the bound one. Returns the hash that went
    /// disconnected, if any, so the caller can persist the flag.
    pub async fn unbind(&self, connection_id: &str) -> Option<String> {
        let hash = {
            let connections = self.connections.read().await;
            connections.get(connection_id).and_then(|stat| stat.session_hash.lock().clone())
        }?;

        let entry = self.get(&hash).await?;
        let was_bound = {
            let mut bound = entry.bound.lock();
            match bound.as_ref() {
                Some(handle) if handle.connection_id == connection_id => {
                    *bound = None;
                    true
                }
                _ => false,
            }
        };
        if was_bound {
            entry.connected.store(false, Ordering::Relaxed);
            Some(hash)
        } else {
            None
        }
    }

    /// Apply a mode change. `upspin` forces latency to zero; `terminated` is
    /// sticky and refuses any further transition.
    pub async fn transition(
        &self,
        session_hash: &str,
        new_mode: SessionMode,
        latency_ms: u64,
        now: u64,
    ) -> Result<ModeState, TransitionError> {
        let entry = self.get_or_create(session_hash, now).await;
        let mut mode = entry.mode.lock();
        if mode.mode == SessionMode::Terminated {
            return Err(TransitionError::Terminated);
        }
        let latency_ms = if new_mode == SessionMode::Upspin { 0 } else { latency_ms };
        *mode = ModeState { mode: new_mode, latency_ms };
        Ok(*mode)
    }

    /// Bump event counters and freshness on traffic.
    pub async fn touch(&self, session_hash: &str, events_delta: u64, now: u64) {
        if let Some(entry) = self.get(session_hash).await {
            entry.total_events.fetch_add(events_delta, Ordering::Relaxed);
            entry.last_seen_ms.store(now, Ordering::Relaxed);
        }
    }

    /// Enqueue an outbound frame for the session's bound connection.
    ///
    /// Terminated sessions accept nothing except the terminal notice itself.
    /// A full outbound queue closes the socket ("slow_consumer") — the queue
    /// prefers closing over backing up.
    pub async fn deliver(&self, session_hash: &str, frame: ServerFrame) -> DeliverOutcome {
        let Some(entry) = self.get(session_hash).await else {
            return DeliverOutcome::NoConnection;
        };

        if entry.mode_state().mode == SessionMode::Terminated {
            let exempt = matches!(
                &frame,
                ServerFrame::Command { command } if command.is_terminate()
            );
            if !exempt {
                return DeliverOutcome::Terminated;
            }
        }

        let Some(handle) = entry.bound.lock().clone() else {
            return DeliverOutcome::NoConnection;
        };

        match handle.outbound.try_send(frame) {
            Ok(()) => DeliverOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session = %session_hash,
                    connection = %handle.connection_id,
                    "outbound queue full, closing connection"
                );
                handle.close("slow_consumer");
                DeliverOutcome::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliverOutcome::NoConnection,
        }
    }

    // -- Read side ------------------------------------------------------------

    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read().await;
        let connected = sessions.values().filter(|e| e.connected.load(Ordering::Relaxed)).count();
        RegistryStats {
            sessions_in_memory: sessions.len(),
            connected_sessions: connected,
            active_connections: self.connections.read().await.len(),
        }
    }

    pub async fn connection_stats(&self) -> Vec<Arc<ConnectionStat>> {
        self.connections.read().await.values().map(Arc::clone).collect()
    }

    /// Evict disconnected, idle sessions from memory. Terminated entries are
    /// kept so stickiness holds for the life of the process.
    pub async fn evict_disconnected(&self, idle_ms: u64, now: u64) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            if entry.connected.load(Ordering::Relaxed) {
                return true;
            }
            if entry.mode_state().mode == SessionMode::Terminated {
                return true;
            }
            now.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) <= idle_ms
        });
        before - sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
