// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command fan-out between the admin plane and live connections.
//!
//! Publishing is best-effort and returns immediately: every delivery goes on
//! the in-process broadcast topic, and — when a NATS URL is configured — is
//! mirrored to `{prefix}.commands` so other nodes see it too. Each node's
//! dispatcher resolves the target session against its own registry and drops
//! silently when the socket lives elsewhere; the audit row written by the
//! admin API is the durable record either way.
//!
//! Per-session ordering holds because both the broadcast channel and a NATS
//! subject preserve publish order from a single publisher.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::protocol::{CommandEnvelope, CommandStatus, ServerFrame};
use crate::registry::DeliverOutcome;
use crate::state::{epoch_ms, AppState};

/// A command addressed to one session, tagged with the publishing node so
/// the NATS mirror can suppress its own echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDelivery {
    pub session_hash: String,
    pub origin_node: String,
    pub command: CommandEnvelope,
}

/// Bus gauges for `/admin/stats`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BusStats {
    pub online: usize,
    pub published: u64,
}

pub struct CommandBus {
    local_tx: broadcast::Sender<CommandDelivery>,
    /// Presence index: session hash -> node currently holding the socket.
    presence: RwLock<HashMap<String, String>>,
    node_id: String,
    subject: String,
    publish_timeout: std::time::Duration,
    nats: tokio::sync::RwLock<Option<async_nats::Client>>,
    published: std::sync::atomic::AtomicU64,
}

impl CommandBus {
    pub fn new(node_id: String, prefix: &str, publish_timeout_ms: u64) -> Self {
        let (local_tx, _) = broadcast::channel(256);
        Self {
            local_tx,
            presence: RwLock::new(HashMap::new()),
            node_id,
            subject: format!("{prefix}.commands"),
            publish_timeout: std::time::Duration::from_millis(publish_timeout_ms),
            nats: tokio::sync::RwLock::new(None),
            published: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommandDelivery> {
        self.local_tx.subscribe()
    }

    /// Publish a command for a session. Best-effort; returns immediately
    /// after the local send and a deadline-bounded NATS mirror.
    pub async fn publish(&self, session_hash: &str, command: CommandEnvelope) {
        let delivery = CommandDelivery {
            session_hash: session_hash.to_owned(),
            origin_node: self.node_id.clone(),
            command,
        };
        self.published.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _ = self.local_tx.send(delivery.clone());

        let client = self.nats.read().await.clone();
        if let Some(client) = client {
            let Ok(payload) = serde_json::to_vec(&delivery) else { return };
            let publish = client.publish(self.subject.clone(), payload.into());
            match tokio::time::timeout(self.publish_timeout, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(err = %e, "bus: nats publish failed"),
                Err(_) => tracing::warn!("bus: nats publish deadline exceeded"),
            }
        }
    }

    // -- Presence -------------------------------------------------------------

    pub fn track_bind(&self, session_hash: &str) {
        self.presence.write().insert(session_hash.to_owned(), self.node_id.clone());
    }

    pub fn track_unbind(&self, session_hash: &str) {
        self.presence.write().remove(session_hash);
    }

    pub fn online(&self) -> usize {
        self.presence.read().len()
    }

    pub fn holds(&self, session_hash: &str) -> bool {
        self.presence.read().contains_key(session_hash)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            online: self.online(),
            published: self.published.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

/// Spawn the local dispatcher: consumes the broadcast topic and pushes
/// command frames onto whichever connection this node holds for the target.
pub fn spawn_dispatcher(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut rx = state.bus.subscribe();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = rx.recv() => {
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "bus: dispatcher lagged, commands dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    dispatch(&state, delivery).await;
                }
            }
        }
        tracing::debug!("bus dispatcher stopped");
    })
}

async fn dispatch(state: &AppState, delivery: CommandDelivery) {
    let command_id = delivery.command.id.clone();
    let frame = ServerFrame::Command { command: delivery.command };
    match state.registry.deliver(&delivery.session_hash, frame).await {
        DeliverOutcome::Delivered => {
            state.writer.command_status(&command_id, CommandStatus::Sent, None, epoch_ms());
        }
        DeliverOutcome::NoConnection => {
            tracing::trace!(session = %delivery.session_hash, "bus: no local connection, dropped");
        }
        DeliverOutcome::Terminated => {
            tracing::debug!(session = %delivery.session_hash, "bus: session terminated, dropped");
        }
        DeliverOutcome::Overflow => {
            tracing::debug!(session = %delivery.session_hash, "bus: slow consumer, dropped");
        }
    }
}

/// Connect the NATS mirror and spawn the inbound bridge: remote deliveries
/// are replayed onto the local broadcast topic, own echoes suppressed.
pub fn spawn_nats_bridge(state: Arc<AppState>, url: String) {
    tokio::spawn(async move {
        let opts = async_nats::ConnectOptions::new().retry_on_initial_connect();
        let client = match opts.connect(&url).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(err = %e, url = %url, "bus: nats connect failed, single-node mode");
                return;
            }
        };
        tracing::info!(url = %url, subject = %state.bus.subject, "bus: nats transport connected");

        let mut sub = match client.subscribe(state.bus.subject.clone()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "bus: nats subscribe failed");
                return;
            }
        };
        *state.bus.nats.write().await = Some(client);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    let delivery: CommandDelivery = match serde_json::from_slice(&msg.payload) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::debug!(err = %e, "bus: invalid nats delivery, ignored");
                            continue;
                        }
                    };
                    if delivery.origin_node == state.bus.node_id {
                        continue;
                    }
                    let _ = state.bus.local_tx.send(delivery);
                }
            }
        }

        *state.bus.nats.write().await = None;
        tracing::debug!("bus: nats bridge stopped");
    });
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
