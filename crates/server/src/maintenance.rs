// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background maintenance: dashboard refresh, limiter eviction, retention.
//!
//! Every task is idempotent and error-swallowing; nothing here may take the
//! traffic plane down.

use std::sync::Arc;

use crate::state::{epoch_ms, AppState};

const DAY_MS: u64 = 86_400_000;

/// Spawn the single maintenance task.
pub fn spawn_maintenance(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stats_timer = tokio::time::interval(state.config.stats_refresh_interval());
        let mut evict_timer = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut retention_timer =
            tokio::time::interval(std::time::Duration::from_millis(DAY_MS));
        for timer in [&mut stats_timer, &mut evict_timer, &mut retention_timer] {
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = stats_timer.tick() => {
                    state.sessions.refresh_dashboard_stats(epoch_ms()).await;
                }
                _ = evict_timer.tick() => {
                    let now = epoch_ms();
                    let buckets = state.limiter.evict_idle(now);
                    let ingress = state.ingress.evict_idle(now);
                    let sessions = state
                        .registry
                        .evict_disconnected(state.config.rl_idle_eviction_ms, now)
                        .await;
                    if buckets + ingress + sessions > 0 {
                        tracing::debug!(buckets, ingress, sessions, "maintenance: evicted idle state");
                    }
                }
                _ = retention_timer.tick() => {
                    let now = epoch_ms();
                    let session_cutoff =
                        now.saturating_sub(state.config.session_retention_days * DAY_MS);
                    let purged = state.sessions.purge_disconnected(session_cutoff).await;

                    let event_cutoff =
                        now.saturating_sub(state.config.event_retention_days * DAY_MS);
                    let pruned = state.events.prune(event_cutoff).await;
                    if purged + pruned > 0 {
                        tracing::info!(purged, pruned, "maintenance: retention applied");
                    }
                }
            }
        }
        tracing::debug!("maintenance task stopped");
    })
}
