// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-bucket admission control with violation tracking and auto-ban.
//!
//! One limiter instance guards the socket plane (keyed by session hash, or
//! connection id before binding); a second instance with wider defaults
//! guards HTTP ingress (keyed by client IP). All operations are non-blocking
//! and never fail; the map lock is never held across an await.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::state::epoch_ms;

/// Limiter tunables. Defaults match the socket-plane profile.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub capacity: u64,
    /// Tokens restored per refill interval.
    pub refill_rate: u64,
    pub refill_interval_ms: u64,
    /// Soft violations-per-second threshold for the auto-throttle signal.
    pub max_events_per_second: f64,
    pub ban_threshold: u32,
    pub ban_duration_ms: u64,
    pub idle_eviction_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 5,
            refill_interval_ms: 1000,
            max_events_per_second: 5.0,
            ban_threshold: 50,
            ban_duration_ms: 300_000,
            idle_eviction_ms: 3_600_000,
        }
    }
}

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Banned,
    RateLimit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::RateLimit => "rate_limit",
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after_ms: Option<u64>,
    pub tokens_remaining: Option<u64>,
}

impl Admission {
    fn allowed(tokens_remaining: u64) -> Self {
        Self { allowed: true, reason: None, retry_after_ms: None, tokens_remaining: Some(tokens_remaining) }
    }

    fn denied(reason: DenyReason, retry_after_ms: u64) -> Self {
        Self { allowed: false, reason: Some(reason), retry_after_ms: Some(retry_after_ms), tokens_remaining: None }
    }
}

/// Violation-rate snapshot used for the auto-throttle decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationStats {
    pub count: u32,
    pub events_per_second: f64,
    pub should_throttle: bool,
}

/// Risk assessment derived from violation pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAssessment {
    pub score: u8,
    pub is_bot: bool,
}

/// Aggregate gauges for `/admin/stats`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LimiterStats {
    pub tracked_keys: usize,
    pub active_bans: usize,
    pub total_violations: u64,
}

#[derive(Debug, Clone, Copy)]
struct ViolationRecord {
    count: u32,
    first_violation_ms: u64,
    last_violation_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct BanRecord {
    banned_at_ms: u64,
    duration_ms: u64,
}

impl BanRecord {
    fn remaining(&self, now: u64) -> u64 {
        self.duration_ms.saturating_sub(now.saturating_sub(self.banned_at_ms))
    }

    fn active(&self, now: u64) -> bool {
        self.remaining(now) > 0
    }
}

#[derive(Debug)]
struct BucketEntry {
    tokens: u64,
    last_refill_ms: u64,
    last_seen_ms: u64,
    violations: Option<ViolationRecord>,
    ban: Option<BanRecord>,
}

impl BucketEntry {
    fn new(capacity: u64, now: u64) -> Self {
        Self { tokens: capacity, last_refill_ms: now, last_seen_ms: now, violations: None, ban: None }
    }

    fn refill(&mut self, config: &LimiterConfig, now: u64) {
        let interval = config.refill_interval_ms.max(1);
        let steps = now.saturating_sub(self.last_refill_ms) / interval;
        if steps > 0 {
            self.tokens =
                (self.tokens + steps.saturating_mul(config.refill_rate)).min(config.capacity);
            self.last_refill_ms += steps * interval;
        }
    }
}

/// Keyed token-bucket limiter. Buckets are created lazily on first admission
/// and evicted by the maintenance loop after inactivity.
pub struct RateLimiter {
    config: LimiterConfig,
    entries: Mutex<HashMap<String, BucketEntry>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    /// Admit one unit of work for `key`.
    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, 1, epoch_ms())
    }

    /// Admission with an explicit cost and clock; the clock parameter exists
    /// so the token-conservation and ban properties are testable.
    pub fn admit_at(&self, key: &str, cost: u64, now: u64) -> Admission {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| BucketEntry::new(self.config.capacity, now));
        entry.last_seen_ms = now;

        if let Some(ban) = entry.ban {
            if ban.active(now) {
                return Admission::denied(DenyReason::Banned, ban.remaining(now));
            }
            // Passive expiry.
            entry.ban = None;
            entry.violations = None;
        }

        entry.refill(&self.config, now);

        if entry.tokens >= cost {
            entry.tokens -= cost;
            return Admission::allowed(entry.tokens);
        }

        let violations = entry.violations.get_or_insert(ViolationRecord {
            count: 0,
            first_violation_ms: now,
            last_violation_ms: now,
        });
        violations.count += 1;
        violations.last_violation_ms = now;

        if violations.count >= self.config.ban_threshold && entry.ban.is_none() {
            entry.ban =
                Some(BanRecord { banned_at_ms: now, duration_ms: self.config.ban_duration_ms });
            tracing::warn!(key, violations = violations.count, "rate limiter: key banned");
        }

        let rate = self.config.refill_rate.max(1);
        let retry_after = cost.div_ceil(rate) * self.config.refill_interval_ms;
        Admission::denied(DenyReason::RateLimit, retry_after)
    }

    /// Violation-rate snapshot for `key`; all zeros when the key has no
    /// recorded violations.
    pub fn violation_stats(&self, key: &str) -> ViolationStats {
        self.violation_stats_at(key, epoch_ms())
    }

    pub fn violation_stats_at(&self, key: &str, now: u64) -> ViolationStats {
        let entries = self.entries.lock();
        let Some(violations) = entries.get(key).and_then(|e| e.violations) else {
            return ViolationStats::default();
        };
        let elapsed_secs = now.saturating_sub(violations.first_violation_ms) / 1000;
        let events_per_second = f64::from(violations.count) / elapsed_secs.max(1) as f64;
        ViolationStats {
            count: violations.count,
            events_per_second,
            should_throttle: events_per_second > self.config.max_events_per_second,
        }
    }

    /// Score the key's violation pressure on the 0..=100 risk scale.
    pub fn assess_risk(&self, key: &str) -> RiskAssessment {
        self.assess_risk_at(key, epoch_ms())
    }

    pub fn assess_risk_at(&self, key: &str, now: u64) -> RiskAssessment {
        let stats = self.violation_stats_at(key, now);
        let rate_component: u8 = if stats.events_per_second > 10.0 {
            40
        } else if stats.events_per_second > 5.0 {
            20
        } else {
            0
        };
        let volume_component: u8 = if stats.count > 30 {
            30
        } else if stats.count > 10 {
            15
        } else {
            0
        };
        let score = (rate_component + volume_component).min(100);
        RiskAssessment { score, is_bot: score > 80 }
    }

    /// Whether `key` is currently banned (without consuming a token).
    pub fn is_banned(&self, key: &str, now: u64) -> bool {
        let entries = self.entries.lock();
        entries.get(key).and_then(|e| e.ban).is_some_and(|b| b.active(now))
    }

    /// Drop buckets idle past the eviction window and purge expired bans.
    /// Returns the number of evicted keys.
    pub fn evict_idle(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            if let Some(ban) = entry.ban {
                if !ban.active(now) {
                    entry.ban = None;
                    entry.violations = None;
                }
            }
            // A live ban pins the entry regardless of idleness.
            entry.ban.is_some()
                || now.saturating_sub(entry.last_seen_ms) <= self.config.idle_eviction_ms
        });
        before - entries.len()
    }

    pub fn stats(&self) -> LimiterStats {
        let now = epoch_ms();
        let entries = self.entries.lock();
        LimiterStats {
            tracked_keys: entries.len(),
            active_bans: entries.values().filter(|e| e.ban.is_some_and(|b| b.active(now))).count(),
            total_violations: entries
                .values()
                .filter_map(|e| e.violations)
                .map(|v| u64::from(v.count))
                .sum(),
        }
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
