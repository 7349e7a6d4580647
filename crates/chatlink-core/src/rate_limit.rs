//! Per-user rate limiting.
//!
//! Fixed windows keyed by `category:user_id`; the category is a fixed token
//! without colons, so the key is unambiguous. Expired windows are refreshed
//! lazily on the next check; [`RateLimiter::sweep_expired`] only bounds memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{RateLimitConfig, RatePolicy};
use crate::store::{KeyedStore, MemoryStore};

/// What is being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    Message,
    Auth,
}

impl RateLimitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Auth => "auth",
        }
    }
}

impl std::fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter for one (category, user) window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until the window resets; set only when rejected.
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn rejected(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

pub struct RateLimiter {
    windows: Arc<dyn KeyedStore<RateWindow>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(config, clock, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        windows: Arc<dyn KeyedStore<RateWindow>>,
    ) -> Self {
        Self {
            windows,
            config,
            clock,
        }
    }

    fn policy(&self, category: RateLimitCategory) -> RatePolicy {
        match category {
            RateLimitCategory::Message => self.config.message,
            RateLimitCategory::Auth => self.config.auth,
        }
    }

    /// Count one request and decide whether it may proceed.
    ///
    /// The counter is bumped before comparing, so the request that crosses the
    /// limit is itself rejected.
    pub fn check(&self, user_id: &str, category: RateLimitCategory) -> RateDecision {
        let policy = self.policy(category);
        let now = self.clock.now();
        let key = format!("{}:{}", category, user_id);

        let mut decision = RateDecision::allowed();
        self.windows.modify(&key, &mut |slot| {
            let expired = slot.as_ref().map_or(true, |window| now > window.reset_at);
            if expired {
                *slot = Some(RateWindow {
                    count: 0,
                    reset_at: now + policy.window(),
                });
            }
            let Some(window) = slot.as_mut() else {
                return;
            };

            window.count = window.count.saturating_add(1);
            if window.count > policy.max_requests {
                let remaining_ms = (window.reset_at - now).num_milliseconds().max(0) as u64;
                decision = RateDecision::rejected(remaining_ms.div_ceil(1000).max(1));
            }
        });

        if !decision.allowed {
            debug!(
                "Rate limited {} for {} (retry in {:?}s)",
                user_id, category, decision.retry_after_secs
            );
        }
        decision
    }

    /// Drop windows that have already reset. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        self.windows.sweep(&|window| now <= window.reset_at)
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}
