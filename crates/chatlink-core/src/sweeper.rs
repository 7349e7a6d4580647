//! Background memory hygiene.
//!
//! Periodically evicts idle sessions, reset rate-limit windows and cached
//! contexts from previous days. Every one of these also expires lazily on
//! access, so the sweep cadence never affects behavior.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ConversationContextManager;
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions: usize,
    pub rate_windows: usize,
    pub contexts: usize,
}

pub struct Sweeper {
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    contexts: Arc<ConversationContextManager>,
    period: Duration,
}

impl Sweeper {
    pub fn new(
        sessions: Arc<SessionStore>,
        rate_limiter: Arc<RateLimiter>,
        contexts: Arc<ConversationContextManager>,
        period: Duration,
    ) -> Self {
        Self {
            sessions,
            rate_limiter,
            contexts,
            period,
        }
    }

    pub fn run_once(&self) -> SweepStats {
        let stats = SweepStats {
            sessions: self.sessions.sweep_idle(),
            rate_windows: self.rate_limiter.sweep_expired(),
            contexts: self.contexts.evict_stale_days(),
        };
        debug!(
            sessions = stats.sessions,
            rate_windows = stats.rate_windows,
            contexts = stats.contexts,
            "Sweep finished"
        );
        stats
    }

    /// Spawn the sweep loop. The first sweep runs one period after start.
    pub fn start(self) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!("Sweeper started (period={:?})", self.period);
            let mut ticker = interval(self.period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                }
            }
            info!("Sweeper stopped");
        });

        SweeperHandle { cancel, task }
    }
}

/// Handle to stop a running [`Sweeper`]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
