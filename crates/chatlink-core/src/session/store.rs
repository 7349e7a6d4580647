use chatlink_traits::SessionKey;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{PendingConfirmation, Session};
use crate::clock::Clock;
use crate::store::{KeyedStore, MemoryStore};

/// Result of [`SessionStore::try_begin_turn`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStart {
    /// Another turn holds the session.
    Busy,
    /// The session is now busy; carries the confirmation that was pending.
    Acquired(Option<PendingConfirmation>),
}

/// Session registry with idle-TTL eviction.
///
/// Sessions are created lazily on first access. A session idle for longer
/// than the TTL is treated as gone on the next access even if the background
/// sweep has not run yet.
pub struct SessionStore {
    sessions: Arc<dyn KeyedStore<Session>>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, idle_ttl: Duration) -> Self {
        Self::with_store(clock, idle_ttl, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        clock: Arc<dyn Clock>,
        idle_ttl: Duration,
        sessions: Arc<dyn KeyedStore<Session>>,
    ) -> Self {
        Self {
            sessions,
            clock,
            idle_ttl,
        }
    }

    /// Read-modify-write one session, creating or replacing an idle one first.
    fn with_session<R>(&self, key: &SessionKey, f: impl FnOnce(&mut Session) -> R) -> R {
        let now = self.clock.now();
        let idle_ttl = self.idle_ttl;
        let mut f = Some(f);
        let mut result = None;

        self.sessions.modify(&key.storage_key(), &mut |slot| {
            let stale = slot
                .as_ref()
                .is_some_and(|session| session.is_idle(now, idle_ttl));
            if stale {
                debug!("Session {} expired on access", key);
            }
            if slot.is_none() || stale {
                *slot = Some(Session::new(key.clone(), now));
            }
            if let (Some(session), Some(f)) = (slot.as_mut(), f.take()) {
                session.touch(now);
                result = Some(f(session));
            }
        });

        // The slot is always populated before `f` runs.
        match result {
            Some(result) => result,
            None => unreachable!("session slot populated before use"),
        }
    }

    /// Get the session for a key, creating a default one if absent.
    pub fn get(&self, key: &SessionKey) -> Session {
        self.with_session(key, |session| session.clone())
    }

    /// Apply a partial update and return the merged session.
    pub fn update(&self, key: &SessionKey, f: impl FnOnce(&mut Session)) -> Session {
        self.with_session(key, |session| {
            f(session);
            session.clone()
        })
    }

    /// Snapshot without creating or touching.
    pub fn peek(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(&key.storage_key())
    }

    /// Clear the busy flag and any pending confirmation. Identity is kept.
    pub fn reset(&self, key: &SessionKey) {
        self.sessions.modify(&key.storage_key(), &mut |slot| {
            if let Some(session) = slot.as_mut() {
                session.busy = false;
                session.pending_confirmation = None;
            }
        });
    }

    /// Record `message_id` as processed; true when it was the last one seen.
    ///
    /// Assumes one dispatcher worker per session.
    pub fn is_duplicate(&self, key: &SessionKey, message_id: &str) -> bool {
        self.with_session(key, |session| {
            if session.last_message_id.as_deref() == Some(message_id) {
                return true;
            }
            session.last_message_id = Some(message_id.to_string());
            session.message_count += 1;
            false
        })
    }

    /// Atomically set `busy` if it was clear.
    pub fn try_acquire(&self, key: &SessionKey) -> bool {
        self.with_session(key, |session| {
            if session.busy {
                false
            } else {
                session.busy = true;
                true
            }
        })
    }

    pub fn release(&self, key: &SessionKey) {
        self.sessions.modify(&key.storage_key(), &mut |slot| {
            if let Some(session) = slot.as_mut() {
                session.busy = false;
            }
        });
    }

    /// Store a pending confirmation, replacing any previous one.
    pub fn set_pending_confirmation(&self, key: &SessionKey, pending: PendingConfirmation) {
        self.with_session(key, |session| {
            if session.pending_confirmation.is_some() {
                debug!("Replacing pending confirmation for {}", key);
            }
            session.pending_confirmation = Some(pending);
        });
    }

    pub fn take_pending_confirmation(&self, key: &SessionKey) -> Option<PendingConfirmation> {
        self.with_session(key, |session| session.pending_confirmation.take())
    }

    /// Set `busy` and empty the pending-confirmation slot in one step.
    ///
    /// The confirmation that was waiting, if any, is handed to the caller, so
    /// a set busy flag never coexists with a stored confirmation.
    pub fn try_begin_turn(&self, key: &SessionKey) -> TurnStart {
        self.with_session(key, |session| {
            if session.busy {
                return TurnStart::Busy;
            }
            session.busy = true;
            TurnStart::Acquired(session.pending_confirmation.take())
        })
    }

    /// Store a pending confirmation and clear `busy` in one step, so the
    /// confirmation never coexists with a set busy flag.
    pub fn release_with_confirmation(&self, key: &SessionKey, pending: PendingConfirmation) {
        self.with_session(key, |session| {
            session.busy = false;
            session.pending_confirmation = Some(pending);
        });
    }

    /// Evict sessions idle longer than the TTL. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_ttl = self.idle_ttl;
        let removed = self
            .sessions
            .sweep(&|session| !session.is_idle(now, idle_ttl));
        if removed > 0 {
            info!("Evicted {} idle sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
