use chatlink_traits::SessionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A write proposed by the agent that waits for the user's yes/no.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub payload: Value,
    pub conflicts: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

/// An emailed one-time code that has not been entered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingVerification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Identity-link state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    AwaitingCode {
        email: String,
        expires_at: DateTime<Utc>,
    },
    Linked {
        account_id: String,
        email: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub linked_email: Option<String>,
    pub linked_account_id: Option<String>,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub message_count: u64,
    /// Platform id of the most recently processed message.
    pub last_message_id: Option<String>,
    /// At most one in-flight request per session.
    pub busy: bool,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub pending_verification: Option<PendingVerification>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            linked_email: None,
            linked_account_id: None,
            display_name: None,
            locale: None,
            message_count: 0,
            last_message_id: None,
            busy: false,
            pending_confirmation: None,
            pending_verification: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked_account_id.is_some()
    }

    pub fn link_state(&self) -> LinkState {
        if let (Some(account_id), Some(email)) = (&self.linked_account_id, &self.linked_email) {
            return LinkState::Linked {
                account_id: account_id.clone(),
                email: email.clone(),
            };
        }
        match &self.pending_verification {
            Some(pending) => LinkState::AwaitingCode {
                email: pending.email.clone(),
                expires_at: pending.expires_at,
            },
            None => LinkState::Unlinked,
        }
    }

    /// Record a resolved account. Clears any pending verification.
    pub fn link(&mut self, account_id: impl Into<String>, email: impl Into<String>) {
        self.linked_account_id = Some(account_id.into());
        self.linked_email = Some(email.into());
        self.pending_verification = None;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_activity > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_link_state_transitions() {
        let mut session = Session::new(SessionKey::new("U1", "T1"), now());
        assert_eq!(session.link_state(), LinkState::Unlinked);

        session.pending_verification = Some(PendingVerification {
            email: "a@example.com".into(),
            expires_at: now() + Duration::minutes(10),
        });
        assert!(matches!(
            session.link_state(),
            LinkState::AwaitingCode { ref email, .. } if email == "a@example.com"
        ));

        session.link("acct-1", "a@example.com");
        assert!(session.pending_verification.is_none());
        assert_eq!(
            session.link_state(),
            LinkState::Linked {
                account_id: "acct-1".into(),
                email: "a@example.com".into()
            }
        );
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut session = Session::new(SessionKey::new("U1", "T1"), now());
        session.touch(now() - Duration::seconds(5));
        assert_eq!(session.last_activity, now());

        session.touch(now() + Duration::seconds(5));
        assert_eq!(session.last_activity, now() + Duration::seconds(5));
    }

    #[test]
    fn test_verification_expiry_is_exclusive() {
        let pending = PendingVerification {
            email: "a@example.com".into(),
            expires_at: now(),
        };
        assert!(!pending.is_expired(now()));
        assert!(pending.is_expired(now() + Duration::seconds(1)));
    }
}
