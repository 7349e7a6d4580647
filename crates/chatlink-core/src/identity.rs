//! Identity linking.
//!
//! Resolves which application account a platform user acts as. A session
//! moves UNLINKED -> AWAITING_CODE -> LINKED; automatic resolution through a
//! persisted mapping or the platform's own directory skips the code step.
//! Every unresolved outcome is a [`LinkOutcome::Prompt`] the caller shows to
//! the user verbatim.

use chatlink_traits::{
    Account, AccountDirectory, AccountStatus, CollaboratorError, IdentityContext, NewAccount,
    PlatformDirectory, PlatformMapping, PlatformProfile, SessionKey,
};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::rate_limit::{RateLimitCategory, RateLimiter};
use crate::session::{PendingVerification, Session, SessionStore};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("invalid email pattern regex")
});

const ASK_FOR_EMAIL: &str = "To get started, please reply with the email address of your account.";
const INVALID_EMAIL: &str = "That doesn't look like a valid email address. Please try again.";
const CODE_EXPIRED: &str =
    "Your verification code has expired. Please re-enter your email address to get a new one.";
const LINK_FAILED: &str =
    "Something went wrong while linking your account. Please try entering the code again.";

/// Account a session is acting as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedIdentity {
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub locale: Option<String>,
}

impl LinkedIdentity {
    fn from_session(session: &Session) -> Option<Self> {
        Some(Self {
            account_id: session.linked_account_id.clone()?,
            email: session.linked_email.clone()?,
            display_name: session.display_name.clone(),
            locale: session.locale.clone(),
        })
    }

    pub fn context(&self, workspace_id: &str) -> IdentityContext {
        IdentityContext {
            account_id: self.account_id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            locale: self.locale.clone(),
            workspace_id: workspace_id.to_string(),
        }
    }
}

/// Result of running one inbound message through the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The session is linked; the message should be handled normally.
    Linked(LinkedIdentity),
    /// The message was a verification code that just completed linking.
    /// It must not be forwarded; `message` confirms the link.
    Verified {
        identity: LinkedIdentity,
        message: String,
    },
    /// Not linked. Show the message to the user and stop.
    Prompt(String),
}

/// What an inbound message looks like from the email step's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EmailInput {
    Valid(String),
    Invalid,
    Absent,
}

/// Normalise an email for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Find the first email-shaped token (contains `@`) and validate it.
fn parse_email(input: &str) -> EmailInput {
    let candidate = input
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| "<>()[]\"',;:.!?".contains(c)))
        .find(|token| token.contains('@'));

    match candidate {
        Some(email) if is_valid_email(email) => EmailInput::Valid(normalize_email(email)),
        Some(_) => EmailInput::Invalid,
        None => EmailInput::Absent,
    }
}

/// A verification code is exactly `length` ASCII digits, spaces ignored.
fn parse_code(input: &str, length: usize) -> Option<String> {
    let code: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    (code.len() == length && code.chars().all(|c| c.is_ascii_digit())).then_some(code)
}

pub struct IdentityLinker {
    sessions: Arc<SessionStore>,
    accounts: Arc<dyn AccountDirectory>,
    platform: Arc<dyn PlatformDirectory>,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: IdentityConfig,
}

impl IdentityLinker {
    pub fn new(
        sessions: Arc<SessionStore>,
        accounts: Arc<dyn AccountDirectory>,
        platform: Arc<dyn PlatformDirectory>,
        rate_limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        config: IdentityConfig,
    ) -> Self {
        Self {
            sessions,
            accounts,
            platform,
            rate_limiter,
            clock,
            config,
        }
    }

    /// Run one inbound message through the link state machine.
    pub async fn resolve(&self, key: &SessionKey, input: &str) -> LinkOutcome {
        let session = self.sessions.get(key);
        if let Some(identity) = LinkedIdentity::from_session(&session) {
            return LinkOutcome::Linked(identity);
        }

        match session.pending_verification {
            Some(pending) => self.resolve_awaiting(key, pending, input).await,
            None => self.resolve_unlinked(key, input).await,
        }
    }

    async fn resolve_unlinked(&self, key: &SessionKey, input: &str) -> LinkOutcome {
        let profile = self.lookup_profile(key).await;
        if let Some(profile) = &profile {
            self.sessions.update(key, |session| {
                session.display_name = profile.display_name.clone();
                session.locale = profile.locale.clone();
            });
        }

        if let Some(identity) = self.link_from_mapping(key).await {
            return LinkOutcome::Linked(identity);
        }

        let platform_email = profile.and_then(|profile| profile.email);
        if let Some(email) = platform_email.filter(|email| is_valid_email(email))
            && let Some(identity) = self.link_from_platform_email(key, &email).await
        {
            return LinkOutcome::Linked(identity);
        }

        match parse_email(input) {
            EmailInput::Valid(email) => self.start_verification(key, &email).await,
            EmailInput::Invalid => LinkOutcome::Prompt(INVALID_EMAIL.to_string()),
            EmailInput::Absent => LinkOutcome::Prompt(ASK_FOR_EMAIL.to_string()),
        }
    }

    async fn resolve_awaiting(
        &self,
        key: &SessionKey,
        pending: PendingVerification,
        input: &str,
    ) -> LinkOutcome {
        if pending.is_expired(self.clock.now()) {
            debug!("Verification code for {} expired", key);
            self.sessions
                .update(key, |session| session.pending_verification = None);
            return LinkOutcome::Prompt(CODE_EXPIRED.to_string());
        }

        if let Some(code) = parse_code(input, self.config.code_length) {
            return self.submit_code(key, &pending.email, &code).await;
        }

        match parse_email(input) {
            EmailInput::Valid(email) => self.start_verification(key, &email).await,
            EmailInput::Invalid => LinkOutcome::Prompt(INVALID_EMAIL.to_string()),
            EmailInput::Absent => LinkOutcome::Prompt(format!(
                "Please reply with the {}-digit code sent to {}, or send a different email address.",
                self.config.code_length, pending.email
            )),
        }
    }

    async fn lookup_profile(&self, key: &SessionKey) -> Option<PlatformProfile> {
        match self
            .platform
            .lookup_user(&key.platform_user_id, &key.workspace_id)
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Platform lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn link_from_mapping(&self, key: &SessionKey) -> Option<LinkedIdentity> {
        let account_id = match self
            .accounts
            .find_platform_mapping(&key.platform_user_id)
            .await
        {
            Ok(Some(account_id)) => account_id,
            Ok(None) => return None,
            Err(e) => {
                warn!("Mapping lookup failed for {}: {}", key, e);
                return None;
            }
        };

        match self.accounts.get_account(&account_id).await {
            Ok(Some(account)) => {
                debug!("Linked {} through stored mapping", key);
                Some(self.link_session(key, &account))
            }
            Ok(None) => {
                warn!("Mapping for {} points at missing account {}", key, account_id);
                None
            }
            Err(e) => {
                warn!("Account lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn link_from_platform_email(
        &self,
        key: &SessionKey,
        email: &str,
    ) -> Option<LinkedIdentity> {
        let account = match self
            .accounts
            .find_account_by_email(&normalize_email(email))
            .await
        {
            Ok(Some(account)) => account,
            Ok(None) => return None,
            Err(e) => {
                warn!("Email lookup failed for {}: {}", key, e);
                return None;
            }
        };

        if let Err(e) = self.persist_mapping(key, &account).await {
            warn!("Failed to persist mapping for {}: {}", key, e);
        }
        info!("Linked {} through platform directory email", key);
        Some(self.link_session(key, &account))
    }

    async fn start_verification(&self, key: &SessionKey, email: &str) -> LinkOutcome {
        if let Some(prompt) = self.check_auth_limit(key) {
            return prompt;
        }

        if let Err(e) = self.accounts.send_verification_code(email).await {
            warn!("Failed to send verification code to {}: {}", email, e);
            return LinkOutcome::Prompt(format!(
                "I couldn't send a verification code to {}: {}. Please check the address and try again.",
                email,
                e.reason()
            ));
        }

        let expires_at = self.clock.now() + self.config.code_ttl();
        self.sessions.update(key, |session| {
            session.pending_verification = Some(PendingVerification {
                email: email.to_string(),
                expires_at,
            });
        });
        info!("Sent verification code for {} to {}", key, email);

        LinkOutcome::Prompt(format!(
            "I sent a {}-digit verification code to {}. Reply with the code to link your account.",
            self.config.code_length, email
        ))
    }

    async fn submit_code(&self, key: &SessionKey, email: &str, code: &str) -> LinkOutcome {
        if let Some(prompt) = self.check_auth_limit(key) {
            return prompt;
        }

        if let Err(e) = self.accounts.verify_code(email, code).await {
            debug!("Verification failed for {}: {}", key, e);
            return LinkOutcome::Prompt(format!(
                "That code didn't work ({}). Please try again, or send a different email address.",
                e.reason()
            ));
        }

        match self.complete_link(key, email).await {
            Ok(identity) => {
                info!("Linked {} to account {}", key, identity.account_id);
                let message = format!(
                    "Thanks, your account {} is now linked. How can I help?",
                    identity.email
                );
                LinkOutcome::Verified { identity, message }
            }
            Err(e) => {
                warn!("Failed to link {} after verification: {}", key, e);
                LinkOutcome::Prompt(LINK_FAILED.to_string())
            }
        }
    }

    async fn complete_link(
        &self,
        key: &SessionKey,
        email: &str,
    ) -> Result<LinkedIdentity, CollaboratorError> {
        let display_name = self.sessions.get(key).display_name;
        let account = self.resolve_or_create_account(email, display_name).await?;
        self.persist_mapping(key, &account).await?;
        Ok(self.link_session(key, &account))
    }

    /// Find the account for `email`, creating it if needed.
    ///
    /// A concurrent creator winning the race surfaces as a conflict; the
    /// account is then re-read instead of failing.
    async fn resolve_or_create_account(
        &self,
        email: &str,
        display_name: Option<String>,
    ) -> Result<Account, CollaboratorError> {
        if let Some(account) = self.accounts.find_account_by_email(email).await? {
            return Ok(account);
        }

        let auth_identity_id = self.accounts.find_auth_identity(email).await?;
        let status = if auth_identity_id.is_some() {
            AccountStatus::Active
        } else {
            AccountStatus::PendingVerification
        };

        let new_account = NewAccount {
            email: email.to_string(),
            display_name,
            status,
            auth_identity_id,
        };
        match self.accounts.create_account(new_account).await {
            Ok(account) => {
                info!("Created account {} for {} ({:?})", account.id, email, status);
                Ok(account)
            }
            Err(e) if e.is_conflict() => {
                debug!("Account for {} created concurrently, re-reading", email);
                self.accounts
                    .find_account_by_email(email)
                    .await?
                    .ok_or_else(|| CollaboratorError::NotFound(email.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_mapping(
        &self,
        key: &SessionKey,
        account: &Account,
    ) -> Result<(), CollaboratorError> {
        let session = self.sessions.get(key);
        self.accounts
            .upsert_platform_mapping(PlatformMapping {
                platform_user_id: key.platform_user_id.clone(),
                account_id: account.id.clone(),
                display_name: session.display_name,
                locale: session.locale,
                updated_at: self.clock.now(),
            })
            .await
    }

    fn link_session(&self, key: &SessionKey, account: &Account) -> LinkedIdentity {
        let session = self.sessions.update(key, |session| {
            session.link(account.id.clone(), normalize_email(&account.email));
            if session.display_name.is_none() {
                session.display_name = account.display_name.clone();
            }
        });
        LinkedIdentity {
            account_id: account.id.clone(),
            email: normalize_email(&account.email),
            display_name: session.display_name,
            locale: session.locale,
        }
    }

    fn check_auth_limit(&self, key: &SessionKey) -> Option<LinkOutcome> {
        let decision = self
            .rate_limiter
            .check(&key.platform_user_id, RateLimitCategory::Auth);
        if decision.allowed {
            return None;
        }
        Some(LinkOutcome::Prompt(format!(
            "Too many sign-in attempts. Please try again in {} seconds.",
            decision.retry_after_secs.unwrap_or(1)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RateLimitConfig, RatePolicy};
    use crate::local::{InMemoryAccountDirectory, StaticPlatformDirectory};
    use chrono::{Duration, TimeZone, Utc};

    struct Harness {
        linker: IdentityLinker,
        sessions: Arc<SessionStore>,
        accounts: Arc<InMemoryAccountDirectory>,
        platform: Arc<StaticPlatformDirectory>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let sessions = Arc::new(SessionStore::new(clock.clone(), Duration::hours(24)));
        let accounts = Arc::new(InMemoryAccountDirectory::new());
        let platform = Arc::new(StaticPlatformDirectory::new());
        let rate_limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                message: RatePolicy::new(30, 60),
                auth: RatePolicy::new(5, 60),
            },
            clock.clone(),
        ));
        let linker = IdentityLinker::new(
            sessions.clone(),
            accounts.clone(),
            platform.clone(),
            rate_limiter,
            clock.clone(),
            IdentityConfig::default(),
        );
        Harness {
            linker,
            sessions,
            accounts,
            platform,
            clock,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("U1", "T1")
    }

    fn prompt_text(outcome: LinkOutcome) -> String {
        match outcome {
            LinkOutcome::Prompt(text) => text,
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_email_variants() {
        assert_eq!(
            parse_email("my email is <Ana@Example.COM>."),
            EmailInput::Valid("ana@example.com".into())
        );
        assert_eq!(parse_email("ana@"), EmailInput::Invalid);
        assert_eq!(parse_email("hello there"), EmailInput::Absent);
    }

    #[test]
    fn test_parse_code_requires_exact_digits() {
        assert_eq!(parse_code("123 456", 6), Some("123456".into()));
        assert_eq!(parse_code("12345", 6), None);
        assert_eq!(parse_code("12a456", 6), None);
    }

    #[tokio::test]
    async fn test_unlinked_without_email_asks_for_one() {
        let h = harness();
        let text = prompt_text(h.linker.resolve(&key(), "hello").await);
        assert_eq!(text, ASK_FOR_EMAIL);
        assert_eq!(
            h.sessions.get(&key()).link_state(),
            crate::session::LinkState::Unlinked
        );
    }

    #[tokio::test]
    async fn test_platform_email_links_automatically() {
        let h = harness();
        let account = h.accounts.add_account("ana@example.com", Some("Ana"));
        h.platform.add_profile(
            "U1",
            PlatformProfile {
                email: Some("Ana@Example.com".into()),
                display_name: Some("Ana P".into()),
                locale: Some("en-US".into()),
            },
        );

        match h.linker.resolve(&key(), "hi").await {
            LinkOutcome::Linked(identity) => {
                assert_eq!(identity.account_id, account.id);
                assert_eq!(identity.display_name.as_deref(), Some("Ana P"));
                assert_eq!(identity.locale.as_deref(), Some("en-US"));
            }
            other => panic!("expected linked, got {:?}", other),
        }
        assert_eq!(h.accounts.mapping("U1").unwrap().account_id, account.id);
    }

    #[tokio::test]
    async fn test_stored_mapping_links_without_profile() {
        let h = harness();
        let account = h.accounts.add_account("bo@example.com", None);
        h.accounts.add_mapping("U1", &account.id);

        let outcome = h.linker.resolve(&key(), "anything").await;
        assert!(matches!(outcome, LinkOutcome::Linked(ref id) if id.account_id == account.id));
    }

    #[tokio::test]
    async fn test_directory_failure_falls_through_to_email_prompt() {
        let h = harness();
        h.platform.set_fail(true);
        let text = prompt_text(h.linker.resolve(&key(), "hello").await);
        assert_eq!(text, ASK_FOR_EMAIL);
    }

    #[tokio::test]
    async fn test_code_flow_creates_pending_account() {
        let h = harness();
        let text = prompt_text(h.linker.resolve(&key(), "new@example.com").await);
        assert!(text.contains("new@example.com"));

        let code = h.accounts.outstanding_code("new@example.com").unwrap();
        match h.linker.resolve(&key(), &code).await {
            LinkOutcome::Verified { identity, .. } => {
                assert_eq!(identity.email, "new@example.com");
            }
            other => panic!("expected verified, got {:?}", other),
        }

        let accounts = h.accounts.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].status, AccountStatus::PendingVerification);
        assert!(h.sessions.get(&key()).pending_verification.is_none());
    }

    #[tokio::test]
    async fn test_code_flow_with_auth_identity_creates_active_account() {
        let h = harness();
        h.accounts.add_auth_identity("id@example.com", "auth-7");
        h.linker.resolve(&key(), "id@example.com").await;
        let code = h.accounts.outstanding_code("id@example.com").unwrap();
        h.linker.resolve(&key(), &code).await;

        let accounts = h.accounts.accounts();
        assert_eq!(accounts[0].status, AccountStatus::Active);
        assert_eq!(accounts[0].auth_identity_id.as_deref(), Some("auth-7"));
    }

    #[tokio::test]
    async fn test_create_race_resolves_to_existing_account() {
        let h = harness();
        h.linker.resolve(&key(), "race@example.com").await;
        let code = h.accounts.outstanding_code("race@example.com").unwrap();
        h.accounts.simulate_create_race();

        let outcome = h.linker.resolve(&key(), &code).await;
        assert!(matches!(outcome, LinkOutcome::Verified { .. }));
        assert_eq!(h.accounts.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_code_allows_retry() {
        let h = harness();
        h.linker.resolve(&key(), "ana@example.com").await;
        let code = h.accounts.outstanding_code("ana@example.com").unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let text = prompt_text(h.linker.resolve(&key(), wrong).await);
        assert!(text.contains("didn't work"));
        assert!(h.sessions.get(&key()).pending_verification.is_some());

        let outcome = h.linker.resolve(&key(), &code).await;
        assert!(matches!(outcome, LinkOutcome::Verified { .. }));
    }

    #[tokio::test]
    async fn test_expired_code_returns_to_unlinked() {
        let h = harness();
        h.linker.resolve(&key(), "ana@example.com").await;
        let code = h.accounts.outstanding_code("ana@example.com").unwrap();

        h.clock.advance(Duration::minutes(11));
        let text = prompt_text(h.linker.resolve(&key(), &code).await);
        assert_eq!(text, CODE_EXPIRED);
        assert!(h.sessions.get(&key()).pending_verification.is_none());
    }

    #[tokio::test]
    async fn test_send_failure_stays_unlinked() {
        let h = harness();
        h.accounts.set_fail_sends(true);
        let text = prompt_text(h.linker.resolve(&key(), "ana@example.com").await);
        assert!(text.contains("mail server refused"));
        assert!(h.sessions.get(&key()).pending_verification.is_none());
    }

    #[tokio::test]
    async fn test_invalid_email_is_rejected() {
        let h = harness();
        let text = prompt_text(h.linker.resolve(&key(), "ana@nowhere").await);
        assert_eq!(text, INVALID_EMAIL);
        assert_eq!(h.accounts.sent_code_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_attempts_are_rate_limited() {
        let h = harness();
        for _ in 0..5 {
            h.linker.resolve(&key(), "ana@example.com").await;
        }
        let text = prompt_text(h.linker.resolve(&key(), "ana@example.com").await);
        assert!(text.starts_with("Too many sign-in attempts"));
        assert_eq!(h.accounts.sent_code_count(), 5);
    }
}
