//! Message dispatcher.
//!
//! Single entry point for normalized inbound events. Each event runs through
//! a fixed pipeline of guards (self-authored, empty, duplicate, rate limit,
//! identity, busy) before it reaches the orchestration agent. Every guard
//! rejection is a normal reply, not an error.

use chatlink_traits::{
    AccountDirectory, AgentReply, ConversationLog, IdentityContext, OrchestrationAgent,
    PlatformDirectory, SessionKey, Summarizer, Turn,
};
use scopeguard::ScopeGuard;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::channel::{InboundEvent, OutboundReply, ReplyKind};
use crate::clock::Clock;
use crate::config::ChatlinkConfig;
use crate::context::ConversationContextManager;
use crate::error::Result;
use crate::identity::{IdentityLinker, LinkOutcome};
use crate::rate_limit::{RateLimitCategory, RateLimiter};
use crate::session::{PendingConfirmation, SessionStore, TurnStart};

const YES_WORDS: &[&str] = &["yes", "y", "ok", "confirm", "sure", "go ahead"];
const NO_WORDS: &[&str] = &["no", "n", "cancel", "stop", "nevermind"];
const MAX_ANSWER_WORDS: usize = 4;
const CANCELLED: &str = "Okay, I've cancelled that. Nothing was changed.";

/// Errors that end a turn with an apology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    RateLimited { retry_after_secs: u64 },
    /// A previous message from the same session is still in flight.
    Busy,
    AgentFailed(String),
    ConfirmFailed(String),
}

impl ChatError {
    /// Get a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { retry_after_secs } => format!(
                "You're sending messages too quickly. Please try again in {} seconds.",
                retry_after_secs
            ),
            Self::Busy => {
                "I'm still working on your previous message. Please wait a moment.".into()
            }
            Self::AgentFailed(_) => {
                "Sorry, something went wrong while handling your message. Please try again.".into()
            }
            Self::ConfirmFailed(_) => {
                "Sorry, I couldn't complete that change. Nothing was saved, please try again."
                    .into()
            }
        }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited for {}s", retry_after_secs)
            }
            Self::Busy => write!(f, "Session busy"),
            Self::AgentFailed(msg) => write!(f, "Agent failed: {}", msg),
            Self::ConfirmFailed(msg) => write!(f, "Confirmation failed: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

/// Why an event produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    SelfAuthored,
    Empty,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Reply(OutboundReply),
    Ignored(IgnoreReason),
}

impl DispatchOutcome {
    pub fn reply(&self) -> Option<&OutboundReply> {
        match self {
            Self::Reply(reply) => Some(reply),
            Self::Ignored(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.reply().map(|reply| reply.text.as_str())
    }
}

/// Answer to a pending confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationAnswer {
    Yes,
    No,
}

/// Classify a short yes/no reply. Longer or unrecognised text is `None`.
pub fn classify_answer(text: &str) -> Option<ConfirmationAnswer> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|word| !word.is_empty())
        .collect();
    if words.is_empty() || words.len() > MAX_ANSWER_WORDS {
        return None;
    }

    let phrase = words.join(" ");
    let matches = |list: &[&str]| list.contains(&phrase.as_str()) || list.contains(&words[0]);
    if matches(YES_WORDS) {
        Some(ConfirmationAnswer::Yes)
    } else if matches(NO_WORDS) {
        Some(ConfirmationAnswer::No)
    } else {
        None
    }
}

/// External services the dispatcher depends on.
pub struct Collaborators {
    pub accounts: Arc<dyn AccountDirectory>,
    pub platform: Arc<dyn PlatformDirectory>,
    pub log: Arc<dyn ConversationLog>,
    pub summarizer: Arc<dyn Summarizer>,
    pub agent: Arc<dyn OrchestrationAgent>,
}

pub struct MessageDispatcher {
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    linker: IdentityLinker,
    contexts: Arc<ConversationContextManager>,
    summarizer: Arc<dyn Summarizer>,
    agent: Arc<dyn OrchestrationAgent>,
    clock: Arc<dyn Clock>,
}

impl MessageDispatcher {
    pub fn new(
        config: &ChatlinkConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let sessions = Arc::new(SessionStore::new(clock.clone(), config.session.idle_ttl()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let contexts = Arc::new(ConversationContextManager::new(
            collaborators.log,
            clock.clone(),
            config.context.clone(),
        )?);
        let linker = IdentityLinker::new(
            sessions.clone(),
            collaborators.accounts,
            collaborators.platform,
            rate_limiter.clone(),
            clock.clone(),
            config.identity.clone(),
        );

        Ok(Self {
            sessions,
            rate_limiter,
            linker,
            contexts,
            summarizer: collaborators.summarizer,
            agent: collaborators.agent,
            clock,
        })
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    pub fn contexts(&self) -> Arc<ConversationContextManager> {
        self.contexts.clone()
    }

    /// Handle one inbound event.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        if event.is_self {
            return DispatchOutcome::Ignored(IgnoreReason::SelfAuthored);
        }
        let Some(text) = event.content() else {
            return DispatchOutcome::Ignored(IgnoreReason::Empty);
        };

        let key = event.session_key();
        if self.sessions.is_duplicate(&key, &event.message_id) {
            debug!("Skipping duplicate message {} for {}", event.message_id, key);
            return DispatchOutcome::Ignored(IgnoreReason::Duplicate);
        }

        let decision = self
            .rate_limiter
            .check(&event.platform_user_id, RateLimitCategory::Message);
        if !decision.allowed {
            let error = ChatError::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            };
            return DispatchOutcome::Reply(OutboundReply::notice(event, error.user_message()));
        }

        let identity = match self.linker.resolve(&key, text).await {
            LinkOutcome::Linked(identity) => identity,
            LinkOutcome::Verified { message, .. } | LinkOutcome::Prompt(message) => {
                return DispatchOutcome::Reply(OutboundReply::prompt(event, message));
            }
        };

        let pending = match self.sessions.try_begin_turn(&key) {
            TurnStart::Acquired(pending) => pending,
            TurnStart::Busy => {
                debug!("Session {} busy, rejecting {}", key, event.message_id);
                return DispatchOutcome::Reply(OutboundReply::notice(
                    event,
                    ChatError::Busy.user_message(),
                ));
            }
        };
        let sessions = self.sessions.clone();
        let busy = scopeguard::guard(key.clone(), move |key| sessions.release(&key));

        info!(
            "Processing {} message {} for {}",
            event.channel, event.message_id, key
        );
        let identity = identity.context(&event.workspace_id);

        if let Some(pending) = pending {
            match classify_answer(text) {
                Some(answer) => {
                    return self
                        .resolve_confirmation(event, &key, text, pending, answer, &identity)
                        .await;
                }
                None => debug!("Dropped pending confirmation for {} after new request", key),
            }
        }

        let (outcome, pending) = self.ask_agent(event, &key, text, &identity).await;
        if let Some(pending) = pending {
            // Busy is cleared together with the pending slot, not by the guard.
            let key = ScopeGuard::into_inner(busy);
            self.sessions.release_with_confirmation(&key, pending);
        }
        outcome
    }

    async fn ask_agent(
        &self,
        event: &InboundEvent,
        key: &SessionKey,
        text: &str,
        identity: &IdentityContext,
    ) -> (DispatchOutcome, Option<PendingConfirmation>) {
        let context = self
            .contexts
            .append_turn(key, Turn::user(text), true, self.summarizer.as_ref())
            .await;
        let fragment = self.contexts.render_prompt_fragment(&context);

        let reply = match self.agent.respond(&fragment, identity).await {
            Ok(AgentReply::Text { text }) => AgentReply::from_marked_text(&text),
            Ok(reply) => reply,
            Err(e) => {
                let error = ChatError::AgentFailed(e.to_string());
                error!("Turn failed for {}: {}", key, error);
                return (
                    DispatchOutcome::Reply(OutboundReply::error(event, error.user_message())),
                    None,
                );
            }
        };

        self.contexts
            .append_turn(
                key,
                Turn::assistant(reply.user_text()),
                true,
                self.summarizer.as_ref(),
            )
            .await;

        match reply {
            AgentReply::Text { text } => {
                (DispatchOutcome::Reply(OutboundReply::to(event, text)), None)
            }
            AgentReply::ConfirmationRequest {
                payload,
                conflicts,
                user_text,
            } => {
                debug!(
                    "Agent requested confirmation for {} ({} conflicts)",
                    key,
                    conflicts.len()
                );
                let pending = PendingConfirmation {
                    payload,
                    conflicts,
                    created_at: self.clock.now(),
                };
                (
                    DispatchOutcome::Reply(
                        OutboundReply::to(event, user_text).with_kind(ReplyKind::Confirmation),
                    ),
                    Some(pending),
                )
            }
        }
    }

    async fn resolve_confirmation(
        &self,
        event: &InboundEvent,
        key: &SessionKey,
        text: &str,
        pending: PendingConfirmation,
        answer: ConfirmationAnswer,
        identity: &IdentityContext,
    ) -> DispatchOutcome {
        let reply = match answer {
            ConfirmationAnswer::No => {
                info!("User cancelled pending confirmation for {}", key);
                OutboundReply::to(event, CANCELLED)
            }
            ConfirmationAnswer::Yes => match self.agent.confirm(&pending.payload, identity).await {
                Ok(result) => {
                    info!("Executed confirmed write for {}", key);
                    OutboundReply::to(event, result)
                }
                Err(e) => {
                    let error = ChatError::ConfirmFailed(e.to_string());
                    error!("Confirmed write failed for {}: {}", key, error);
                    return DispatchOutcome::Reply(OutboundReply::error(
                        event,
                        error.user_message(),
                    ));
                }
            },
        };

        let summarizer = self.summarizer.as_ref();
        self.contexts
            .append_turn(key, Turn::user(text), true, summarizer)
            .await;
        self.contexts
            .append_turn(key, Turn::assistant(&reply.text), true, summarizer)
            .await;
        DispatchOutcome::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use crate::clock::ManualClock;
    use crate::local::{
        ExcerptSummarizer, InMemoryAccountDirectory, InMemoryConversationLog, ScriptedAgent,
        StaticPlatformDirectory,
    };
    use chatlink_traits::CollaboratorError;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Harness {
        dispatcher: MessageDispatcher,
        accounts: Arc<InMemoryAccountDirectory>,
        agent: Arc<ScriptedAgent>,
        next_id: std::sync::atomic::AtomicUsize,
    }

    impl Harness {
        fn new(config: ChatlinkConfig) -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            ));
            let accounts = Arc::new(InMemoryAccountDirectory::new());
            let agent = Arc::new(ScriptedAgent::new());
            let dispatcher = MessageDispatcher::new(
                &config,
                Collaborators {
                    accounts: accounts.clone(),
                    platform: Arc::new(StaticPlatformDirectory::new()),
                    log: Arc::new(InMemoryConversationLog::new(clock.clone())),
                    summarizer: Arc::new(ExcerptSummarizer::new()),
                    agent: agent.clone(),
                },
                clock,
            )
            .unwrap();
            Self {
                dispatcher,
                accounts,
                agent,
                next_id: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn linked() -> Self {
            let harness = Self::new(ChatlinkConfig::default());
            let account = harness.accounts.add_account("ana@example.com", Some("Ana"));
            harness.accounts.add_mapping("U1", &account.id);
            harness
        }

        fn event(&self, text: &str) -> InboundEvent {
            let id = self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            InboundEvent::new(ChannelType::Slack, "U1", "T1", format!("m{}", id), text)
        }

        async fn send(&self, text: &str) -> DispatchOutcome {
            self.dispatcher.dispatch(&self.event(text)).await
        }

        fn key(&self) -> SessionKey {
            SessionKey::new("U1", "T1")
        }
    }

    #[test]
    fn test_classify_answer() {
        assert_eq!(classify_answer("Yes!"), Some(ConfirmationAnswer::Yes));
        assert_eq!(classify_answer("go ahead"), Some(ConfirmationAnswer::Yes));
        assert_eq!(classify_answer("ok, do it"), Some(ConfirmationAnswer::Yes));
        assert_eq!(classify_answer("No thanks"), Some(ConfirmationAnswer::No));
        assert_eq!(classify_answer("nevermind."), Some(ConfirmationAnswer::No));
        assert_eq!(classify_answer("what about friday"), None);
        assert_eq!(classify_answer("yes but move it to friday at noon"), None);
        assert_eq!(classify_answer("..."), None);
    }

    #[tokio::test]
    async fn test_self_and_empty_events_are_ignored() {
        let h = Harness::linked();
        let own = h.event("hello").from_self();
        assert_eq!(
            h.dispatcher.dispatch(&own).await,
            DispatchOutcome::Ignored(IgnoreReason::SelfAuthored)
        );
        let blank = h.event("   ");
        assert_eq!(
            h.dispatcher.dispatch(&blank).await,
            DispatchOutcome::Ignored(IgnoreReason::Empty)
        );
    }

    #[tokio::test]
    async fn test_duplicate_event_is_ignored() {
        let h = Harness::linked();
        let event = h.event("hello");
        assert!(h.dispatcher.dispatch(&event).await.reply().is_some());
        assert_eq!(
            h.dispatcher.dispatch(&event).await,
            DispatchOutcome::Ignored(IgnoreReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn test_rate_limited_message_gets_wait_notice() {
        let mut config = ChatlinkConfig::default();
        config.rate_limit.message.max_requests = 2;
        let h = Harness::new(config);
        let account = h.accounts.add_account("ana@example.com", None);
        h.accounts.add_mapping("U1", &account.id);

        h.send("one").await;
        h.send("two").await;
        let outcome = h.send("three").await;
        let reply = outcome.reply().unwrap();
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(reply.text.contains("60 seconds"));
        assert_eq!(h.agent.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_unlinked_user_is_prompted_and_agent_not_called() {
        let h = Harness::new(ChatlinkConfig::default());
        let reply = h.send("what's on my calendar?").await;
        assert_eq!(reply.reply().unwrap().kind, ReplyKind::Prompt);
        assert!(h.agent.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_linked_user_reaches_agent_with_context() {
        let h = Harness::linked();
        let reply = h.send("book a room").await;
        assert_eq!(reply.text(), Some("You said: book a room"));

        h.send("for tomorrow").await;
        let prompts = h.agent.prompts();
        assert!(prompts[1].contains("User: book a room"));
        assert!(prompts[1].contains("Assistant: You said: book a room"));
        assert!(prompts[1].ends_with("User: for tomorrow"));
    }

    #[tokio::test]
    async fn test_busy_session_short_circuits_without_release() {
        let h = Harness::linked();
        // Link first, then simulate an in-flight request.
        h.send("hi").await;
        assert!(h.dispatcher.sessions().try_acquire(&h.key()));

        let reply = h.send("again").await;
        assert_eq!(reply.reply().unwrap().kind, ReplyKind::Notice);
        assert!(h.dispatcher.sessions().get(&h.key()).busy);
    }

    #[tokio::test]
    async fn test_agent_failure_clears_busy() {
        let h = Harness::linked();
        h.agent
            .push_error(CollaboratorError::Unavailable("model overloaded".into()));

        let reply = h.send("hello").await;
        let reply = reply.reply().unwrap();
        assert_eq!(reply.kind, ReplyKind::Error);
        assert!(!reply.text.contains("overloaded"));
        assert!(!h.dispatcher.sessions().get(&h.key()).busy);
    }

    #[tokio::test]
    async fn test_confirmation_request_then_yes_executes_write() {
        let h = Harness::linked();
        h.agent.push_reply(AgentReply::ConfirmationRequest {
            payload: json!({"title": "Standup"}),
            conflicts: vec![json!({"title": "1:1"})],
            user_text: "This overlaps with your 1:1. Create it anyway?".into(),
        });

        let reply = h.send("create standup at 10").await;
        assert_eq!(reply.reply().unwrap().kind, ReplyKind::Confirmation);
        let session = h.dispatcher.sessions().get(&h.key());
        assert!(session.pending_confirmation.is_some());
        assert!(!session.busy);

        let reply = h.send("yes").await;
        assert_eq!(reply.text(), Some("Done, it's been created."));
        assert_eq!(h.agent.confirmed(), vec![json!({"title": "Standup"})]);
        assert!(
            h.dispatcher
                .sessions()
                .get(&h.key())
                .pending_confirmation
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_marked_text_reply_becomes_confirmation() {
        let h = Harness::linked();
        h.agent.push_reply(AgentReply::text(
            r#"CONFLICT::{"payload":{"id":7}}::Overwrite the existing note?"#,
        ));

        let reply = h.send("save note").await;
        assert_eq!(reply.text(), Some("Overwrite the existing note?"));

        let reply = h.send("cancel").await;
        assert_eq!(reply.text(), Some(CANCELLED));
        assert!(h.agent.confirmed().is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_message_drops_pending_confirmation() {
        let h = Harness::linked();
        h.agent.push_reply(AgentReply::ConfirmationRequest {
            payload: json!({"id": 1}),
            conflicts: vec![],
            user_text: "Proceed?".into(),
        });
        h.send("delete the draft").await;

        let reply = h.send("actually, what time is it in Tokyo?").await;
        assert_eq!(
            reply.text(),
            Some("You said: actually, what time is it in Tokyo?")
        );

        // A later "yes" has nothing to confirm and goes to the agent.
        h.send("yes").await;
        assert!(h.agent.confirmed().is_empty());
    }
}
