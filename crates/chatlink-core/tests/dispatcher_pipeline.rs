use std::sync::Arc;

use chatlink_core::local::{
    ExcerptSummarizer, InMemoryAccountDirectory, InMemoryConversationLog, ScriptedAgent,
    StaticPlatformDirectory,
};
use chatlink_core::session::PendingConfirmation;
use chatlink_core::{
    ChannelType, ChatlinkConfig, Collaborators, ConversationContextManager, DispatchOutcome,
    InboundEvent, LinkState, ManualClock, MessageDispatcher, RateLimitCategory, RateLimiter,
    ReplyKind, SessionStore,
};
use chatlink_traits::{AgentReply, CollaboratorError, SessionKey, Turn};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

struct Pipeline {
    dispatcher: MessageDispatcher,
    accounts: Arc<InMemoryAccountDirectory>,
    agent: Arc<ScriptedAgent>,
    log: Arc<InMemoryConversationLog>,
    clock: Arc<ManualClock>,
    counter: std::sync::atomic::AtomicUsize,
}

impl Pipeline {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let accounts = Arc::new(InMemoryAccountDirectory::new());
        let agent = Arc::new(ScriptedAgent::new());
        let log = Arc::new(InMemoryConversationLog::new(clock.clone()));
        let dispatcher = MessageDispatcher::new(
            &ChatlinkConfig::default(),
            Collaborators {
                accounts: accounts.clone(),
                platform: Arc::new(StaticPlatformDirectory::new()),
                log: log.clone(),
                summarizer: Arc::new(ExcerptSummarizer::new()),
                agent: agent.clone(),
            },
            clock.clone(),
        )
        .expect("failed to build dispatcher");

        Self {
            dispatcher,
            accounts,
            agent,
            log,
            clock,
            counter: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    async fn send(&self, text: &str) -> DispatchOutcome {
        let id = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let event = InboundEvent::new(ChannelType::Slack, "U1", "T1", format!("msg-{id}"), text);
        self.dispatcher.dispatch(&event).await
    }

    fn key(&self) -> SessionKey {
        SessionKey::new("U1", "T1")
    }

    fn link_state(&self) -> LinkState {
        self.dispatcher.sessions().get(&self.key()).link_state()
    }
}

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ))
}

#[test]
fn rate_limiter_window_rejects_then_resets() {
    let clock = manual_clock();
    let limiter = RateLimiter::new(ChatlinkConfig::default().rate_limit, clock.clone());

    for _ in 0..5 {
        assert!(limiter.check("U1", RateLimitCategory::Auth).allowed);
    }
    let rejected = limiter.check("U1", RateLimitCategory::Auth);
    assert!(!rejected.allowed);
    assert!(rejected.retry_after_secs.unwrap() > 0);

    clock.advance(Duration::seconds(61));
    assert!(limiter.check("U1", RateLimitCategory::Auth).allowed);
    for _ in 0..4 {
        assert!(limiter.check("U1", RateLimitCategory::Auth).allowed);
    }
    assert!(!limiter.check("U1", RateLimitCategory::Auth).allowed);
}

#[test]
fn session_get_is_idempotent() {
    let clock = manual_clock();
    let store = SessionStore::new(clock.clone(), Duration::hours(24));
    let key = SessionKey::new("U9", "T9");

    let first = store.get(&key);
    clock.advance(Duration::milliseconds(5));
    let second = store.get(&key);

    assert_eq!(first.key, second.key);
    assert_eq!(first.link_state(), second.link_state());
    assert!(second.last_activity >= first.last_activity);
}

#[test]
fn duplicate_ids_are_suppressed() {
    let store = SessionStore::new(manual_clock(), Duration::hours(24));
    let key = SessionKey::new("U1", "T1");
    let seen: Vec<bool> = ["m1", "m1", "m2"]
        .into_iter()
        .map(|id| store.is_duplicate(&key, id))
        .collect();
    assert_eq!(seen, vec![false, true, false]);
}

#[tokio::test]
async fn auth_flow_links_with_code_and_short_circuits_after() {
    let pipeline = Pipeline::new();

    let reply = pipeline.send("user@example.com").await;
    assert_eq!(reply.reply().unwrap().kind, ReplyKind::Prompt);
    assert!(matches!(pipeline.link_state(), LinkState::AwaitingCode { .. }));

    let code = pipeline
        .accounts
        .outstanding_code("user@example.com")
        .expect("code was not sent");
    let reply = pipeline.send(&code).await;
    assert!(reply.text().unwrap().contains("linked"));
    assert!(matches!(pipeline.link_state(), LinkState::Linked { .. }));
    assert!(pipeline.agent.prompts().is_empty());

    // Linked sessions go straight to the agent.
    let reply = pipeline.send("what's next today?").await;
    assert_eq!(reply.text(), Some("You said: what's next today?"));
    assert_eq!(pipeline.agent.prompts().len(), 1);
    assert_eq!(
        pipeline
            .accounts
            .mapping("U1")
            .map(|mapping| mapping.platform_user_id),
        Some("U1".to_string())
    );
}

#[tokio::test]
async fn auth_flow_expired_code_reverts_to_unlinked() {
    let pipeline = Pipeline::new();
    pipeline.send("user@example.com").await;
    let code = pipeline.accounts.outstanding_code("user@example.com").unwrap();

    pipeline.clock.advance(Duration::minutes(10) + Duration::seconds(1));
    let reply = pipeline.send(&code).await;
    assert!(reply.text().unwrap().contains("expired"));
    assert_eq!(pipeline.link_state(), LinkState::Unlinked);
}

#[tokio::test]
async fn long_conversation_triggers_one_summarization() {
    let clock = manual_clock();
    let log = Arc::new(InMemoryConversationLog::new(clock.clone()));
    let manager =
        ConversationContextManager::new(log, clock, ChatlinkConfig::default().context).unwrap();
    let summarizer = ExcerptSummarizer::new();
    let key = SessionKey::new("U1", "T1");

    let mut context = None;
    for i in 0..10 {
        let text = format!("{i:02}{}", "z".repeat(198));
        context = Some(manager.append_turn(&key, Turn::user(text), true, &summarizer).await);
    }
    let context = context.unwrap();

    assert_eq!(summarizer.calls(), 1);
    let summary = context.summary.expect("summary missing");
    assert!(!summary.is_empty());
    assert!(summary.chars().count() <= 1000);
    let fragment = manager.render_prompt_fragment(&manager.get_or_create_today_context(&key).await);
    assert!(fragment.chars().count() <= 2000);
}

#[tokio::test]
async fn failed_summarization_loses_nothing() {
    let clock = manual_clock();
    let log = Arc::new(InMemoryConversationLog::new(clock.clone()));
    let manager =
        ConversationContextManager::new(log, clock, ChatlinkConfig::default().context).unwrap();
    let summarizer = ExcerptSummarizer::failing();
    let key = SessionKey::new("U1", "T1");

    let mut expected = Vec::new();
    let mut context = None;
    for i in 0..7 {
        let text = format!("turn {i}");
        expected.push(text.clone());
        context = Some(manager.append_turn(&key, Turn::user(text), true, &summarizer).await);
    }
    let context = context.unwrap();

    let texts: Vec<String> = context.turns.iter().map(|turn| turn.text.clone()).collect();
    assert_eq!(texts, expected);
    assert!(context.summary.is_none());
}

#[tokio::test]
async fn pending_confirmation_is_single_slot() {
    let store = SessionStore::new(manual_clock(), Duration::hours(24));
    let key = SessionKey::new("U1", "T1");
    for title in ["first", "second"] {
        store.set_pending_confirmation(
            &key,
            PendingConfirmation {
                payload: json!({ "title": title }),
                conflicts: vec![],
                created_at: Utc::now(),
            },
        );
    }
    let pending = store.take_pending_confirmation(&key).unwrap();
    assert_eq!(pending.payload["title"], "second");
    assert!(store.get(&key).pending_confirmation.is_none());
}

#[tokio::test]
async fn agent_failure_never_leaves_session_busy() {
    let pipeline = Pipeline::new();
    let account = pipeline.accounts.add_account("user@example.com", None);
    pipeline.accounts.add_mapping("U1", &account.id);
    pipeline
        .agent
        .push_error(CollaboratorError::Unavailable("boom".into()));

    let reply = pipeline.send("hello").await;
    assert_eq!(reply.reply().unwrap().kind, ReplyKind::Error);
    assert!(!pipeline.dispatcher.sessions().get(&pipeline.key()).busy);

    // The next message is processed normally.
    let reply = pipeline.send("hello again").await;
    assert_eq!(reply.text(), Some("You said: hello again"));
}

#[tokio::test]
async fn confirmation_round_trip_through_dispatcher() {
    let pipeline = Pipeline::new();
    let account = pipeline.accounts.add_account("user@example.com", None);
    pipeline.accounts.add_mapping("U1", &account.id);
    pipeline.agent.push_reply(AgentReply::ConfirmationRequest {
        payload: json!({ "event": "Standup" }),
        conflicts: vec![json!({ "event": "Review" })],
        user_text: "Standup overlaps with Review. Create anyway?".into(),
    });

    let reply = pipeline.send("add standup at 10").await;
    assert_eq!(reply.reply().unwrap().kind, ReplyKind::Confirmation);

    let reply = pipeline.send("Sure.").await;
    assert_eq!(reply.text(), Some("Done, it's been created."));
    assert_eq!(pipeline.agent.confirmed().len(), 1);

    // The confirmation exchange lands in the durable log too.
    let session = pipeline.dispatcher.contexts();
    let context = session.get_or_create_today_context(&pipeline.key()).await;
    let id = context.context_id.unwrap();
    let stored = pipeline.log.stored_turns(&id);
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[3].text, "Done, it's been created.");
}
