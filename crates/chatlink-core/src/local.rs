//! In-process collaborators.
//!
//! Stand-ins for the account service, platform directory, conversation log
//! and language services. The console adapter runs on them, and tests use
//! their failure switches to exercise the degraded paths.

use async_trait::async_trait;
use chatlink_traits::{
    Account, AccountDirectory, AccountStatus, AgentReply, CollaboratorError, ConversationLog,
    ConversationRecord, IdentityContext, NewAccount, OrchestrationAgent, PlatformDirectory,
    PlatformMapping, PlatformProfile, Result, SessionKey, Summarizer, Turn,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

// ── Account directory ────────────────────────────────────────────────

#[derive(Default)]
struct DirectoryState {
    accounts: HashMap<String, Account>,
    codes: HashMap<String, String>,
    mappings: HashMap<String, PlatformMapping>,
    auth_identities: HashMap<String, String>,
    sent_codes: usize,
}

/// Account store and code sender held in memory.
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    state: Mutex<DirectoryState>,
    outbox: Option<mpsc::UnboundedSender<(String, String)>>,
    fail_sends: AtomicBool,
    fail_lookups: AtomicBool,
    race_next_create: AtomicBool,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every issued `(email, code)` pair to `outbox` as well.
    pub fn with_outbox(mut self, outbox: mpsc::UnboundedSender<(String, String)>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Seed an existing account.
    pub fn add_account(&self, email: &str, display_name: Option<&str>) -> Account {
        let account = Account {
            id: format!("acct-{}", uuid::Uuid::new_v4()),
            email: email.to_lowercase(),
            display_name: display_name.map(str::to_string),
            status: AccountStatus::Active,
            auth_identity_id: None,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .accounts
            .insert(account.id.clone(), account.clone());
        account
    }

    /// Seed a pre-existing authentication identity for an email.
    pub fn add_auth_identity(&self, email: &str, identity_id: &str) {
        self.state
            .lock()
            .auth_identities
            .insert(email.to_lowercase(), identity_id.to_string());
    }

    /// Seed a platform mapping.
    pub fn add_mapping(&self, platform_user_id: &str, account_id: &str) {
        self.state.lock().mappings.insert(
            platform_user_id.to_string(),
            PlatformMapping {
                platform_user_id: platform_user_id.to_string(),
                account_id: account_id.to_string(),
                display_name: None,
                locale: None,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make the next `create_account` lose a race against a concurrent creator.
    pub fn simulate_create_race(&self) {
        self.race_next_create.store(true, Ordering::SeqCst);
    }

    /// Code most recently issued for an email and not yet used.
    pub fn outstanding_code(&self, email: &str) -> Option<String> {
        self.state.lock().codes.get(&email.to_lowercase()).cloned()
    }

    pub fn sent_code_count(&self) -> usize {
        self.state.lock().sent_codes
    }

    pub fn mapping(&self, platform_user_id: &str) -> Option<PlatformMapping> {
        self.state.lock().mappings.get(platform_user_id).cloned()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.state.lock().accounts.values().cloned().collect()
    }

    fn check_lookups(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "account directory offline".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.check_lookups()?;
        let email = email.to_lowercase();
        let state = self.state.lock();
        Ok(state
            .accounts
            .values()
            .find(|account| account.email.to_lowercase() == email)
            .cloned())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        self.check_lookups()?;
        Ok(self.state.lock().accounts.get(account_id).cloned())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let email = account.email.to_lowercase();
        if self.race_next_create.swap(false, Ordering::SeqCst) {
            debug!("Simulating concurrent account creation for {}", email);
            self.add_account(&email, account.display_name.as_deref());
        }

        let mut state = self.state.lock();
        if state.accounts.values().any(|existing| existing.email == email) {
            return Err(CollaboratorError::Conflict(format!(
                "account for {} already exists",
                email
            )));
        }

        let created = Account {
            id: format!("acct-{}", uuid::Uuid::new_v4()),
            email,
            display_name: account.display_name,
            status: account.status,
            auth_identity_id: account.auth_identity_id,
            created_at: Utc::now(),
        };
        state.accounts.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_auth_identity(&self, email: &str) -> Result<Option<String>> {
        self.check_lookups()?;
        Ok(self
            .state
            .lock()
            .auth_identities
            .get(&email.to_lowercase())
            .cloned())
    }

    async fn send_verification_code(&self, email: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected(
                "the mail server refused the address".into(),
            ));
        }

        let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
        {
            let mut state = self.state.lock();
            state.codes.insert(email.to_lowercase(), code.clone());
            state.sent_codes += 1;
        }
        info!("Issued verification code for {}", email);

        if let Some(outbox) = &self.outbox {
            let _ = outbox.send((email.to_string(), code));
        }
        Ok(())
    }

    async fn verify_code(&self, email: &str, code: &str) -> Result<()> {
        let email = email.to_lowercase();
        let mut state = self.state.lock();
        let matches = state.codes.get(&email).map(|expected| expected == code);
        match matches {
            Some(true) => {
                state.codes.remove(&email);
                Ok(())
            }
            Some(false) => Err(CollaboratorError::Rejected(
                "the code is incorrect".into(),
            )),
            None => Err(CollaboratorError::Rejected(
                "no code is outstanding for this address".into(),
            )),
        }
    }

    async fn find_platform_mapping(&self, platform_user_id: &str) -> Result<Option<String>> {
        self.check_lookups()?;
        Ok(self
            .state
            .lock()
            .mappings
            .get(platform_user_id)
            .map(|mapping| mapping.account_id.clone()))
    }

    async fn upsert_platform_mapping(&self, mapping: PlatformMapping) -> Result<()> {
        self.state
            .lock()
            .mappings
            .insert(mapping.platform_user_id.clone(), mapping);
        Ok(())
    }
}

// ── Platform directory ───────────────────────────────────────────────

/// Platform user profiles held in memory.
#[derive(Default)]
pub struct StaticPlatformDirectory {
    profiles: Mutex<HashMap<String, PlatformProfile>>,
    fail: AtomicBool,
}

impl StaticPlatformDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, platform_user_id: &str, profile: PlatformProfile) {
        self.profiles
            .lock()
            .insert(platform_user_id.to_string(), profile);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlatformDirectory for StaticPlatformDirectory {
    async fn lookup_user(
        &self,
        platform_user_id: &str,
        _workspace_id: &str,
    ) -> Result<Option<PlatformProfile>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "platform directory offline".into(),
            ));
        }
        Ok(self.profiles.lock().get(platform_user_id).cloned())
    }
}

// ── Conversation log ─────────────────────────────────────────────────

#[derive(Default)]
struct LogState {
    conversations: HashMap<String, ConversationRecord>,
    turns: HashMap<String, Vec<Turn>>,
}

/// Conversation log held in memory.
pub struct InMemoryConversationLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryConversationLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            clock,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationRecord> {
        self.state.lock().conversations.get(id).cloned()
    }

    pub fn stored_turns(&self, id: &str) -> Vec<Turn> {
        self.state.lock().turns.get(id).cloned().unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("log is read-only".into()));
        }
        Ok(())
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("log unreachable".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryConversationLog {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn find_today_conversation(
        &self,
        session_key: &SessionKey,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationRecord>> {
        self.check_reads()?;
        let state = self.state.lock();
        Ok(state
            .conversations
            .values()
            .filter(|record| &record.session_key == session_key && record.last_updated >= since)
            .max_by_key(|record| record.last_updated)
            .cloned())
    }

    async fn create_conversation(&self, session_key: &SessionKey) -> Result<String> {
        self.check_writes()?;
        let now = self.clock.now();
        let record = ConversationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.clone(),
            summary: None,
            summarized_through: None,
            created_at: now,
            last_updated: now,
        };
        let id = record.id.clone();
        let mut state = self.state.lock();
        state.turns.insert(id.clone(), Vec::new());
        state.conversations.insert(id.clone(), record);
        Ok(id)
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        self.check_reads()?;
        let mut turns = self.stored_turns(conversation_id);
        turns.sort_by_key(|turn| turn.sequence);
        Ok(turns)
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Turn, sequence: u64) -> Result<()> {
        self.check_writes()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(record) = state.conversations.get_mut(conversation_id) else {
            return Err(CollaboratorError::NotFound(conversation_id.to_string()));
        };
        record.last_updated = now;

        let mut stored = turn.clone();
        stored.sequence = sequence;
        state
            .turns
            .entry(conversation_id.to_string())
            .or_default()
            .push(stored);
        Ok(())
    }

    async fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        summarized_through: u64,
    ) -> Result<()> {
        self.check_writes()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| CollaboratorError::NotFound(conversation_id.to_string()))?;
        record.summary = Some(summary.to_string());
        record.summarized_through = Some(summarized_through);
        record.last_updated = now;
        Ok(())
    }
}

// ── Language services ────────────────────────────────────────────────

const EXCERPT_CHARS: usize = 80;

/// Summarizer that keeps a short excerpt of every compacted turn.
#[derive(Default)]
pub struct ExcerptSummarizer {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl ExcerptSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let summarizer = Self::default();
        summarizer.fail.store(true, Ordering::SeqCst);
        summarizer
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ExcerptSummarizer {
    async fn summarize(&self, prior: Option<&str>, turns: &[Turn]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("summarizer timed out".into()));
        }

        let mut lines: Vec<String> = prior.map(|p| vec![p.to_string()]).unwrap_or_default();
        for turn in turns {
            let excerpt: String = turn.text.chars().take(EXCERPT_CHARS).collect();
            lines.push(format!("{}: {}", turn.role.label(), excerpt));
        }
        Ok(lines.join("\n"))
    }
}

/// Agent that answers from a queue of scripted replies, then echoes.
#[derive(Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Result<AgentReply>>>,
    prompts: Mutex<Vec<String>>,
    confirmed: Mutex<Vec<Value>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: AgentReply) {
        self.replies.lock().push_back(Ok(reply));
    }

    pub fn push_error(&self, error: CollaboratorError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Prompt fragments received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Payloads executed through `confirm`.
    pub fn confirmed(&self) -> Vec<Value> {
        self.confirmed.lock().clone()
    }

    fn echo(prompt_fragment: &str) -> String {
        let last_user = prompt_fragment
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("User: "))
            .unwrap_or("");
        format!("You said: {}", last_user)
    }
}

#[async_trait]
impl OrchestrationAgent for ScriptedAgent {
    async fn respond(
        &self,
        prompt_fragment: &str,
        _identity: &IdentityContext,
    ) -> Result<AgentReply> {
        self.prompts.lock().push(prompt_fragment.to_string());
        let scripted = self.replies.lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => Ok(AgentReply::text(Self::echo(prompt_fragment))),
        }
    }

    async fn confirm(&self, payload: &Value, _identity: &IdentityContext) -> Result<String> {
        self.confirmed.lock().push(payload.clone());
        Ok("Done, it's been created.".to_string())
    }
}
