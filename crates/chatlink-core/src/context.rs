//! Day-scoped conversation context.
//!
//! Keeps the live turn list and running summary for each session's current
//! day. Every turn is written to the [`ConversationLog`] best-effort; the
//! in-memory context is what the agent sees. Once the live turns grow past
//! the configured thresholds the older ones are folded into the summary.
//!
//! A conversation is reused only while its last update falls on the current
//! calendar day in the configured timezone.

use chatlink_traits::{ConversationLog, SessionKey, Summarizer, Turn};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ContextConfig;
use crate::error::Result;

const SUMMARY_HEADER: &str = "Previous conversation summary:";
const RECENT_HEADER: &str = "Recent messages:";
/// Step used to walk past a DST gap at local midnight.
const DAY_START_STEP_MINUTES: i64 = 15;
const DAY_START_PROBES: i64 = 4 * 24;

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Keep the last `max_chars` characters of `text`.
pub fn truncate_tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((index, _)) => &text[index..],
        None => "",
    }
}

fn total_chars(turns: &[Turn]) -> usize {
    turns.iter().map(Turn::char_len).sum()
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Working memory for one session's current day.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    /// Persisted conversation id; `None` while running memory-only.
    pub context_id: Option<String>,
    pub session_key: SessionKey,
    pub day: NaiveDate,
    /// Live turns, oldest first.
    pub turns: Vec<Turn>,
    pub summary: Option<String>,
    /// Highest sequence folded into `summary`.
    pub summarized_through: Option<u64>,
    pub next_sequence: u64,
    pub last_updated: DateTime<Utc>,
}

impl ConversationContext {
    fn empty(session_key: &SessionKey, day: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            context_id: None,
            session_key: session_key.clone(),
            day,
            turns: Vec::new(),
            summary: None,
            summarized_through: None,
            next_sequence: 1,
            last_updated: now,
        }
    }

    pub fn total_chars(&self) -> usize {
        total_chars(&self.turns)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConversationContextManager {
    log: Arc<dyn ConversationLog>,
    clock: Arc<dyn Clock>,
    config: ContextConfig,
    tz: Tz,
    contexts: DashMap<String, ConversationContext>,
}

impl ConversationContextManager {
    pub fn new(
        log: Arc<dyn ConversationLog>,
        clock: Arc<dyn Clock>,
        config: ContextConfig,
    ) -> Result<Self> {
        let tz = config.tz()?;
        Ok(Self {
            log,
            clock,
            config,
            tz,
            contexts: DashMap::new(),
        })
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// First instant of `day` in the configured timezone.
    ///
    /// When a DST gap swallows local midnight the day starts at the first
    /// local time that exists after it.
    fn day_start(&self, day: NaiveDate) -> DateTime<Utc> {
        let midnight = day.and_time(NaiveTime::default());
        (0..DAY_START_PROBES)
            .map(|step| midnight + Duration::minutes(DAY_START_STEP_MINUTES * step))
            .find_map(|local| self.tz.from_local_datetime(&local).earliest())
            .map(|start| start.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }

    /// Context for the session's current day, loading or creating it as needed.
    pub async fn get_or_create_today_context(&self, key: &SessionKey) -> ConversationContext {
        let now = self.clock.now();
        let day = self.today(now);
        let cache_key = key.storage_key();

        if let Some(context) = self.contexts.get(&cache_key)
            && context.day == day
        {
            return context.clone();
        }

        let context = self.load_or_create(key, day, now).await;
        self.contexts.insert(cache_key, context.clone());
        context
    }

    async fn load_or_create(
        &self,
        key: &SessionKey,
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> ConversationContext {
        let mut context = ConversationContext::empty(key, day, now);

        let record = match self
            .log
            .find_today_conversation(key, self.day_start(day))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Conversation lookup failed for {}, running memory-only: {}", key, e);
                return context;
            }
        };

        let Some(record) = record else {
            context.context_id = self.create_conversation(key).await;
            return context;
        };

        let stored = match self.log.list_turns(&record.id).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(
                    "Failed to load turns of conversation {}, running memory-only: {}",
                    record.id, e
                );
                return context;
            }
        };

        let summarized_through = record.summarized_through.unwrap_or(0);
        context.next_sequence = stored.iter().map(|turn| turn.sequence).max().unwrap_or(0) + 1;
        context.turns = stored
            .into_iter()
            .filter(|turn| turn.sequence > summarized_through)
            .collect();
        context.summary = record.summary;
        context.summarized_through = record.summarized_through;
        context.last_updated = record.last_updated;
        context.context_id = Some(record.id);

        debug!(
            "Reloaded conversation for {} with {} live turns",
            key,
            context.turns.len()
        );
        context
    }

    async fn create_conversation(&self, key: &SessionKey) -> Option<String> {
        match self.log.create_conversation(key).await {
            Ok(id) => {
                info!("Started conversation {} for {}", id, key);
                Some(id)
            }
            Err(e) => {
                warn!("Failed to create conversation for {}: {}", key, e);
                None
            }
        }
    }

    /// Append a turn and summarize if the context has grown past its thresholds.
    ///
    /// Summarization only runs once the account is known. Log failures are
    /// logged and the turn is kept in memory regardless.
    pub async fn append_turn(
        &self,
        key: &SessionKey,
        turn: Turn,
        identity_known: bool,
        summarizer: &dyn Summarizer,
    ) -> ConversationContext {
        let mut context = self.get_or_create_today_context(key).await;
        if context.context_id.is_none() {
            context.context_id = self.create_conversation(key).await;
        }

        let mut turn = turn;
        turn.sequence = context.next_sequence;
        context.next_sequence += 1;

        if let Some(id) = &context.context_id
            && let Err(e) = self.log.append_turn(id, &turn, turn.sequence).await
        {
            warn!("Failed to persist turn {} of {}: {}", turn.sequence, id, e);
        }

        context.turns.push(turn);
        context.last_updated = self.clock.now();

        if identity_known && self.should_summarize(&context) {
            self.summarize(&mut context, summarizer).await;
        }

        self.contexts.insert(key.storage_key(), context.clone());
        context
    }

    fn should_summarize(&self, context: &ConversationContext) -> bool {
        let count = context.turns.len();
        let over_volume = context.total_chars() > self.config.length_threshold
            || count > self.config.count_threshold;
        over_volume && count > self.config.min_turns
    }

    async fn summarize(&self, context: &mut ConversationContext, summarizer: &dyn Summarizer) {
        let split = context
            .turns
            .len()
            .saturating_sub(self.config.retained_turns);
        if split == 0 {
            return;
        }

        let older = &context.turns[..split];
        let through = older.last().map(|turn| turn.sequence);
        let summary = match summarizer.summarize(context.summary.as_deref(), older).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Summarization failed for {}: {}", context.session_key, e);
                return;
            }
        };

        let summary = truncate_tail(summary.trim(), self.config.max_summary_chars);
        if summary.is_empty() {
            warn!("Summarizer returned nothing for {}", context.session_key);
            return;
        }
        let summary = summary.to_string();

        context.turns.drain(..split);
        context.summary = Some(summary.clone());
        context.summarized_through = through;
        debug!(
            "Folded {} turns into summary for {}",
            split, context.session_key
        );

        if let (Some(id), Some(through)) = (&context.context_id, through)
            && let Err(e) = self.log.update_summary(id, &summary, through).await
        {
            warn!("Failed to persist summary of {}: {}", id, e);
        }
    }

    /// Bounded prompt text: summary block, then recent turns, tail-truncated.
    pub fn render_prompt_fragment(&self, context: &ConversationContext) -> String {
        let mut sections = Vec::new();

        if let Some(summary) = context.summary.as_deref().filter(|s| !s.is_empty()) {
            sections.push(format!(
                "{}\n{}",
                SUMMARY_HEADER,
                truncate_tail(summary, self.config.summary_display_chars)
            ));
        }

        if !context.turns.is_empty() {
            let lines = context
                .turns
                .iter()
                .map(|turn| format!("{}: {}", turn.role.label(), turn.text))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!(
                "{}\n{}",
                RECENT_HEADER,
                truncate_tail(&lines, self.config.recent_display_chars)
            ));
        }

        truncate_tail(&sections.join("\n\n"), self.config.fragment_max_chars).to_string()
    }

    /// Drop cached contexts from previous days. Returns how many were removed.
    pub fn evict_stale_days(&self) -> usize {
        let today = self.today(self.clock.now());
        let before = self.contexts.len();
        self.contexts.retain(|_, context| context.day == today);
        before - self.contexts.len()
    }

    pub fn cached_contexts(&self) -> usize {
        self.contexts.len()
    }
}
