//! Conversation log abstractions.
//!
//! The durable log keeps every turn of a day-scoped conversation. The
//! in-memory context built on top of it may compact turns into a summary,
//! the log never forgets them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifies one session: a platform user inside one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub platform_user_id: String,
    pub workspace_id: String,
}

impl SessionKey {
    pub fn new(platform_user_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            platform_user_id: platform_user_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// Stable storage key: `{workspace_id}:{platform_user_id}` with `%` and `:`
    /// percent-escaped in each part, so distinct keys never share a string.
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}",
            escape_key_part(&self.workspace_id),
            escape_key_part(&self.platform_user_id)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workspace_id, self.platform_user_id)
    }
}

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    /// Label used when rendering turns into a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    /// Position in the durable log; 0 until persisted.
    #[serde(default)]
    pub sequence: u64,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            sequence: 0,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            sequence: 0,
        }
    }

    /// Character count (not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Header of a persisted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub session_key: SessionKey,
    pub summary: Option<String>,
    /// Highest turn sequence folded into `summary`.
    #[serde(default)]
    pub summarized_through: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Latest conversation for the session updated at or after `since`.
    async fn find_today_conversation(
        &self,
        session_key: &SessionKey,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationRecord>>;

    /// Start a new conversation and return its id.
    async fn create_conversation(&self, session_key: &SessionKey) -> Result<String>;

    /// All turns of a conversation, ordered by sequence.
    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>>;

    async fn append_turn(&self, conversation_id: &str, turn: &Turn, sequence: u64) -> Result<()>;

    async fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        summarized_through: u64,
    ) -> Result<()>;
}
