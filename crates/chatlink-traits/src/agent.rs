//! Language-service abstractions: the summarizer and the orchestration agent.
//!
//! Both are treated as opaque and unreliable; callers must tolerate errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::Turn;
use crate::error::Result;

/// Prefix of the legacy in-band confirmation marker.
pub const CONFIRMATION_MARKER: &str = "CONFLICT";
const MARKER_DELIMITER: &str = "::";

/// Who the agent is acting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub workspace_id: String,
}

/// Reply produced by the orchestration agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentReply {
    /// Plain text to show the user.
    Text { text: String },
    /// A write that needs explicit approval before it runs.
    ConfirmationRequest {
        payload: Value,
        #[serde(default)]
        conflicts: Vec<Value>,
        user_text: String,
    },
}

#[derive(Deserialize)]
struct MarkedPayload {
    payload: Value,
    #[serde(default)]
    conflicts: Vec<Value>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text shown to the user for this reply.
    pub fn user_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::ConfirmationRequest { user_text, .. } => user_text,
        }
    }

    /// Decode a reply from an agent that can only produce text.
    ///
    /// Recognises `CONFLICT::{"payload":...,"conflicts":[...]}::<user text>`.
    /// Anything that does not decode cleanly is returned verbatim as `Text`.
    pub fn from_marked_text(raw: &str) -> Self {
        Self::decode_marker(raw).unwrap_or_else(|| Self::text(raw))
    }

    fn decode_marker(raw: &str) -> Option<Self> {
        let rest = raw
            .trim_start()
            .strip_prefix(CONFIRMATION_MARKER)?
            .strip_prefix(MARKER_DELIMITER)?;

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<MarkedPayload>();
        let marked = stream.next()?.ok()?;
        let consumed = stream.byte_offset();

        let user_text = rest[consumed..].strip_prefix(MARKER_DELIMITER)?.trim();
        if user_text.is_empty() {
            return None;
        }

        Some(Self::ConfirmationRequest {
            payload: marked.payload,
            conflicts: marked.conflicts,
            user_text: user_text.to_string(),
        })
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Fold `turns` into a running summary. `prior` is the current summary, if any.
    async fn summarize(&self, prior: Option<&str>, turns: &[Turn]) -> Result<String>;
}

#[async_trait]
pub trait OrchestrationAgent: Send + Sync {
    /// Answer the latest user turn given a bounded prompt fragment.
    async fn respond(&self, prompt_fragment: &str, identity: &IdentityContext)
    -> Result<AgentReply>;

    /// Execute a previously proposed write the user has approved.
    async fn confirm(&self, payload: &Value, identity: &IdentityContext) -> Result<String>;
}
