//! Normalized channel events.
//!
//! Platform adapters translate their native payloads into [`InboundEvent`]
//! and render [`OutboundReply`] back out.

use chatlink_traits::SessionKey;
use serde::{Deserialize, Serialize};

/// Messaging platform an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Slack,
    Discord,
    Telegram,
    Console,
}

impl ChannelType {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Slack => "Slack",
            Self::Discord => "Discord",
            Self::Telegram => "Telegram",
            Self::Console => "Console",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// What a reply is, so adapters can style it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Agent answer.
    #[default]
    Answer,
    /// Account-linking guidance.
    Prompt,
    /// Rate-limit or still-processing notice.
    Notice,
    /// Agent proposes a write and waits for yes/no.
    Confirmation,
    Error,
}

/// Inbound message from a platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: ChannelType,
    pub platform_user_id: String,
    pub workspace_id: String,
    /// Platform message id, used for duplicate suppression
    pub message_id: String,
    pub text: Option<String>,
    pub sender_name: Option<String>,
    /// Authored by the bot itself
    pub is_self: bool,
}

impl InboundEvent {
    pub fn new(
        channel: ChannelType,
        platform_user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            platform_user_id: platform_user_id.into(),
            workspace_id: workspace_id.into(),
            message_id: message_id.into(),
            text: Some(text.into()),
            sender_name: None,
            is_self: false,
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Mark the event as authored by the bot.
    pub fn from_self(mut self) -> Self {
        self.is_self = true;
        self
    }

    pub fn without_text(mut self) -> Self {
        self.text = None;
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.platform_user_id, &self.workspace_id)
    }

    /// Trimmed text, if any is left.
    pub fn content(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Reply addressed back to the sender of an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub channel: ChannelType,
    pub platform_user_id: String,
    pub workspace_id: String,
    pub text: String,
    pub kind: ReplyKind,
}

impl OutboundReply {
    pub fn to(event: &InboundEvent, text: impl Into<String>) -> Self {
        Self {
            channel: event.channel,
            platform_user_id: event.platform_user_id.clone(),
            workspace_id: event.workspace_id.clone(),
            text: text.into(),
            kind: ReplyKind::Answer,
        }
    }

    pub fn with_kind(mut self, kind: ReplyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn prompt(event: &InboundEvent, text: impl Into<String>) -> Self {
        Self::to(event, text).with_kind(ReplyKind::Prompt)
    }

    pub fn notice(event: &InboundEvent, text: impl Into<String>) -> Self {
        Self::to(event, text).with_kind(ReplyKind::Notice)
    }

    pub fn error(event: &InboundEvent, text: impl Into<String>) -> Self {
        Self::to(event, text).with_kind(ReplyKind::Error)
    }
}
