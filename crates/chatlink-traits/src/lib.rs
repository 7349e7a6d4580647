//! Chatlink Traits - Collaborator interfaces and boundary records.
//!
//! The session, identity-linking and conversation-context subsystem talks to
//! everything outside of it through the traits defined here:
//! - AccountDirectory, PlatformDirectory (identity and verification codes)
//! - ConversationLog (durable, day-scoped turn history)
//! - Summarizer, OrchestrationAgent (opaque language services)
//!
//! Implementations live in downstream crates (e.g., chatlink-core `local`
//! and `log` modules) or in the embedding application.

pub mod account;
pub mod agent;
pub mod conversation;
pub mod error;

// ── Top-level re-exports ─────────────────────────────────────────────

// Error types
pub use error::{CollaboratorError, Result};

// Identity
pub use account::{
    Account, AccountDirectory, AccountStatus, NewAccount, PlatformDirectory, PlatformMapping,
    PlatformProfile,
};

// Conversation log
pub use conversation::{ConversationLog, ConversationRecord, SessionKey, Turn, TurnRole};

// Language services
pub use agent::{AgentReply, IdentityContext, OrchestrationAgent, Summarizer};
