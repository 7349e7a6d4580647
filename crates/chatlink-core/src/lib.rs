//! Chatlink core: sessions, identity linking and conversation context for
//! chat-bot front ends.
//!
//! Platform adapters feed normalized [`InboundEvent`]s into a
//! [`MessageDispatcher`], which applies duplicate suppression, rate limiting,
//! account linking and the per-session busy guard before handing the turn to
//! an external orchestration agent.

pub mod channel;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod local;
pub mod log;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod sweeper;

pub use channel::{ChannelType, InboundEvent, OutboundReply, ReplyKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChatlinkConfig;
pub use context::{ConversationContext, ConversationContextManager};
pub use dispatcher::{ChatError, Collaborators, DispatchOutcome, IgnoreReason, MessageDispatcher};
pub use error::{ChatlinkError, Result};
pub use identity::{IdentityLinker, LinkOutcome, LinkedIdentity};
pub use log::RedbConversationLog;
pub use rate_limit::{RateDecision, RateLimitCategory, RateLimiter};
pub use session::{LinkState, Session, SessionStore};
pub use store::{KeyedStore, MemoryStore};
pub use sweeper::{SweepStats, Sweeper, SweeperHandle};
