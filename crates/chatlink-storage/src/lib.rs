//! Chatlink Storage - Low-level persistence for the conversation log
//!
//! This crate uses redb as the embedded database and exposes byte-level APIs;
//! typed wrappers live in chatlink-core so that record formats stay owned by
//! the crate that defines them.
//!
//! # Tables
//!
//! - `conversations` - Conversation headers by id
//! - `conversation_latest` - Latest conversation id per session key
//! - `conversation_turns` - Turns keyed by `{conversation_id}:{sequence}`

pub mod conversation;
pub mod range_utils;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub use conversation::ConversationStorage;

/// Open (or create) the database file and initialize all tables.
pub fn open_database(path: impl AsRef<Path>) -> Result<Arc<Database>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Opening conversation database at {}", path.display());
    let db = Arc::new(Database::create(path)?);
    ConversationStorage::new(db.clone())?;
    Ok(db)
}
