//! Conversation log storage - byte-level API for day-scoped conversations.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::range_utils::{prefix_range, sequence_key};

/// Conversation headers: id -> JSON ConversationRecord
const CONVERSATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
/// Index: session key -> latest conversation id
const LATEST_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("conversation_latest");
/// Turns: "{conversation_id}:{sequence:012}" -> JSON Turn
const TURNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversation_turns");

/// Low-level conversation storage
#[derive(Debug, Clone)]
pub struct ConversationStorage {
    db: Arc<Database>,
}

impl ConversationStorage {
    /// Create a new ConversationStorage, initializing all tables.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CONVERSATIONS_TABLE)?;
        write_txn.open_table(LATEST_INDEX_TABLE)?;
        write_txn.open_table(TURNS_TABLE)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    // ============== Conversation Operations ==============

    /// Store a new conversation header and make it the session's latest.
    pub fn create_conversation(&self, id: &str, session_key: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            table.insert(id, data)?;
            let mut index = write_txn.open_table(LATEST_INDEX_TABLE)?;
            index.insert(session_key, id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Overwrite an existing conversation header.
    pub fn put_conversation(&self, id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            table.insert(id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a conversation header by id
    pub fn get_conversation(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
        Ok(table.get(id)?.map(|v| v.value().to_vec()))
    }

    /// Get the latest conversation (id, header) for a session key
    pub fn latest_for_session(&self, session_key: &str) -> Result<Option<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(LATEST_INDEX_TABLE)?;
        let Some(id) = index.get(session_key)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };

        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
        Ok(table.get(id.as_str())?.map(|v| (id.clone(), v.value().to_vec())))
    }

    // ============== Turn Operations ==============

    /// Store a turn at the given sequence number
    pub fn put_turn(&self, conversation_id: &str, sequence: u64, data: &[u8]) -> Result<()> {
        let key = sequence_key(conversation_id, sequence);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TURNS_TABLE)?;
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List turns of a conversation in sequence order
    pub fn list_turns(&self, conversation_id: &str) -> Result<Vec<(u64, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TURNS_TABLE)?;
        let prefix = format!("{}:", conversation_id);
        let (start, end) = prefix_range(&prefix);

        let mut turns = Vec::new();
        for item in table.range(start.as_str()..end.as_str())? {
            let (key, value) = item?;
            let sequence = key.value()[prefix.len()..].parse::<u64>()?;
            turns.push((sequence, value.value().to_vec()));
        }
        Ok(turns)
    }
}
