//! Durable conversation log on redb.
//!
//! Typed wrapper around [`chatlink_storage::ConversationStorage`]; records
//! and turns are stored as JSON. redb calls block, so every operation runs on
//! the blocking pool.

use async_trait::async_trait;
use chatlink_storage::ConversationStorage;
use chatlink_traits::{
    CollaboratorError, ConversationLog, ConversationRecord, Result, SessionKey, Turn,
};
use chrono::{DateTime, Utc};
use redb::Database;
use std::sync::Arc;

use crate::clock::Clock;

#[derive(Clone)]
pub struct RedbConversationLog {
    storage: ConversationStorage,
    clock: Arc<dyn Clock>,
}

impl RedbConversationLog {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        Ok(Self {
            storage: ConversationStorage::new(db)?,
            clock,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ConversationStorage) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(storage))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("storage task failed: {}", e)))?
            .map_err(CollaboratorError::from)
    }
}

fn load_record(storage: &ConversationStorage, id: &str) -> anyhow::Result<ConversationRecord> {
    let bytes = storage
        .get_conversation(id)?
        .ok_or_else(|| anyhow::anyhow!("Conversation {} not found", id))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn store_record(storage: &ConversationStorage, record: &ConversationRecord) -> anyhow::Result<()> {
    let json = serde_json::to_vec(record)?;
    storage.put_conversation(&record.id, &json)
}

#[async_trait]
impl ConversationLog for RedbConversationLog {
    async fn find_today_conversation(
        &self,
        session_key: &SessionKey,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationRecord>> {
        let storage_key = session_key.storage_key();
        self.blocking(move |storage| {
            let Some((_, bytes)) = storage.latest_for_session(&storage_key)? else {
                return Ok(None);
            };
            let record: ConversationRecord = serde_json::from_slice(&bytes)?;
            Ok((record.last_updated >= since).then_some(record))
        })
        .await
    }

    async fn create_conversation(&self, session_key: &SessionKey) -> Result<String> {
        let now = self.clock.now();
        let record = ConversationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.clone(),
            summary: None,
            summarized_through: None,
            created_at: now,
            last_updated: now,
        };
        self.blocking(move |storage| {
            let json = serde_json::to_vec(&record)?;
            storage.create_conversation(&record.id, &record.session_key.storage_key(), &json)?;
            Ok(record.id)
        })
        .await
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let id = conversation_id.to_string();
        self.blocking(move |storage| {
            storage
                .list_turns(&id)?
                .into_iter()
                .map(|(sequence, bytes)| -> anyhow::Result<Turn> {
                    let mut turn: Turn = serde_json::from_slice(&bytes)?;
                    turn.sequence = sequence;
                    Ok(turn)
                })
                .collect()
        })
        .await
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Turn, sequence: u64) -> Result<()> {
        let id = conversation_id.to_string();
        let mut turn = turn.clone();
        turn.sequence = sequence;
        let now = self.clock.now();

        self.blocking(move |storage| {
            let mut record = load_record(&storage, &id)?;
            storage.put_turn(&id, sequence, &serde_json::to_vec(&turn)?)?;
            record.last_updated = now;
            store_record(&storage, &record)
        })
        .await
    }

    async fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        summarized_through: u64,
    ) -> Result<()> {
        let id = conversation_id.to_string();
        let summary = summary.to_string();
        let now = self.clock.now();

        self.blocking(move |storage| {
            let mut record = load_record(&storage, &id)?;
            record.summary = Some(summary);
            record.summarized_through = Some(summarized_through);
            record.last_updated = now;
            store_record(&storage, &record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, clock: Arc<ManualClock>) -> RedbConversationLog {
        let db = chatlink_storage::open_database(dir.join("chatlink.db")).unwrap();
        RedbConversationLog::new(db, clock).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_turns_are_listed_in_sequence_order() {
        let temp_dir = tempdir().unwrap();
        let log = open(temp_dir.path(), clock());
        let key = SessionKey::new("U1", "T1");
        let id = log.create_conversation(&key).await.unwrap();

        log.append_turn(&id, &Turn::assistant("second"), 2)
            .await
            .unwrap();
        log.append_turn(&id, &Turn::user("first"), 1).await.unwrap();
        log.append_turn(&id, &Turn::user("tenth"), 10).await.unwrap();

        let turns = log.list_turns(&id).await.unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "tenth"]);
        assert_eq!(turns[2].sequence, 10);
    }

    #[tokio::test]
    async fn test_find_today_respects_since() {
        let temp_dir = tempdir().unwrap();
        let clock = clock();
        let log = open(temp_dir.path(), clock.clone());
        let key = SessionKey::new("U1", "T1");
        let id = log.create_conversation(&key).await.unwrap();

        clock.advance(Duration::hours(2));
        log.append_turn(&id, &Turn::user("hi"), 1).await.unwrap();

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let found = log.find_today_conversation(&key, since).await.unwrap();
        assert_eq!(found.map(|record| record.id), Some(id));

        let later = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        assert!(log.find_today_conversation(&key, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_colon_bearing_keys_have_separate_latest_conversations() {
        let temp_dir = tempdir().unwrap();
        let log = open(temp_dir.path(), clock());
        let first = SessionKey::new("a", "b:c");
        let second = SessionKey::new("c:a", "b");
        log.create_conversation(&first).await.unwrap();

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(log.find_today_conversation(&second, since).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let key = SessionKey::new("U1", "T1");
        let id = {
            let log = open(temp_dir.path(), clock());
            let id = log.create_conversation(&key).await.unwrap();
            log.append_turn(&id, &Turn::user("hi"), 1).await.unwrap();
            log.update_summary(&id, "greeted", 1).await.unwrap();
            id
        };

        let log = open(temp_dir.path(), clock());
        let record = log
            .find_today_conversation(&key, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.summary.as_deref(), Some("greeted"));
        assert_eq!(record.summarized_through, Some(1));
    }

    #[tokio::test]
    async fn test_append_to_unknown_conversation_fails() {
        let temp_dir = tempdir().unwrap();
        let log = open(temp_dir.path(), clock());
        let result = log.append_turn("missing", &Turn::user("hi"), 1).await;
        assert!(result.is_err());
    }
}
