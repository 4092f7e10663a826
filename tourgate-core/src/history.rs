//! Conversation history persistence.
//!
//! History is an append-only side channel: the orchestrator hands each
//! exchange to a spawned task and never waits for it. Store errors are
//! logged there and otherwise ignored.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::conversation::{Role, Turn};

/// Session key used when a request carries no session id.
pub const DEFAULT_SESSION: &str = "default";

/// Sessions kept by [`InMemoryHistoryStore`] unless configured otherwise.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// History store failures.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One persisted turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub caller_id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(caller_id: &str, session_id: Option<&str>, turn: &Turn) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            session_id: session_id.unwrap_or(DEFAULT_SESSION).to_string(),
            role: turn.role,
            content: turn.content.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Append interface of the conversation history store.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one turn to the caller's session.
    async fn append_turn(
        &self,
        caller_id: &str,
        session_id: Option<&str>,
        turn: &Turn,
    ) -> Result<(), HistoryError>;
}

// ============================================================================
// In-memory store
// ============================================================================

type SessionKey = (String, String);

struct Session {
    turns: VecDeque<HistoryRecord>,
    /// Append sequence number of the latest turn.
    last_append: u64,
}

#[derive(Default)]
struct Sessions {
    map: HashMap<SessionKey, Session>,
    next_seq: u64,
}

/// Bounded in-memory history.
///
/// Both dimensions are capped: each session keeps its latest
/// `max_turns_per_session` turns, and once `max_sessions` sessions exist,
/// starting a new one evicts the session with the oldest last append.
pub struct InMemoryHistoryStore {
    sessions: Mutex<Sessions>,
    max_turns_per_session: usize,
    max_sessions: usize,
}

impl InMemoryHistoryStore {
    pub fn new(max_turns_per_session: usize) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            max_turns_per_session: max_turns_per_session.max(1),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Cap the number of sessions kept at once.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// Number of sessions currently held.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map.len()
    }

    /// Stored records for one session, oldest first.
    pub fn records(&self, caller_id: &str, session_id: Option<&str>) -> Vec<HistoryRecord> {
        let key = (
            caller_id.to_string(),
            session_id.unwrap_or(DEFAULT_SESSION).to_string(),
        );
        self.sessions
            .lock()
            .map
            .get(&key)
            .map(|session| session.turns.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Sessions {
    /// Drop the least recently appended session.
    fn evict_oldest(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, session)| session.last_append)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.map.remove(&key);
            debug!(caller = %key.0, session = %key.1, "Evicted history session");
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append_turn(
        &self,
        caller_id: &str,
        session_id: Option<&str>,
        turn: &Turn,
    ) -> Result<(), HistoryError> {
        let record = HistoryRecord::new(caller_id, session_id, turn);
        let key = (record.caller_id.clone(), record.session_id.clone());

        let mut sessions = self.sessions.lock();
        if !sessions.map.contains_key(&key) && sessions.map.len() >= self.max_sessions {
            sessions.evict_oldest();
        }

        let seq = sessions.next_seq;
        sessions.next_seq += 1;
        let session = sessions.map.entry(key).or_insert_with(|| Session {
            turns: VecDeque::new(),
            last_append: seq,
        });
        session.last_append = seq;
        session.turns.push_back(record);
        while session.turns.len() > self.max_turns_per_session {
            session.turns.pop_front();
        }
        Ok(())
    }
}

// ============================================================================
// JSON Lines store
// ============================================================================

/// Appends one JSON object per turn to a file.
pub struct JsonlHistoryStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlHistoryStore {
    /// Open (or create) the history file in append mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append_turn(
        &self,
        caller_id: &str,
        session_id: Option<&str>,
        turn: &Turn,
    ) -> Result<(), HistoryError> {
        let record = HistoryRecord::new(caller_id, session_id, turn);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        // Whole-line writes under the lock keep concurrent appends from interleaving
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_is_bounded_per_session() {
        let store = InMemoryHistoryStore::new(2);
        store.append_turn("alice", Some("s1"), &Turn::user("one")).await.unwrap();
        store.append_turn("alice", Some("s1"), &Turn::assistant("two")).await.unwrap();
        store.append_turn("alice", Some("s1"), &Turn::user("three")).await.unwrap();
        store.append_turn("alice", None, &Turn::user("other session")).await.unwrap();

        let records = store.records("alice", Some("s1"));
        let contents: Vec<_> = records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["two", "three"]);
        assert_eq!(store.records("alice", None)[0].session_id, DEFAULT_SESSION);
    }

    #[tokio::test]
    async fn test_in_memory_store_caps_session_count() {
        let store = InMemoryHistoryStore::new(4).with_max_sessions(2);
        store.append_turn("alice", None, &Turn::user("hi")).await.unwrap();
        store.append_turn("bob", None, &Turn::user("hello")).await.unwrap();
        // alice is now the most recent, so bob goes first
        store.append_turn("alice", None, &Turn::user("again")).await.unwrap();
        store.append_turn("carol", None, &Turn::user("xin chào")).await.unwrap();

        assert_eq!(store.session_count(), 2);
        assert!(store.records("bob", None).is_empty());
        assert_eq!(store.records("alice", None).len(), 2);
        assert_eq!(store.records("carol", None).len(), 1);

        for i in 0..100 {
            let visitor = format!("198.51.100.{i}");
            store.append_turn(&visitor, None, &Turn::user("?")).await.unwrap();
        }
        assert_eq!(store.session_count(), 2);
        assert_eq!(store.records("198.51.100.99", None).len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let store = JsonlHistoryStore::open(&path).await.unwrap();
        store.append_turn("bob", Some("trip"), &Turn::user("Hue or Hoi An?")).await.unwrap();
        store.append_turn("bob", Some("trip"), &Turn::assistant("Both!")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<HistoryRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].caller_id, "bob");
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[1].content, "Both!");
        assert!(contents.contains("\"sessionId\":\"trip\""));
    }

    #[tokio::test]
    async fn test_jsonl_store_open_fails_for_missing_directory() {
        let result = JsonlHistoryStore::open("/nonexistent-dir/history.jsonl").await;
        assert!(matches!(result, Err(HistoryError::Io(_))));
    }
}
