//! Chat request parsing and conversation normalization.
//!
//! Inbound bodies are parsed leniently: anything that is not a well-formed
//! chat request degrades to an empty conversation instead of an error, so the
//! transport layer never has to produce an error response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Parse a role name, accepting only `user` and `assistant`
    /// (case-insensitive, surrounding whitespace ignored).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("user") {
            Some(Role::User)
        } else if raw.eq_ignore_ascii_case("assistant") {
            Some(Role::Assistant)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered, bounded list of conversation turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Build a conversation from turns, keeping only the last `max_turns`.
    pub fn new(mut turns: Vec<Turn>, max_turns: usize) -> Self {
        if turns.len() > max_turns {
            turns.drain(..turns.len() - max_turns);
        }
        Self { turns }
    }

    /// Normalize a JSON `messages` array.
    ///
    /// Non-array input yields an empty conversation. Entries are kept only
    /// when `role` is `user` or `assistant` and `content` is a string.
    pub fn from_value(messages: &Value, max_turns: usize) -> Self {
        let Some(items) = messages.as_array() else {
            return Self::default();
        };

        let turns = items
            .iter()
            .filter_map(|item| {
                let role = Role::parse(item.get("role")?.as_str()?)?;
                let content = item.get("content")?.as_str()?;
                Some(Turn {
                    role,
                    content: content.to_string(),
                })
            })
            .collect();

        Self::new(turns, max_turns)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `k` turns (fewer if the conversation is shorter).
    pub fn tail(&self, k: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(k);
        &self.turns[start..]
    }

    /// Content of the most recent user turn with non-blank text.
    pub fn latest_user_prompt(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User && !t.content.trim().is_empty())
            .map(|t| t.content.as_str())
    }
}

/// A normalized inbound chat request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub conversation: Conversation,
    pub caller_id: Option<String>,
    pub session_id: Option<String>,
}

impl ChatRequest {
    /// Normalize a parsed JSON body. A non-object body yields an empty request.
    pub fn from_value(body: &Value, max_turns: usize) -> Self {
        let Some(obj) = body.as_object() else {
            return Self::default();
        };

        Self {
            conversation: obj
                .get("messages")
                .map(|m| Conversation::from_value(m, max_turns))
                .unwrap_or_default(),
            caller_id: obj.get("callerId").and_then(identifier),
            session_id: obj.get("sessionId").and_then(identifier),
        }
    }

    /// Normalize raw body bytes. Malformed JSON yields an empty request.
    pub fn from_slice(body: &[u8], max_turns: usize) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Self::from_value(&value, max_turns),
            Err(e) => {
                tracing::debug!(error = %e, "Malformed chat body, treating as empty conversation");
                Self::default()
            }
        }
    }
}

/// Accept string identifiers and stringify numeric ones; blank strings are absent.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
