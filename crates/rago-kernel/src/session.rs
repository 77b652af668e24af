//! Conversation sessions.
//!
//! A [`Session`] is plain data. Locking lives in the agent crate's session
//! manager; persistence lives in `rago-store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::Message;

/// A conversation identified by an opaque id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Agent that owns the conversation.
    pub agent_id: String,
    /// Append-only history.
    pub messages: Vec<Message>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Lossy compaction of a prefix of `messages`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session with a fresh id.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::with_id(crate::new_id(), agent_id)
    }

    /// Create an empty session with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = crate::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            messages: Vec::new(),
            context: Map::new(),
            metadata: Map::new(),
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
        self.touch();
    }

    /// Copy of the last `n` messages, oldest first.
    pub fn last_n_messages(&self, n: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    /// Bump `updated_at`, never moving it before `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = crate::now().max(self.created_at);
    }
}
