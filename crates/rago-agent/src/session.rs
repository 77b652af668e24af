//! Conversational state.
//!
//! [`SessionManager`] keeps live sessions in memory, each behind its own
//! reader/writer lock, and optionally mirrors them to a [`SessionStore`].
//! Locks are never held across a store call: saves work on a snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rago_kernel::{Message, Session};
use rago_store::SessionStore;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Metadata key recording how many leading messages the summary covers.
pub const SUMMARIZED_THROUGH: &str = "summarized_through";

type Shared = Arc<RwLock<Session>>;

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Shared>>,
    store: Option<SessionStore>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: SessionStore) -> Self {
        Self {
            sessions: RwLock::default(),
            store: Some(store),
        }
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    fn handle(&self, id: &str) -> Result<Shared> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::input(format!("unknown session: {id}")))
    }

    fn insert(&self, session: Session) -> Session {
        let snapshot = session.clone();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), Arc::new(RwLock::new(session)));
        snapshot
    }

    fn write<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let handle = self.handle(id)?;
        let mut session = handle.write().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut session))
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let handle = self.handle(id)?;
        let session = handle.read().unwrap_or_else(|e| e.into_inner());
        Ok(f(&session))
    }

    /// New empty session with a fresh id.
    pub fn create(&self, agent_id: &str) -> Session {
        let session = self.insert(Session::new(agent_id));
        debug!(session_id = %session.id, agent = agent_id, "session created");
        session
    }

    /// Snapshot of a live session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.read(id, Session::clone).ok()
    }

    /// Live session, else the persisted copy, else a new session. A new
    /// session keeps the requested id so a later run can resume it.
    pub async fn load_or_create(&self, id: Option<&str>, agent_id: &str) -> Result<Session> {
        let Some(id) = id else {
            return Ok(self.create(agent_id));
        };
        if let Some(live) = self.get(id) {
            return Ok(live);
        }
        if let Some(store) = &self.store {
            match store.get(id).await {
                Ok(session) => {
                    debug!(session_id = id, messages = session.messages.len(), "session loaded");
                    return Ok(self.insert(session));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(session_id = id, error = %e, "session load failed, starting fresh"),
            }
        }
        Ok(self.insert(Session::with_id(id, agent_id)))
    }

    /// Drop a session from memory and, when persisted, from the store.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if let Some(store) = &self.store {
            match store.delete(id).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Live sessions, most recently updated first.
    pub fn list(&self) -> Vec<Session> {
        let handles: Vec<Shared> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut sessions: Vec<Session> = handles
            .iter()
            .map(|h| h.read().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn add_message(&self, id: &str, message: Message) -> Result<()> {
        self.write(id, |s| s.add_message(message))
    }

    /// Record that the conversation moved from one agent to another.
    pub fn add_handoff_message(&self, id: &str, from: &str, to: &str) -> Result<()> {
        self.write(id, |s| {
            s.add_message(Message::system(format!("[handoff] {from} transferred the conversation to {to}")));
            s.agent_id = to.to_owned();
        })
    }

    pub fn set_context(&self, id: &str, key: &str, value: Value) -> Result<()> {
        self.write(id, |s| s.set_context(key, value))
    }

    /// Replace the running summary, which covers the first `through` messages.
    pub fn set_summary(&self, id: &str, summary: String, through: usize) -> Result<()> {
        self.write(id, |s| {
            s.summary = Some(summary);
            s.metadata.insert(SUMMARIZED_THROUGH.into(), Value::from(through));
            s.touch();
        })
    }

    /// Forget history, summary and context; id and metadata survive.
    pub fn clear(&self, id: &str) -> Result<()> {
        self.write(id, |s| {
            s.messages.clear();
            s.context.clear();
            s.summary = None;
            s.metadata.remove(SUMMARIZED_THROUGH);
            s.touch();
        })
    }

    pub fn get_last_n_messages(&self, id: &str, n: usize) -> Result<Vec<Message>> {
        self.read(id, |s| s.last_n_messages(n))
    }

    pub fn to_messages(&self, id: &str) -> Result<Vec<Message>> {
        self.read(id, |s| s.messages.clone())
    }

    /// Write a snapshot to the store; a no-op without one.
    pub async fn save(&self, id: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.read(id, Session::clone)?;
        store.save(&snapshot).await?;
        debug!(session_id = id, messages = snapshot.messages.len(), "session saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rago_kernel::Role;
    use rago_store::AgentStore;
    use serde_json::json;

    use super::*;

    #[test]
    fn messages_append_in_order() {
        let manager = SessionManager::new();
        let session = manager.create("assistant");
        for i in 0..4 {
            manager.add_message(&session.id, Message::user(format!("m{i}"))).unwrap();
        }
        let last = manager.get_last_n_messages(&session.id, 2).unwrap();
        assert_eq!(last.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m2", "m3"]);
        assert_eq!(manager.get_last_n_messages(&session.id, 10).unwrap().len(), 4);

        let stored = manager.get(&session.id).unwrap();
        assert!(stored.updated_at >= stored.created_at);
        assert!(manager.add_message("missing", Message::user("x")).is_err());
    }

    #[test]
    fn handoff_and_clear() {
        let manager = SessionManager::new();
        let id = manager.create("triage").id;
        manager.set_context(&id, "tenant", json!("acme")).unwrap();
        manager.add_handoff_message(&id, "triage", "billing").unwrap();

        let session = manager.get(&id).unwrap();
        assert_eq!(session.agent_id, "billing");
        assert_eq!(session.messages[0].role, Role::System);
        assert!(session.messages[0].content.contains("billing"));

        manager.clear(&id).unwrap();
        let session = manager.get(&id).unwrap();
        assert!(session.messages.is_empty());
        assert!(session.context.is_empty());
    }

    #[tokio::test]
    async fn persisted_sessions_survive_a_new_manager() {
        let store = AgentStore::in_memory().await.unwrap();
        let manager = SessionManager::with_store(store.sessions.clone());
        let id = manager.create("assistant").id;
        manager.add_message(&id, Message::user("hello")).unwrap();
        manager.save(&id).await.unwrap();

        let fresh = SessionManager::with_store(store.sessions.clone());
        let loaded = fresh.load_or_create(Some(&id), "assistant").await.unwrap();
        assert_eq!(loaded.messages.len(), 1);

        let created = fresh.load_or_create(Some("unknown-id"), "assistant").await.unwrap();
        assert_eq!(created.id, "unknown-id");
        assert!(created.messages.is_empty());

        assert!(fresh.delete(&id).await.unwrap());
        assert!(store.sessions.get(&id).await.unwrap_err().is_not_found());
    }

    #[test]
    fn list_is_most_recent_first() {
        let manager = SessionManager::new();
        let a = manager.create("x").id;
        let b = manager.create("x").id;
        std::thread::sleep(std::time::Duration::from_millis(2));
        manager.add_message(&a, Message::user("bump")).unwrap();
        let ids: Vec<String> = manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, [a, b]);
    }
}
