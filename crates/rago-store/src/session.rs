//! Session persistence.
//!
//! Messages, context and metadata are stored as JSON text blobs; the whole
//! session is written with one upsert.

use rago_kernel::{Message, Session};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::{from_micros, to_micros};

const COLUMNS: &str = "id, agent_id, messages, summary, context, metadata, created_at, updated_at";

struct SessionRow {
    id: String,
    agent_id: String,
    messages: String,
    summary: Option<String>,
    context: String,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            messages: row.get(2)?,
            summary: row.get(3)?,
            context: row.get(4)?,
            metadata: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_session(self) -> StoreResult<Session> {
        let messages: Vec<Message> = serde_json::from_str(&self.messages)?;
        let context: Map<String, Value> = serde_json::from_str(&self.context)?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)?;
        Ok(Session {
            created_at: from_micros("session", &self.id, self.created_at)?,
            updated_at: from_micros("session", &self.id, self.updated_at)?,
            id: self.id,
            agent_id: self.agent_id,
            messages,
            context,
            metadata,
            summary: self.summary,
        })
    }
}

/// CRUD over the `sessions` table.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, messages = session.messages.len()))]
    pub async fn save(&self, session: &Session) -> StoreResult<()> {
        let params = (
            session.id.clone(),
            session.agent_id.clone(),
            serde_json::to_string(&session.messages)?,
            session.summary.clone(),
            serde_json::to_string(&session.context)?,
            serde_json::to_string(&session.metadata)?,
            to_micros(session.created_at),
            to_micros(session.updated_at),
        );

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, agent_id, messages, summary, context, metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(id) DO UPDATE SET \
                        agent_id = excluded.agent_id, messages = excluded.messages, \
                        summary = excluded.summary, context = excluded.context, \
                        metadata = excluded.metadata, updated_at = excluded.updated_at",
                    params,
                )?;
                Ok(())
            })
            .await?;

        debug!("session saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Session> {
        let id = id.to_string();
        let row = self
            .db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"),
                    rusqlite::params![id],
                    SessionRow::from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "session",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await?;
        row.into_session()
    }

    /// Most recently updated first.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: usize) -> StoreResult<Vec<Session>> {
        let limit = limit as i64;
        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM sessions ORDER BY updated_at DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], SessionRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
                if n == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }
}
