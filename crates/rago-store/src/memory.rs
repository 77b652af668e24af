//! Long-term memory records (`<data_dir>/memory.db`).
//!
//! Each record optionally carries an embedding so callers can rank by
//! cosine similarity; keyword search works without one.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::db::Database;
use crate::embedding::{blob_to_embedding, embedding_to_blob};
use crate::error::{StoreError, StoreResult};
use crate::{from_micros, to_micros};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Preference,
    /// Outcome of a completed task.
    Task,
    Pattern,
    Conversation,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Task => "task",
            Self::Pattern => "pattern",
            Self::Conversation => "conversation",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "task" => Ok(Self::Task),
            "pattern" => Ok(Self::Pattern),
            "conversation" => Ok(Self::Conversation),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown memory kind: {other}"
            ))),
        }
    }
}

/// A single memory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// 0.0 ..= 1.0
    pub importance: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(kind: MemoryKind, content: impl Into<String>) -> Self {
        let now = rago_kernel::now();
        Self {
            id: rago_kernel::new_id(),
            session_id: None,
            kind,
            content: content.into(),
            embedding: None,
            importance: 0.5,
            metadata: Map::new(),
            access_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

const COLUMNS: &str = "id, session_id, kind, content, embedding, importance, metadata, \
                       access_count, created_at, updated_at";

type RawRow = (
    String,
    Option<String>,
    String,
    String,
    Option<Vec<u8>>,
    f64,
    String,
    i64,
    i64,
    i64,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_record(raw: RawRow) -> StoreResult<MemoryRecord> {
    let (id, session_id, kind, content, embedding, importance, metadata, access_count, created, updated) =
        raw;
    Ok(MemoryRecord {
        kind: kind.parse()?,
        embedding: embedding.as_deref().map(blob_to_embedding),
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_micros("memory", &id, created)?,
        updated_at: from_micros("memory", &id, updated)?,
        id,
        session_id,
        content,
        importance,
        access_count,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, record), fields(memory_id = %record.id, kind = %record.kind))]
    pub async fn add(&self, record: &MemoryRecord) -> StoreResult<()> {
        let params = (
            record.id.clone(),
            record.session_id.clone(),
            record.kind.as_str(),
            record.content.clone(),
            record.embedding.as_deref().map(embedding_to_blob),
            record.importance,
            serde_json::to_string(&record.metadata)?,
            record.access_count,
            to_micros(record.created_at),
            to_micros(record.updated_at),
        );
        self.db
            .execute(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO memories ({COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                    ),
                    params,
                )?;
                Ok(())
            })
            .await
    }

    /// Fetch one memory, bumping its access count.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<MemoryRecord> {
        let id = id.to_string();
        let raw = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE memories SET access_count = access_count + 1 WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
                    rusqlite::params![id],
                    read_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "memory",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await?;
        into_record(raw)
    }

    /// Newest first with pagination.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: usize, offset: usize) -> StoreResult<Vec<MemoryRecord>> {
        let (limit, offset) = (limit as i64, offset as i64);
        self.query(
            format!("SELECT {COLUMNS} FROM memories ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"),
            vec![limit.into(), offset.into()],
        )
        .await
    }

    /// Case-insensitive substring match on content, most important first.
    #[instrument(skip(self))]
    pub async fn search_keyword(&self, query: &str, limit: usize) -> StoreResult<Vec<MemoryRecord>> {
        let pattern = format!("%{}%", query.trim());
        self.query(
            format!(
                "SELECT {COLUMNS} FROM memories WHERE content LIKE ?1 \
                 ORDER BY importance DESC, created_at DESC LIMIT ?2"
            ),
            vec![pattern.into(), (limit as i64).into()],
        )
        .await
    }

    /// Every memory that has an embedding, for similarity ranking.
    pub async fn all_with_embeddings(&self) -> StoreResult<Vec<MemoryRecord>> {
        self.query(
            format!("SELECT {COLUMNS} FROM memories WHERE embedding IS NOT NULL"),
            Vec::new(),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute("DELETE FROM memories WHERE id = ?1", rusqlite::params![id])?;
                if n == 0 {
                    return Err(StoreError::NotFound { entity: "memory", id });
                }
                Ok(())
            })
            .await
    }

    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM memories", [], |r| r.get(0))?))
            .await
    }

    async fn query(
        &self,
        sql: String,
        params: Vec<rusqlite::types::Value>,
    ) -> StoreResult<Vec<MemoryRecord>> {
        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Schema;

    async fn store() -> MemoryStore {
        MemoryStore::new(Database::in_memory_with(Schema::Memory).await.unwrap())
    }

    #[tokio::test]
    async fn add_get_and_access_count() {
        let store = store().await;
        let record = MemoryRecord::new(MemoryKind::Preference, "prefers dark mode")
            .with_importance(0.9)
            .with_embedding(vec![1.0, 0.0]);
        store.add(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap();
        assert_eq!(loaded.content, "prefers dark mode");
        assert_eq!(loaded.kind, MemoryKind::Preference);
        assert_eq!(loaded.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(loaded.access_count, 1);
    }

    #[tokio::test]
    async fn keyword_search_ranks_by_importance() {
        let store = store().await;
        store
            .add(&MemoryRecord::new(MemoryKind::Fact, "Alice likes tea").with_importance(0.2))
            .await
            .unwrap();
        store
            .add(&MemoryRecord::new(MemoryKind::Fact, "alice works at acme").with_importance(0.8))
            .await
            .unwrap();
        store
            .add(&MemoryRecord::new(MemoryKind::Fact, "Bob likes coffee"))
            .await
            .unwrap();

        let hits = store.search_keyword("alice", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "alice works at acme");
    }

    #[tokio::test]
    async fn list_paginates_and_delete_removes() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = MemoryRecord::new(MemoryKind::Task, format!("task {i}"));
            ids.push(record.id.clone());
            store.add(&record).await.unwrap();
        }
        assert_eq!(store.list(2, 0).await.unwrap().len(), 2);
        assert_eq!(store.list(10, 3).await.unwrap().len(), 2);
        assert!(store.all_with_embeddings().await.unwrap().is_empty());

        store.delete(&ids[0]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 4);
        assert!(store.delete(&ids[0]).await.unwrap_err().is_not_found());
    }
}
