//! Document and chunk storage backing retrieval.
//!
//! Documents are keyed by the SHA-256 of their content, so re-ingesting the
//! same text replaces the earlier copy instead of duplicating it.

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::embedding::{blob_to_embedding, embedding_to_blob};
use crate::error::{StoreError, StoreResult};
use crate::{from_micros, to_micros};

/// Hex SHA-256 of `content`.
pub fn content_id(content: &str) -> String {
    let hash = digest::digest(&digest::SHA256, content.as_bytes());
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// File path, URL or caller-supplied label.
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Clone)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a document and replace all of its chunks in one transaction.
    #[instrument(skip(self, document, chunks), fields(document_id = %document.id, chunks = chunks.len()))]
    pub async fn put(&self, document: &Document, chunks: Vec<Chunk>) -> StoreResult<()> {
        if chunks.iter().any(|c| c.document_id != document.id) {
            return Err(StoreError::InvalidArgument(
                "chunk belongs to a different document".into(),
            ));
        }
        let doc = (
            document.id.clone(),
            document.source.clone(),
            serde_json::to_string(&document.metadata)?,
            chunks.len() as i64,
            to_micros(document.created_at),
        );

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM chunks WHERE document_id = ?1", rusqlite::params![doc.0])?;
                tx.execute(
                    "INSERT OR REPLACE INTO documents (id, source, metadata, chunk_count, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    doc,
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO chunks (id, document_id, ordinal, content, embedding) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for chunk in &chunks {
                        stmt.execute(rusqlite::params![
                            chunk.id,
                            chunk.document_id,
                            chunk.ordinal as i64,
                            chunk.content,
                            chunk.embedding.as_deref().map(embedding_to_blob),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!("document stored");
        Ok(())
    }

    /// Newest first.
    pub async fn list_documents(&self) -> StoreResult<Vec<Document>> {
        let rows = self
            .db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, source, metadata, chunk_count, created_at FROM documents \
                     ORDER BY created_at DESC, id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, source, metadata, chunk_count, created)| {
                Ok(Document {
                    metadata: serde_json::from_str(&metadata)?,
                    created_at: from_micros("document", &id, created)?,
                    chunk_count: chunk_count.max(0) as usize,
                    id,
                    source,
                })
            })
            .collect()
    }

    /// All chunks in document order.
    pub async fn all_chunks(&self) -> StoreResult<Vec<Chunk>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, document_id, ordinal, content, embedding FROM chunks \
                     ORDER BY document_id, ordinal",
                )?;
                let chunks = stmt
                    .query_map([], |row| {
                        let embedding: Option<Vec<u8>> = row.get(4)?;
                        Ok(Chunk {
                            id: row.get(0)?,
                            document_id: row.get(1)?,
                            ordinal: row.get::<_, i64>(2)?.max(0) as usize,
                            content: row.get(3)?,
                            embedding: embedding.as_deref().map(blob_to_embedding),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(chunks)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute("DELETE FROM documents WHERE id = ?1", rusqlite::params![id])?;
                if n == 0 {
                    return Err(StoreError::NotFound {
                        entity: "document",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Remove every document and chunk.
    pub async fn reset(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute_batch("DELETE FROM chunks; DELETE FROM documents;")?;
                Ok(())
            })
            .await
    }

    pub async fn count(&self) -> StoreResult<(i64, i64)> {
        self.db
            .execute(|conn| {
                let docs = conn.query_row("SELECT count(*) FROM documents", [], |r| r.get(0))?;
                let chunks = conn.query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))?;
                Ok((docs, chunks))
            })
            .await
    }
}
