//! # rago-store
//!
//! SQLite persistence for rago.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  AgentStore  (<data_dir>/<agent>.db)            │
//! │    PlanStore · SessionStore                     │
//! │  MemoryStore (<data_dir>/memory.db)             │
//! │  DocumentStore (retrieval chunks + embeddings)  │
//! ├────────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)        │
//! │  Migrations (per schema, versioned)             │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Every save is a single upsert, so a reader never sees a half-written row.

pub mod agent;
pub mod db;
pub mod document;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod migration;
pub mod plan;
pub mod session;

use chrono::{DateTime, Utc};

// ── re-exports ───────────────────────────────────────────────────────

pub use agent::AgentStore;
pub use db::Database;
pub use document::{Chunk, Document, DocumentStore, content_id};
pub use embedding::{blob_to_embedding, cosine_similarity, embedding_to_blob};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryKind, MemoryRecord, MemoryStore};
pub use migration::Schema;
pub use plan::PlanStore;
pub use session::SessionStore;

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(entity: &'static str, id: &str, micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        reason: format!("timestamp out of range: {micros}"),
    })
}
