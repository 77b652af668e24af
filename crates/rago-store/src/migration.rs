//! Schema migrations.
//!
//! rago keeps one SQLite file per concern (agent, memory, rag), so each
//! [`Schema`] owns its own ordered migration list. The applied version is
//! tracked in a `_migrations` table, making migrations idempotent.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Strictly increasing within its schema.
    version: u32,
    description: &'static str,
    /// May contain multiple statements.
    sql: &'static str,
}

/// The database files rago manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `<data_dir>/<agent>.db`: plans and sessions.
    Agent,
    /// `<data_dir>/memory.db`: long-term memories.
    Memory,
    /// Document and chunk store backing retrieval.
    Rag,
}

impl Schema {
    fn migrations(self) -> &'static [Migration] {
        match self {
            Self::Agent => AGENT_MIGRATIONS,
            Self::Memory => MEMORY_MIGRATIONS,
            Self::Rag => RAG_MIGRATIONS,
        }
    }

    /// Latest version defined for this schema.
    pub fn latest_version(self) -> u32 {
        self.migrations().last().map(|m| m.version).unwrap_or(0)
    }
}

static AGENT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "plans and sessions",
        sql: r#"
            CREATE TABLE plans (
                id         TEXT PRIMARY KEY,
                goal       TEXT NOT NULL,
                session_id TEXT NOT NULL,
                steps      TEXT NOT NULL,
                status     TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
                reasoning  TEXT,
                error      TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX idx_plans_session ON plans(session_id);
            CREATE INDEX idx_plans_status ON plans(status);
            CREATE INDEX idx_plans_created ON plans(created_at);

            CREATE TABLE sessions (
                id         TEXT PRIMARY KEY,
                agent_id   TEXT NOT NULL,
                messages   TEXT NOT NULL,
                summary    TEXT,
                context    TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "session recency index",
        sql: "CREATE INDEX idx_sessions_updated ON sessions(updated_at);",
    },
];

static MEMORY_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "memories",
    sql: r#"
        CREATE TABLE memories (
            id           TEXT PRIMARY KEY,
            session_id   TEXT,
            kind         TEXT NOT NULL CHECK(kind IN ('fact','preference','task','pattern','conversation')),
            content      TEXT NOT NULL,
            embedding    BLOB,
            importance   REAL NOT NULL DEFAULT 0.5,
            metadata     TEXT NOT NULL DEFAULT '{}',
            access_count INTEGER NOT NULL DEFAULT 0,
            created_at   INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL
        );
        CREATE INDEX idx_memories_kind ON memories(kind);
        CREATE INDEX idx_memories_session ON memories(session_id);
        CREATE INDEX idx_memories_created ON memories(created_at);
    "#,
}];

static RAG_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "documents and chunks",
    sql: r#"
        CREATE TABLE documents (
            id          TEXT PRIMARY KEY,
            source      TEXT NOT NULL,
            metadata    TEXT NOT NULL DEFAULT '{}',
            chunk_count INTEGER NOT NULL,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX idx_documents_created ON documents(created_at);

        CREATE TABLE chunks (
            id          TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            ordinal     INTEGER NOT NULL,
            content     TEXT NOT NULL,
            embedding   BLOB
        );
        CREATE INDEX idx_chunks_document ON chunks(document_id);
    "#,
}];

/// Apply every pending migration of `schema`.
pub fn run_all(conn: &Connection, schema: Schema) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = schema
        .migrations()
        .iter()
        .filter(|m| m.version > current)
        .collect();

    if pending.is_empty() {
        debug!(?schema, current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(?schema, current_version = current, pending = pending.len(), "running pending migrations");
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply one migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(version = migration.version, description = migration.description, "applying migration");

    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| fail(format!("SQL execution failed: {e}")))?;
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| fail(format!("failed to record migration: {e}")))?;
        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| fail(format!("failed to commit: {e}")))?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered() {
        for schema in [Schema::Agent, Schema::Memory, Schema::Rag] {
            for window in schema.migrations().windows(2) {
                assert!(window[1].version > window[0].version);
            }
        }
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn, Schema::Agent).unwrap();
        run_all(&conn, Schema::Agent).unwrap();
        assert_eq!(current_version(&conn).unwrap(), Schema::Agent.latest_version());
    }

    #[test]
    fn plan_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn, Schema::Agent).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='plans'")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        for expected in ["idx_plans_session", "idx_plans_status", "idx_plans_created"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn status_check_constraint_rejects_unknown_values() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn, Schema::Agent).unwrap();
        let err = conn.execute(
            "INSERT INTO plans (id, goal, session_id, steps, status, created_at, updated_at) \
             VALUES ('p', 'g', 's', '[]', 'bogus', 0, 0)",
            [],
        );
        assert!(err.is_err());
    }
}
