//! Per-agent database: `<data_dir>/<agent_name>.db`.

use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::migration::Schema;
use crate::plan::PlanStore;
use crate::session::SessionStore;

/// Plans and sessions of one agent, sharing a single connection.
#[derive(Clone)]
pub struct AgentStore {
    pub plans: PlanStore,
    pub sessions: SessionStore,
    path: Option<PathBuf>,
}

impl AgentStore {
    /// Open (creating and migrating) the database for `agent_name`.
    pub async fn open(data_dir: impl AsRef<Path>, agent_name: &str) -> StoreResult<Self> {
        let path = Self::path_for(data_dir.as_ref(), agent_name)?;
        let db = Database::open_and_migrate(path.clone(), Schema::Agent).await?;
        Ok(Self::from_db(db, Some(path)))
    }

    /// In-memory store, useful for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let db = Database::in_memory_with(Schema::Agent).await?;
        Ok(Self::from_db(db, None))
    }

    fn from_db(db: Database, path: Option<PathBuf>) -> Self {
        Self {
            plans: PlanStore::new(db.clone()),
            sessions: SessionStore::new(db),
            path,
        }
    }

    /// `<data_dir>/<agent_name>.db`; the name must be a plain file stem.
    pub fn path_for(data_dir: &Path, agent_name: &str) -> StoreResult<PathBuf> {
        let name = agent_name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StoreError::InvalidArgument(format!(
                "invalid agent name for database file: {agent_name:?}"
            )));
        }
        Ok(data_dir.join(format!("{name}.db")))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
