//! Plan persistence.
//!
//! Steps are stored as a JSON text blob next to indexed scalar columns.

use rago_kernel::{Plan, PlanStatus, Step};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::{from_micros, to_micros};

const COLUMNS: &str =
    "id, goal, session_id, steps, status, reasoning, error, created_at, updated_at";

/// Raw row as read from SQLite.
struct PlanRow {
    id: String,
    goal: String,
    session_id: String,
    steps: String,
    status: String,
    reasoning: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl PlanRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            goal: row.get(1)?,
            session_id: row.get(2)?,
            steps: row.get(3)?,
            status: row.get(4)?,
            reasoning: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_plan(self) -> StoreResult<Plan> {
        let steps: Vec<Step> = serde_json::from_str(&self.steps)?;
        let status: PlanStatus = self.status.parse().map_err(|e| StoreError::Corrupt {
            entity: "plan",
            id: self.id.clone(),
            reason: format!("{e}"),
        })?;

        let mut plan = Plan::new(self.goal, self.session_id, steps);
        plan.created_at = from_micros("plan", &self.id, self.created_at)?;
        plan.updated_at = from_micros("plan", &self.id, self.updated_at)?;
        plan.id = self.id;
        plan.status = status;
        plan.reasoning = self.reasoning;
        plan.error = self.error;
        Ok(plan)
    }
}

/// CRUD over the `plans` table.
#[derive(Clone)]
pub struct PlanStore {
    db: Database,
}

impl PlanStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a plan in one statement.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id, status = %plan.status))]
    pub async fn save(&self, plan: &Plan) -> StoreResult<()> {
        let steps = serde_json::to_string(plan.steps())?;
        let params = (
            plan.id.clone(),
            plan.goal.clone(),
            plan.session_id.clone(),
            steps,
            plan.status.as_str(),
            plan.reasoning.clone(),
            plan.error.clone(),
            to_micros(plan.created_at),
            to_micros(plan.updated_at),
        );

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO plans (id, goal, session_id, steps, status, reasoning, error, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET \
                        goal = excluded.goal, session_id = excluded.session_id, steps = excluded.steps, \
                        status = excluded.status, reasoning = excluded.reasoning, error = excluded.error, \
                        updated_at = excluded.updated_at",
                    params,
                )?;
                Ok(())
            })
            .await?;

        debug!("plan saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Plan> {
        let id = id.to_string();
        let row = self
            .db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM plans WHERE id = ?1"),
                    rusqlite::params![id],
                    PlanRow::from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "plan",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await?;
        row.into_plan()
    }

    /// Most recent first, optionally restricted to one session.
    #[instrument(skip(self))]
    pub async fn list(&self, session_id: Option<&str>, limit: usize) -> StoreResult<Vec<Plan>> {
        let session_id = session_id.map(str::to_string);
        let limit = limit as i64;
        let rows = self
            .db
            .execute(move |conn| {
                let rows = match session_id {
                    Some(sid) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {COLUMNS} FROM plans WHERE session_id = ?1 \
                             ORDER BY created_at DESC, id DESC LIMIT ?2"
                        ))?;
                        stmt.query_map(rusqlite::params![sid, limit], PlanRow::from_row)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {COLUMNS} FROM plans ORDER BY created_at DESC, id DESC LIMIT ?1"
                        ))?;
                        stmt.query_map(rusqlite::params![limit], PlanRow::from_row)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(PlanRow::into_plan).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute("DELETE FROM plans WHERE id = ?1", rusqlite::params![id])?;
                if n == 0 {
                    return Err(StoreError::NotFound { entity: "plan", id });
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Schema;
    use serde_json::{Map, json};

    async fn store() -> PlanStore {
        PlanStore::new(Database::in_memory_with(Schema::Agent).await.unwrap())
    }

    fn sample(session: &str) -> Plan {
        let mut args = Map::new();
        args.insert("query".into(), json!("rust"));
        let a = Step::new("search", "rag_query", args);
        let b = Step::new("answer", "llm", Map::new()).depends_on([a.id.clone()]);
        Plan::new("learn rust", session, vec![a, b]).with_reasoning("search then answer")
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = store().await;
        let plan = sample("s1");
        store.save(&plan).await.unwrap();

        let loaded = store.get(&plan.id).await.unwrap();
        assert_eq!(loaded, plan);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = store().await;
        let mut plan = sample("s1");
        store.save(&plan).await.unwrap();

        plan.start().unwrap();
        plan.step_mut(0).unwrap().start().unwrap();
        store.save(&plan).await.unwrap();

        let loaded = store.get(&plan.id).await.unwrap();
        assert_eq!(loaded.status, PlanStatus::Running);
        assert_eq!(store.list(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_is_most_recent_first_and_filters_by_session() {
        let store = store().await;
        let first = sample("s1");
        let second = sample("s2");
        let third = sample("s1");
        for plan in [&first, &second, &third] {
            store.save(plan).await.unwrap();
        }

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, third.id);

        let s1 = store.list(Some("s1"), 10).await.unwrap();
        assert_eq!(s1.len(), 2);
        assert!(s1.iter().all(|p| p.session_id == "s1"));

        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let store = store().await;
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete("nope").await.unwrap_err().is_not_found());
    }
}
