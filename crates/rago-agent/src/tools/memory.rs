//! Long-term memory.
//!
//! [`SqliteMemoryService`] persists to `<data_dir>/memory.db`. With an
//! embedder configured, search ranks by cosine similarity; otherwise it falls
//! back to keyword matching.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rago_kernel::ToolDefinition;
use rago_store::{Database, MemoryKind, MemoryRecord, MemoryStore, Schema, cosine_similarity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::llm::Embedder;
use crate::tools::{arg_str, arg_usize, object_schema};

/// Goal prefixes that are written to memory directly, without the
/// worthiness heuristic.
pub const DIRECT_MEMORY_PREFIXES: &[&str] = &[
    "remember:",
    "save to memory",
    "my favorite",
    "i prefer",
    "preference is",
];

/// Everything known about a finished task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub goal: String,
    pub result: String,
    #[serde(default)]
    pub execution_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
}

const INJECT_LIMIT: usize = 5;

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn add(&self, record: MemoryRecord) -> Result<String>;

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredMemory>>;

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<MemoryRecord>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Relevant memories for `query`, rendered for prompt injection.
    /// Memories written in `session_id` rank ahead of the rest.
    async fn retrieve_and_inject(
        &self,
        query: &str,
        session_id: Option<&str>,
    ) -> Result<(String, Vec<MemoryRecord>)> {
        let hits = self.search(query, INJECT_LIMIT * 2).await?;
        let mut records: Vec<MemoryRecord> = hits.into_iter().map(|h| h.record).collect();
        if let Some(session_id) = session_id {
            records.sort_by_key(|r| r.session_id.as_deref() != Some(session_id));
        }
        records.truncate(INJECT_LIMIT);
        Ok((render_memories(&records), records))
    }

    /// Persist a task outcome when it looks worth remembering. Returns the
    /// new memory id, if one was written.
    async fn store_if_worthwhile(&self, request: StoreRequest) -> Result<Option<String>>;
}

/// Bullet list of memory contents; empty when there are none.
pub fn render_memories(records: &[MemoryRecord]) -> String {
    records
        .iter()
        .map(|r| format!("- [{}] {}", r.kind, r.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a goal asks to be remembered verbatim.
pub fn is_direct_memory_goal(goal: &str) -> bool {
    let lower = goal.trim().to_lowercase();
    DIRECT_MEMORY_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Classify a direct-memory goal and strip an explicit `remember:` prefix.
pub fn direct_memory_record(goal: &str) -> MemoryRecord {
    let trimmed = goal.trim();
    let lower = trimmed.to_lowercase();
    let content = if lower.starts_with("remember:") {
        trimmed.get("remember:".len()..).unwrap_or(trimmed).trim()
    } else {
        trimmed
    };
    let kind = if lower.contains("prefer") || lower.contains("favorite") {
        MemoryKind::Preference
    } else {
        MemoryKind::Fact
    };
    MemoryRecord::new(kind, content).with_importance(0.9)
}

/// Importance score of a task outcome, 0.0 ..= 1.0.
///
/// Short exchanges and failures score low; preferences, explicit "remember"
/// requests and substantial multi-step work score high.
pub fn worthiness(request: &StoreRequest) -> (MemoryKind, f64) {
    let goal = request.goal.to_lowercase();
    let result = request.result.trim();

    if is_direct_memory_goal(&request.goal) || goal.contains("remember") {
        return (MemoryKind::Fact, 0.9);
    }
    if goal.contains("i prefer") || goal.contains("i like") || goal.contains("favorite") {
        return (MemoryKind::Preference, 0.8);
    }
    if result.is_empty() || result.to_lowercase().starts_with("error") {
        return (MemoryKind::Task, 0.2);
    }

    let mut score: f64 = 0.4;
    if request.execution_log.len() >= 2 {
        score += 0.2;
    }
    if result.len() > 200 {
        score += 0.1;
    }
    if goal.split_whitespace().count() <= 3 {
        score -= 0.2;
    }
    (MemoryKind::Task, score.clamp(0.0, 1.0))
}

pub struct SqliteMemoryService {
    store: MemoryStore,
    embedder: Option<Arc<dyn Embedder>>,
    min_importance: f64,
}

impl SqliteMemoryService {
    pub async fn open(path: impl AsRef<Path>, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let db = Database::open_and_migrate(path.as_ref().to_path_buf(), Schema::Memory).await?;
        Ok(Self::new(MemoryStore::new(db), embedder))
    }

    pub async fn in_memory(embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let db = Database::in_memory_with(Schema::Memory).await?;
        Ok(Self::new(MemoryStore::new(db), embedder))
    }

    pub fn new(store: MemoryStore, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            store,
            embedder,
            min_importance: 0.6,
        }
    }

    pub fn with_min_importance(mut self, min: f64) -> Self {
        self.min_importance = min;
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Tool definitions for the `memory_` family.
    pub fn tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "memory_search",
                "Search long-term memory for facts, preferences and past tasks.",
                object_schema(
                    json!({
                        "query": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1}
                    }),
                    &["query"],
                ),
            ),
            ToolDefinition::new(
                "memory_store",
                "Save a fact or preference to long-term memory.",
                object_schema(
                    json!({
                        "content": {"type": "string"},
                        "kind": {"type": "string", "enum": ["fact", "preference", "task", "pattern", "conversation"]},
                        "importance": {"type": "number", "minimum": 0, "maximum": 1}
                    }),
                    &["content"],
                ),
            ),
            ToolDefinition::new(
                "memory_list",
                "List recent memories.",
                object_schema(
                    json!({
                        "limit": {"type": "integer"},
                        "offset": {"type": "integer"}
                    }),
                    &[],
                ),
            ),
            ToolDefinition::new(
                "memory_delete",
                "Delete a memory by id.",
                object_schema(json!({"id": {"type": "string"}}), &["id"]),
            ),
        ]
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "memory embedding failed, falling back to keywords");
                None
            }
        }
    }
}

#[async_trait]
impl MemoryService for SqliteMemoryService {
    async fn add(&self, mut record: MemoryRecord) -> Result<String> {
        if record.embedding.is_none()
            && let Some(v) = self.embed(&record.content).await
        {
            record.embedding = Some(v);
        }
        self.store.add(&record).await?;
        debug!(memory_id = %record.id, kind = %record.kind, "memory stored");
        Ok(record.id)
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        if let Some(q) = self.embed(query).await {
            let mut scored: Vec<ScoredMemory> = self
                .store
                .all_with_embeddings()
                .await?
                .into_iter()
                .filter_map(|record| {
                    let score = cosine_similarity(&q, record.embedding.as_deref()?);
                    Some(ScoredMemory { record, score })
                })
                .filter(|s| s.score > 0.0)
                .collect();
            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
            scored.truncate(k);
            if !scored.is_empty() {
                return Ok(scored);
            }
        }

        // Keyword fallback: any query term, ranked by importance.
        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::new();
        for term in keywords(query) {
            for record in self.store.search_keyword(&term, k).await? {
                if seen.insert(record.id.clone()) {
                    let score = record.importance as f32;
                    hits.push(ScoredMemory { record, score });
                }
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<MemoryRecord>> {
        Ok(self.store.list(limit, offset).await?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        Ok(self.store.delete(id).await?)
    }

    async fn store_if_worthwhile(&self, request: StoreRequest) -> Result<Option<String>> {
        let (kind, importance) = worthiness(&request);
        if importance < self.min_importance {
            debug!(importance, goal = %request.goal, "task not worth remembering");
            return Ok(None);
        }

        let result: String = request.result.chars().take(500).collect();
        let content = match kind {
            MemoryKind::Task => format!("Task: {} | Result: {}", request.goal.trim(), result),
            _ => request.goal.trim().to_owned(),
        };
        let mut record = MemoryRecord::new(kind, content).with_importance(importance);
        if let Some(session) = &request.session_id {
            record = record.with_session(session.clone());
        }
        record
            .metadata
            .insert("steps".into(), json!(request.execution_log.len()));
        let id = self.add(record).await?;
        info!(memory_id = %id, kind = %kind, importance, "task outcome remembered");
        Ok(Some(id))
    }
}

/// Lowercased query terms worth matching on.
fn keywords(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect();
    terms.dedup();
    terms
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "what", "who", "how", "you", "your", "about", "with", "that", "this",
    "are", "was", "does", "remember", "know",
];

// ---------------------------------------------------------------------------
// Tool dispatch
// ---------------------------------------------------------------------------

/// Execute one `memory_*` tool against a service.
pub async fn call_memory_tool(
    service: &dyn MemoryService,
    name: &str,
    args: &Map<String, Value>,
    session_id: Option<&str>,
) -> Result<Value> {
    match name {
        "memory_search" => {
            let query = arg_str(args, "query").ok_or_else(|| {
                AgentError::tool(name, "missing `query` argument")
            })?;
            let limit = arg_usize(args, "limit").unwrap_or(5);
            let hits = service.search(query, limit).await?;
            Ok(json!(
                hits.iter()
                    .map(|h| json!({
                        "id": h.record.id,
                        "kind": h.record.kind,
                        "content": h.record.content,
                        "score": h.score,
                    }))
                    .collect::<Vec<_>>()
            ))
        }
        "memory_store" => {
            let content = arg_str(args, "content")
                .ok_or_else(|| AgentError::tool(name, "missing `content` argument"))?;
            let kind = match arg_str(args, "kind") {
                Some(k) => k.parse::<MemoryKind>()?,
                None => MemoryKind::Fact,
            };
            let importance = args.get("importance").and_then(Value::as_f64).unwrap_or(0.7);
            let mut record = MemoryRecord::new(kind, content).with_importance(importance);
            if let Some(session) = session_id {
                record = record.with_session(session);
            }
            let id = service.add(record).await?;
            Ok(json!({ "id": id, "stored": true }))
        }
        "memory_list" => {
            let limit = arg_usize(args, "limit").unwrap_or(20);
            let offset = arg_usize(args, "offset").unwrap_or(0);
            Ok(serde_json::to_value(service.list(limit, offset).await?)?)
        }
        "memory_delete" => {
            let id = arg_str(args, "id").ok_or_else(|| AgentError::tool(name, "missing `id` argument"))?;
            service.delete(id).await?;
            Ok(json!({ "id": id, "deleted": true }))
        }
        other => Err(AgentError::UnknownTool {
            tool_name: other.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_prefixes_are_recognized() {
        assert!(is_direct_memory_goal("Remember: my cat is Tom"));
        assert!(is_direct_memory_goal("I prefer tables"));
        assert!(!is_direct_memory_goal("what do I prefer?"));

        let record = direct_memory_record("remember: the wifi password is hunter2");
        assert_eq!(record.content, "the wifi password is hunter2");
        assert_eq!(record.kind, MemoryKind::Fact);
        assert_eq!(direct_memory_record("My favorite color is blue").kind, MemoryKind::Preference);
    }

    #[test]
    fn worthiness_prefers_substantial_work() {
        let trivial = StoreRequest {
            goal: "Hello".into(),
            result: "Hi!".into(),
            ..Default::default()
        };
        assert!(worthiness(&trivial).1 < 0.6);

        let substantial = StoreRequest {
            goal: "Create a markdown about Go and save it".into(),
            result: "x".repeat(300),
            execution_log: vec!["rag_query".into(), "llm".into(), "write".into()],
            session_id: None,
        };
        assert!(worthiness(&substantial).1 >= 0.6);

        let failed = StoreRequest {
            goal: "summarize the quarterly report".into(),
            result: "error: not found".into(),
            ..Default::default()
        };
        assert!(worthiness(&failed).1 < 0.6);
    }

    #[tokio::test]
    async fn keyword_search_and_tools() {
        let service = SqliteMemoryService::in_memory(None).await.unwrap();
        service
            .add(MemoryRecord::new(MemoryKind::Fact, "Alice works at Acme").with_importance(0.9))
            .await
            .unwrap();
        service
            .add(MemoryRecord::new(MemoryKind::Fact, "Bob likes tea"))
            .await
            .unwrap();

        let hits = service.search("what do you remember about Alice", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.content.contains("Alice"));

        let mut args = Map::new();
        args.insert("content".into(), json!("Carol prefers email"));
        args.insert("kind".into(), json!("preference"));
        let stored = call_memory_tool(&service, "memory_store", &args, Some("s1"))
            .await
            .unwrap();
        assert_eq!(stored["stored"], true);

        let listed = call_memory_tool(&service, "memory_list", &Map::new(), None)
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 3);

        assert!(call_memory_tool(&service, "memory_forget", &Map::new(), None).await.is_err());
    }

    #[tokio::test]
    async fn injection_ranks_the_current_session_first() {
        let service = SqliteMemoryService::in_memory(None).await.unwrap();
        service
            .add(MemoryRecord::new(MemoryKind::Fact, "Alice works at Acme").with_importance(0.9))
            .await
            .unwrap();
        service
            .add(MemoryRecord::new(MemoryKind::Fact, "Alice moved to Berlin").with_session("s1"))
            .await
            .unwrap();

        let (context, records) = service.retrieve_and_inject("Alice", Some("s1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "Alice moved to Berlin");
        assert!(context.starts_with("- [fact] Alice moved to Berlin"));

        let (_, other) = service.retrieve_and_inject("Alice", Some("s2")).await.unwrap();
        assert_eq!(other.len(), 2);
    }

    #[tokio::test]
    async fn store_if_worthwhile_skips_trivia() {
        let service = SqliteMemoryService::in_memory(None).await.unwrap();
        let skipped = service
            .store_if_worthwhile(StoreRequest {
                goal: "Hello".into(),
                result: "Hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(skipped.is_none());

        let kept = service
            .store_if_worthwhile(StoreRequest {
                goal: "remember: deploys happen on Fridays".into(),
                result: "Noted".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(kept.is_some());
        assert_eq!(service.store().count().await.unwrap(), 1);
    }
}
