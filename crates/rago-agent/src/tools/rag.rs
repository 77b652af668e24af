//! Retrieval over ingested documents.
//!
//! [`SqliteRag`] chunks text by paragraph, stores chunk embeddings as blobs
//! and ranks them by brute-force cosine similarity. Without an embedder it
//! ranks by keyword overlap instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rago_kernel::ToolDefinition;
use rago_store::{
    Chunk, Database, Document, DocumentStore, Schema, blob_to_embedding, content_id,
    cosine_similarity, embedding_to_blob,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::error::{AgentError, Result};
use crate::llm::{Embedder, GenerateOptions, LlmProvider};
use crate::tools::{arg_str, arg_usize, object_schema};

/// Tool names routed to the RAG collaborator.
pub const RAG_TOOL_NAMES: &[&str] = &["rag_query", "query", "rag_ingest", "ingest"];

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Synthesize an answer from the sources when an LLM is available.
    #[serde(default)]
    pub generate_answer: bool,
    /// Only consider chunks whose document metadata contains these pairs.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filter: Map<String, Value>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: DEFAULT_TOP_K,
            generate_answer: false,
            filter: Map::new(),
        }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_answer(mut self) -> Self {
        self.generate_answer = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySource {
    pub id: String,
    pub document_id: String,
    pub score: f32,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<QuerySource>,
}

impl QueryResponse {
    /// Sources rendered as a numbered context block.
    pub fn context(&self) -> String {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {}", i + 1, s.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Either inline `content` or a `path` to read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Label stored with the document; defaults to the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl IngestRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub document_id: String,
    pub chunks: usize,
}

#[async_trait]
pub trait RagProcessor: Send + Sync {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse>;

    async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse>;
}

/// Tool definitions for the RAG family.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "rag_query",
            "Search the knowledge base and return relevant passages.",
            object_schema(
                json!({
                    "query": {"type": "string", "description": "What to look for"},
                    "top_k": {"type": "integer", "minimum": 1}
                }),
                &["query"],
            ),
        ),
        ToolDefinition::new(
            "rag_ingest",
            "Add a document to the knowledge base from text or a file path.",
            object_schema(
                json!({
                    "content": {"type": "string"},
                    "path": {"type": "string"},
                    "source": {"type": "string"}
                }),
                &[],
            ),
        ),
    ]
}

/// Execute one RAG tool call.
pub async fn call_rag_tool(rag: &dyn RagProcessor, name: &str, args: &Map<String, Value>) -> Result<Value> {
    match name {
        "rag_query" | "query" => {
            let query = arg_str(args, "query")
                .or_else(|| arg_str(args, "question"))
                .ok_or_else(|| AgentError::tool(name, "missing `query` argument"))?;
            let mut request = QueryRequest::new(query);
            if let Some(k) = arg_usize(args, "top_k") {
                request.top_k = k;
            }
            request.generate_answer = args
                .get("generate_answer")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(serde_json::to_value(rag.query(request).await?)?)
        }
        "rag_ingest" | "ingest" => {
            let request = IngestRequest {
                content: arg_str(args, "content").map(str::to_owned),
                path: arg_str(args, "path").map(PathBuf::from),
                source: arg_str(args, "source").map(str::to_owned),
                metadata: args
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            };
            Ok(serde_json::to_value(rag.ingest(request).await?)?)
        }
        other => Err(AgentError::UnknownTool {
            tool_name: other.to_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// SQLite processor
// ---------------------------------------------------------------------------

pub struct SqliteRag {
    documents: DocumentStore,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LlmProvider>>,
    chunk_size: usize,
}

/// One document with its chunks in the export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportedDocument {
    #[serde(flatten)]
    document: Document,
    chunks: Vec<ExportedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportedChunk {
    id: String,
    ordinal: usize,
    content: String,
    /// Base64 of little-endian f32s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<String>,
}

impl SqliteRag {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Database::open_and_migrate(path, Schema::Rag).await?;
        Ok(Self::new(DocumentStore::new(db)))
    }

    pub async fn in_memory() -> Result<Self> {
        let db = Database::in_memory_with(Schema::Rag).await?;
        Ok(Self::new(DocumentStore::new(db)))
    }

    pub fn new(documents: DocumentStore) -> Self {
        Self {
            documents,
            embedder: None,
            llm: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = chars.max(1);
        self
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.documents.list_documents().await?)
    }

    pub async fn delete(&self, document_id: &str) -> Result<()> {
        Ok(self.documents.delete(document_id).await?)
    }

    pub async fn reset(&self) -> Result<()> {
        self.documents.reset().await?;
        info!("knowledge base reset");
        Ok(())
    }

    /// `(documents, chunks)`.
    pub async fn count(&self) -> Result<(i64, i64)> {
        Ok(self.documents.count().await?)
    }

    /// Every document and chunk as pretty JSON.
    pub async fn export(&self) -> Result<String> {
        let documents = self.documents.list_documents().await?;
        let mut chunks = self.documents.all_chunks().await?;
        let exported: Vec<ExportedDocument> = documents
            .into_iter()
            .map(|document| {
                let (mine, rest): (Vec<Chunk>, Vec<Chunk>) =
                    chunks.drain(..).partition(|c| c.document_id == document.id);
                chunks = rest;
                ExportedDocument {
                    chunks: mine
                        .into_iter()
                        .map(|c| ExportedChunk {
                            id: c.id,
                            ordinal: c.ordinal,
                            content: c.content,
                            embedding: c.embedding.map(|e| BASE64.encode(embedding_to_blob(&e))),
                        })
                        .collect(),
                    document,
                }
            })
            .collect();
        Ok(serde_json::to_string_pretty(&exported)?)
    }

    /// Load documents written by [`export`](Self::export). Returns the number
    /// of documents imported.
    pub async fn import(&self, json: &str) -> Result<usize> {
        let exported: Vec<ExportedDocument> = serde_json::from_str(json)?;
        let n = exported.len();
        for item in exported {
            let chunks = item
                .chunks
                .into_iter()
                .map(|c| {
                    let embedding = match c.embedding {
                        Some(b64) => Some(blob_to_embedding(&BASE64.decode(b64).map_err(|e| {
                            AgentError::input(format!("chunk {}: bad embedding: {e}", c.id))
                        })?)),
                        None => None,
                    };
                    Ok(Chunk {
                        id: c.id,
                        document_id: item.document.id.clone(),
                        ordinal: c.ordinal,
                        content: c.content,
                        embedding,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            self.documents.put(&item.document, chunks).await?;
        }
        info!(documents = n, "knowledge base imported");
        Ok(n)
    }

    async fn embed_chunks(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return vec![None; texts.len()];
        };
        match embedder.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Some).collect(),
            Ok(vectors) => {
                warn!(expected = texts.len(), got = vectors.len(), "embedding count mismatch");
                vec![None; texts.len()]
            }
            Err(e) => {
                warn!(error = %e, "chunk embedding failed, storing without vectors");
                vec![None; texts.len()]
            }
        }
    }

    async fn synthesize(&self, llm: &dyn LlmProvider, query: &str, context: &str) -> Result<String> {
        let prompt = format!(
            "Answer the question using only the context below. If the context is \
             insufficient, say so.\n\nContext:\n{context}\n\nQuestion: {query}\n\nAnswer:"
        );
        llm.generate(&prompt, &GenerateOptions::default().temperature(0.2))
            .await
    }
}

#[async_trait]
impl RagProcessor for SqliteRag {
    #[instrument(skip(self, request), fields(query = %request.query, top_k = request.top_k))]
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        if request.query.trim().is_empty() {
            return Err(AgentError::input("empty query"));
        }
        let top_k = request.top_k.max(1);

        let allowed: Option<HashSet<String>> = if request.filter.is_empty() {
            None
        } else {
            Some(
                self.documents
                    .list_documents()
                    .await?
                    .into_iter()
                    .filter(|d| request.filter.iter().all(|(k, v)| d.metadata.get(k) == Some(v)))
                    .map(|d| d.id)
                    .collect(),
            )
        };
        let chunks: Vec<Chunk> = self
            .documents
            .all_chunks()
            .await?
            .into_iter()
            .filter(|c| allowed.as_ref().is_none_or(|ids| ids.contains(&c.document_id)))
            .collect();

        let query_vec = match &self.embedder {
            Some(e) => match e.embed(&request.query).await {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(error = %err, "query embedding failed, ranking by keywords");
                    None
                }
            },
            None => None,
        };
        let terms = terms(&request.query);

        let mut scored: Vec<QuerySource> = chunks
            .into_iter()
            .filter_map(|c| {
                let score = match (&query_vec, &c.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => keyword_score(&terms, &c.content),
                };
                (score > 0.0).then(|| QuerySource {
                    id: c.id,
                    document_id: c.document_id,
                    score,
                    content: c.content,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        debug!(hits = scored.len(), "retrieval finished");

        let mut response = QueryResponse {
            answer: String::new(),
            sources: scored,
        };
        if response.sources.is_empty() {
            return Ok(response);
        }
        response.answer = match (&self.llm, request.generate_answer) {
            (Some(llm), true) => self
                .synthesize(llm.as_ref(), &request.query, &response.context())
                .await?,
            _ => response.context(),
        };
        Ok(response)
    }

    #[instrument(skip(self, request))]
    async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse> {
        let content = match (&request.content, &request.path) {
            (Some(c), _) => c.clone(),
            (None, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
                AgentError::input(format!("cannot read {}: {e}", path.display()))
            })?,
            (None, None) => return Err(AgentError::input("ingest needs `content` or `path`")),
        };
        if content.trim().is_empty() {
            return Err(AgentError::input("document is empty"));
        }

        let document_id = content_id(&content);
        let source = request
            .source
            .clone()
            .or_else(|| request.path.as_ref().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "inline".to_owned());

        let texts = chunk_text(&content, self.chunk_size);
        let vectors = self.embed_chunks(&texts).await;
        let chunks: Vec<Chunk> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(ordinal, (content, embedding))| Chunk {
                id: format!("{document_id}-{ordinal}"),
                document_id: document_id.clone(),
                ordinal,
                content,
                embedding,
            })
            .collect();

        let document = Document {
            id: document_id.clone(),
            source,
            metadata: request.metadata,
            chunk_count: chunks.len(),
            created_at: rago_kernel::now(),
        };
        let n = chunks.len();
        self.documents.put(&document, chunks).await?;
        info!(document_id = %document_id, source = %document.source, chunks = n, "document ingested");
        Ok(IngestResponse {
            document_id,
            chunks: n,
        })
    }
}

/// Split on blank lines, then pack paragraphs into chunks of at most
/// `max_chars` characters. A single oversized paragraph is split on char
/// boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        if len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = paragraph.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let needed = if current.is_empty() { len } else { current.chars().count() + 2 + len };
        if needed > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn terms(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Fraction of query terms present in `content`.
fn keyword_score(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}
