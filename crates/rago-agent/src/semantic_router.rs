//! Embedding-based intent classification.
//!
//! Each intent's utterances are embedded once at registration. A query is
//! embedded (through a small cache) and compared against every utterance;
//! the best-scoring intent wins when its score reaches the threshold.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::future::Cache;
use rago_store::cosine_similarity;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::intents::{Intent, load_intents_dir};
use crate::llm::Embedder;

pub const DEFAULT_THRESHOLD: f32 = 0.82;

/// Result of routing one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteMatch {
    /// Best intent, even when below the threshold. Empty with no intents.
    pub name: String,
    pub score: f32,
    pub matched: bool,
}

struct IndexedIntent {
    intent: Intent,
    vectors: Vec<Vec<f32>>,
}

pub struct SemanticRouter {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    intents: RwLock<Vec<IndexedIntent>>,
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl SemanticRouter {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            threshold: DEFAULT_THRESHOLD,
            intents: RwLock::new(Vec::new()),
            query_cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Embed and index `intent`, replacing any intent with the same name.
    pub async fn add_intent(&self, intent: Intent) -> Result<()> {
        if intent.utterances.is_empty() {
            return Err(AgentError::input(format!("intent `{}` has no utterances", intent.name)));
        }
        let vectors = self.embedder.embed_batch(&intent.utterances).await?;
        if vectors.len() != intent.utterances.len() {
            return Err(AgentError::Internal(format!(
                "embedder returned {} vectors for {} utterances",
                vectors.len(),
                intent.utterances.len()
            )));
        }
        debug!(intent = %intent.name, utterances = vectors.len(), "intent indexed");
        let mut intents = self.intents.write().unwrap_or_else(|e| e.into_inner());
        intents.retain(|i| i.intent.name != intent.name);
        intents.push(IndexedIntent { intent, vectors });
        Ok(())
    }

    pub fn remove_intent(&self, name: &str) -> bool {
        let mut intents = self.intents.write().unwrap_or_else(|e| e.into_inner());
        let before = intents.len();
        intents.retain(|i| i.intent.name != name);
        before != intents.len()
    }

    pub fn intents(&self) -> Vec<Intent> {
        self.intents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|i| i.intent.clone())
            .collect()
    }

    pub fn intent(&self, name: &str) -> Option<Intent> {
        self.intents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|i| i.intent.name == name)
            .map(|i| i.intent.clone())
    }

    /// Load and index every intent file in `dir`. Returns how many were
    /// indexed.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize> {
        let intents = load_intents_dir(dir).await?;
        let n = intents.len();
        for intent in intents {
            self.add_intent(intent).await?;
        }
        info!(dir = %dir.display(), intents = n, "intents loaded");
        Ok(n)
    }

    pub async fn route(&self, query: &str) -> Result<RouteMatch> {
        let key = query.trim().to_lowercase();
        let vector = match self.query_cache.get(&key).await {
            Some(v) => v,
            None => {
                let v = Arc::new(self.embedder.embed(query).await?);
                self.query_cache.insert(key, Arc::clone(&v)).await;
                v
            }
        };

        let intents = self.intents.read().unwrap_or_else(|e| e.into_inner());
        let best = intents
            .iter()
            .map(|indexed| {
                let score = indexed
                    .vectors
                    .iter()
                    .map(|u| cosine_similarity(&vector, u))
                    .fold(0.0f32, f32::max);
                (indexed.intent.name.as_str(), score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let route = match best {
            Some((name, score)) => RouteMatch {
                name: name.to_owned(),
                score,
                matched: score >= self.threshold,
            },
            None => RouteMatch {
                name: String::new(),
                score: 0.0,
                matched: false,
            },
        };
        debug!(query, intent = %route.name, score = route.score, matched = route.matched, "routed");
        Ok(route)
    }
}
