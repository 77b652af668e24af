//! Service wiring: builds the LLM client, stores, router and runtime from a
//! [`RagoConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rago_agent::compaction::CompactionConfig;
use rago_agent::guardrails::builtin;
use rago_agent::{
    Agent, Compactor, Dispatcher, Embedder, Executor, GuardrailChain, LlmProvider, OpenAiClient, Planner,
    PlannerConfig, PromptSkills, RagoConfig, Runtime, RuntimeConfig, SemanticRouter, SessionManager, SqliteMemoryService,
    SqliteRag,
};
use rago_store::AgentStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::routed::{RoutedLlm, router_from_config};

const BUDGET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn openai_client(config: &RagoConfig) -> Result<Arc<OpenAiClient>> {
    let client = OpenAiClient::new(config.providers.openai.clone())
        .context("failed to create LLM client (set OPENAI_API_KEY or providers.openai.api_key)")?;
    Ok(Arc::new(client))
}

/// Open the knowledge base. Without models it can list, reset, import and
/// export, but queries fall back to keyword matching.
pub async fn open_rag(
    config: &RagoConfig,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Result<SqliteRag> {
    let mut rag = SqliteRag::open(&config.sqvect.db_path)
        .await
        .with_context(|| format!("failed to open knowledge base {}", config.sqvect.db_path.display()))?
        .with_chunk_size(config.sqvect.chunk_size);
    if let Some(embedder) = embedder {
        rag = rag.with_embedder(embedder);
    }
    if let Some(llm) = llm {
        rag = rag.with_llm(llm);
    }
    Ok(rag)
}

/// Everything the `agent` commands need.
pub struct Services {
    pub llm: Arc<RoutedLlm>,
    pub store: AgentStore,
    pub runtime: Arc<Runtime>,
    pub planner: Arc<Planner>,
    pub dispatcher: Arc<Dispatcher>,
    pub memory: Arc<SqliteMemoryService>,
    sweeper: CancellationToken,
}

impl Services {
    pub async fn open(config: RagoConfig) -> Result<Self> {
        let client = openai_client(&config)?;
        let (router, record) = router_from_config(&config);
        let sweeper = CancellationToken::new();
        router.spawn_budget_sweeper(BUDGET_SWEEP_INTERVAL, sweeper.clone());
        let llm = Arc::new(RoutedLlm::new(router).with_backend(record, client.clone()));

        let rag = open_rag(&config, Some(client.clone()), Some(llm.clone())).await?;
        let memory = Arc::new(
            SqliteMemoryService::open(config.memory_db_path(), Some(client.clone()))
                .await
                .context("failed to open memory database")?,
        );
        let store = AgentStore::open(&config.data_dir, &config.agent.name)
            .await
            .context("failed to open agent database")?;
        info!(data_dir = %config.data_dir.display(), agent = %config.agent.name, "stores ready");

        if !config.mcp.servers.is_empty() {
            let names: Vec<&str> = config.mcp.servers.iter().map(|s| s.name.as_str()).collect();
            warn!(servers = ?names, "MCP servers are configured but no MCP transport is linked; their tools are unavailable");
        }

        let semantic = Arc::new(SemanticRouter::new(client).with_threshold(config.router.threshold));
        match semantic.load_dir(&config.intents_dir).await {
            Ok(0) => {}
            Ok(n) => info!(intents = n, "semantic router ready"),
            Err(e) => warn!(error = %e, "failed to load intents, continuing without them"),
        }
        let planner = Arc::new(Planner::new(llm.clone()).with_router(semantic).with_config(PlannerConfig {
            route_threshold: config.router.planner_threshold,
            ..PlannerConfig::default()
        }));

        let skills = PromptSkills::load_dir(&config.skills_dir, llm.clone())
            .await
            .with_context(|| format!("failed to load skills from {}", config.skills_dir.display()))?;
        let mut dispatcher = Dispatcher::new()
            .with_rag(Arc::new(rag))
            .with_memory(memory.clone())
            .with_llm(llm.clone());
        if !skills.is_empty() {
            dispatcher = dispatcher.with_skills(Arc::new(skills));
        }
        let dispatcher = Arc::new(dispatcher);

        let guardrails = GuardrailChain::new()
            .with(builtin::prompt_injection().context("failed to build prompt-injection guardrail")?)
            .with(builtin::pii(true).context("failed to build PII guardrail")?);
        let compactor = Compactor::new(
            llm.clone(),
            CompactionConfig {
                max_messages: config.agent.compact_after,
                ..CompactionConfig::default()
            },
        );
        let sessions = Arc::new(SessionManager::with_store(store.sessions.clone()));
        let agent = Agent::new(&config.agent.name, &config.agent.instructions);
        let runtime = Runtime::new(llm.clone(), dispatcher.clone(), agent)
            .with_sessions(sessions)
            .with_plan_store(store.plans.clone())
            .with_planner(planner.clone())
            .with_guardrails(Arc::new(guardrails))
            .with_compactor(Arc::new(compactor))
            .with_config(RuntimeConfig {
                rag_top_k: config.sqvect.top_k,
                ..RuntimeConfig::from(&config.agent)
            });

        Ok(Self {
            llm,
            store,
            runtime: Arc::new(runtime),
            planner,
            dispatcher,
            memory,
            sweeper,
        })
    }

    /// An executor over the shared dispatcher that persists plans.
    pub fn executor(&self, cancel: CancellationToken) -> Executor {
        Executor::new(self.dispatcher.clone())
            .with_agent(self.runtime.agent().clone())
            .with_memory(self.memory.clone())
            .with_plan_store(self.store.plans.clone())
            .with_cancellation(cancel)
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.llm.report_alerts();
        self.sweeper.cancel();
    }
}
