//! Agent execution engine for rago.
//!
//! Given a natural-language goal, the runtime drives an LLM through a
//! tool-using loop until it produces a final answer. Tools come from a
//! knowledge base (RAG), long-term memory, MCP servers, skills, and the
//! agents themselves (function tools and handoffs).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌────────────┐
//! │   Runtime    │────>│  Dispatcher  │────>│ RAG / MCP  │
//! │ (tool loop)  │     │  (routing)   │     │ memory ... │
//! └──────┬───────┘     └──────▲───────┘     └────────────┘
//!        │                    │
//!  ┌─────┴─────┐       ┌──────┴─────┐
//!  │  Planner  │──────>│  Executor  │
//!  │  (plans)  │       │  (steps)   │
//!  └───────────┘       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`runtime`] -- The tool loop, streaming runs, verification.
//! - [`agent`] -- Agents, function tools, handoffs and the agent registry.
//! - [`dispatcher`] -- Routes tool calls to their collaborators.
//! - [`planner`] -- Intent recognition and structured multi-step plans.
//! - [`executor`] -- Step-by-step plan execution with placeholders.
//! - [`subagent`] -- Bounded child runs with timeouts, retries and pause.
//! - [`session`] -- Live sessions over the session store.
//! - [`compaction`] -- History summarization.
//! - [`guardrails`] -- Input/output content checks.
//! - [`semantic_router`] / [`intents`] -- Embedding-based intent routing.
//! - [`tools`] -- Memory, RAG, MCP and skills collaborators.
//! - [`llm`] -- LLM and embedder traits plus the OpenAI-compatible client.
//! - [`config`] -- `rago.toml` loading.
//! - [`error`] -- Agent error types.

pub mod agent;
pub mod compaction;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod guardrails;
pub mod intents;
pub mod llm;
pub mod planner;
pub mod runtime;
pub mod semantic_router;
pub mod session;
pub mod subagent;
pub mod tools;

// Re-export the most commonly used types at the crate root.
pub use agent::{Agent, AgentRegistry, FunctionTool, Handoff};
pub use compaction::{CompactionConfig, Compactor};
pub use config::RagoConfig;
pub use dispatcher::{DispatchContext, Dispatched, Dispatcher};
pub use error::{AgentError, Result};
pub use executor::Executor;
pub use guardrails::{Guardrail, GuardrailChain, GuardrailContext, GuardrailKind, GuardrailResult};
pub use intents::Intent;
pub use llm::{Embedder, GenerateOptions, LlmProvider, OpenAiClient, OpenAiConfig, ToolResponse};
pub use planner::{IntentType, Planner, PlannerConfig, RecognizedIntent};
pub use runtime::{RunOutput, Runtime, RuntimeConfig, ToolFilter};
pub use semantic_router::{RouteMatch, SemanticRouter};
pub use session::SessionManager;
pub use subagent::{SubAgent, SubAgentConfig, SubAgentMode, SubAgentRegistry, SubAgentState};
pub use tools::mcp::McpExecutor;
pub use tools::memory::{MemoryService, SqliteMemoryService};
pub use tools::rag::{RagProcessor, SqliteRag};
pub use tools::skills::{PromptSkills, SkillsService};
