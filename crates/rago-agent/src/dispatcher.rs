//! Tool dispatcher.
//!
//! Routes a tool call to the collaborator that owns it. For a name `T` the
//! order is:
//!
//! 1. `skill_*` -> skills service
//! 2. `rag_query` / `query` / `rag_ingest` / `ingest` -> RAG processor
//! 3. any tool the MCP executor lists -> MCP
//! 4. `memory_*` -> memory service
//! 5. `transfer_to_*` -> the current agent's handoffs
//! 6. the current agent's function tools
//! 7. `llm` / `generate` -> the LLM directly
//!
//! Anything else is an unknown tool. Name collisions resolve to the first
//! category in this order. Skill and MCP calls are refused when the acting
//! agent's allowlists exclude them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rago_kernel::ToolDefinition;
use serde_json::{Map, Value, json};

use crate::agent::{Agent, AgentRegistry, HANDOFF_TOOL_PREFIX, Handoff};
use crate::error::{AgentError, Result};
use crate::llm::LlmProvider;
use crate::tools::mcp::{McpExecutor, filter_allowed, tool_allowed, unwrap_result};
use crate::tools::memory::{MemoryService, SqliteMemoryService, call_memory_tool};
use crate::tools::rag::{self, RAG_TOOL_NAMES, RagProcessor, call_rag_tool};
use crate::tools::skills::{SKILL_TOOL_PREFIX, SkillRequest, SkillsService, skill_allowed};
use crate::tools::{arg_str, object_schema};

/// Names that invoke the LLM directly.
pub const LLM_TOOL_NAMES: [&str; 2] = ["llm", "generate"];

const MEMORY_TOOL_PREFIX: &str = "memory_";

/// Who is calling: the acting agent (for handoffs and function tools) and
/// the session memory writes are attributed to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchContext<'a> {
    pub agent: Option<&'a Agent>,
    pub session_id: Option<&'a str>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(agent: &'a Agent, session_id: &'a str) -> Self {
        Self {
            agent: Some(agent),
            session_id: Some(session_id),
        }
    }
}

/// What a dispatched call produced.
#[derive(Debug, Clone)]
pub enum Dispatched {
    Output(Value),
    /// The call was a handoff; the caller switches to `target`.
    Handoff { handoff: Handoff, target: Arc<Agent> },
}

/// Routes tool calls to RAG, MCP, memory, skills, handoffs and the LLM.
#[derive(Clone, Default)]
pub struct Dispatcher {
    rag: Option<Arc<dyn RagProcessor>>,
    mcp: Option<Arc<dyn McpExecutor>>,
    memory: Option<Arc<dyn MemoryService>>,
    skills: Option<Arc<dyn SkillsService>>,
    llm: Option<Arc<dyn LlmProvider>>,
    agents: Arc<AgentRegistry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rag(mut self, rag: Arc<dyn RagProcessor>) -> Self {
        self.rag = Some(rag);
        self
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpExecutor>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillsService>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_agents(mut self, agents: Arc<AgentRegistry>) -> Self {
        self.agents = agents;
        self
    }

    pub fn rag(&self) -> Option<&Arc<dyn RagProcessor>> {
        self.rag.as_ref()
    }

    pub fn memory(&self) -> Option<&Arc<dyn MemoryService>> {
        self.memory.as_ref()
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// The tool set offered to the LLM, in dispatch order with duplicates
    /// removed.
    ///
    /// With an agent, MCP tools and skills are filtered by its allowlists and
    /// its enabled handoffs and function tools are appended. Collaborator
    /// listing failures are logged and that category is left out.
    pub async fn tools_for(&self, agent: Option<&Agent>) -> Vec<ToolDefinition> {
        let mut tools = Vec::new();

        if let Some(skills) = &self.skills {
            match skills.list_skills(None).await {
                Ok(list) => tools.extend(
                    list.iter()
                        .filter(|s| agent.is_none_or(|a| skill_allowed(s, &a.skills)))
                        .map(|s| s.tool_definition()),
                ),
                Err(e) => tracing::warn!(error = %e, "listing skills failed"),
            }
        }
        if self.rag.is_some() {
            tools.extend(rag::tool_definitions());
        }
        if let Some(mcp) = &self.mcp {
            match mcp.list_tools().await {
                Ok(list) => match agent {
                    Some(a) => tools.extend(filter_allowed(list, &a.mcp_tools)),
                    None => tools.extend(list),
                },
                Err(e) => tracing::warn!(error = %e, "listing mcp tools failed"),
            }
        }
        if self.memory.is_some() {
            tools.extend(SqliteMemoryService::tool_definitions());
        }
        if let Some(agent) = agent {
            tools.extend(agent.enabled_handoffs().map(Handoff::tool_definition));
            tools.extend(agent.function_tools.iter().map(|t| t.definition.clone()));
        }

        let mut seen = HashSet::new();
        tools.retain(|t| seen.insert(t.name.clone()));
        tools
    }

    /// Route one call.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Map<String, Value>,
        ctx: DispatchContext<'_>,
    ) -> Result<Dispatched> {
        tracing::debug!(tool = %name, "dispatching tool call");

        if let Some(id) = name.strip_prefix(SKILL_TOOL_PREFIX)
            && let Some(skills) = &self.skills
        {
            if let Some(agent) = ctx.agent
                && !self.skill_permitted(skills.as_ref(), id, agent).await
            {
                return Err(not_permitted(name, agent));
            }
            return self.call_skill(skills.as_ref(), name, id, args).await.map(Dispatched::Output);
        }

        if RAG_TOOL_NAMES.contains(&name)
            && let Some(rag) = &self.rag
        {
            return call_rag_tool(rag.as_ref(), name, args).await.map(Dispatched::Output);
        }

        if let Some(mcp) = &self.mcp {
            match mcp.list_tools().await {
                Ok(list) if list.iter().any(|t| t.name == name) => {
                    if let Some(agent) = ctx.agent
                        && !tool_allowed(name, &agent.mcp_tools)
                    {
                        return Err(not_permitted(name, agent));
                    }
                    let raw = mcp.call_tool(name, args).await?;
                    return unwrap_result(name, raw).map(Dispatched::Output);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(tool = %name, error = %e, "listing mcp tools failed"),
            }
        }

        if name.starts_with(MEMORY_TOOL_PREFIX)
            && let Some(memory) = &self.memory
        {
            return call_memory_tool(memory.as_ref(), name, args, ctx.session_id)
                .await
                .map(Dispatched::Output);
        }

        if name.starts_with(HANDOFF_TOOL_PREFIX)
            && let Some(agent) = ctx.agent
            && let Some(handoff) = agent.find_handoff(name)
        {
            let target = self.agents.get(&handoff.target).ok_or_else(|| {
                AgentError::tool(name, format!("handoff target `{}` is not registered", handoff.target))
            })?;
            if let Some(callback) = &handoff.on_handoff {
                callback(&agent.name, args);
            }
            tracing::info!(from = %agent.name, to = %target.name, "handoff requested");
            return Ok(Dispatched::Handoff {
                handoff: handoff.clone(),
                target,
            });
        }

        if let Some(tool) = ctx.agent.and_then(|a| a.function_tool(name)) {
            return tool.call(args.clone()).await.map(Dispatched::Output);
        }

        if LLM_TOOL_NAMES.contains(&name)
            && let Some(llm) = &self.llm
        {
            return self.call_llm(llm.as_ref(), name, args, ctx.agent).await.map(Dispatched::Output);
        }

        Err(AgentError::UnknownTool {
            tool_name: name.to_owned(),
        })
    }

    /// Route one call where a handoff is not meaningful (plan steps).
    pub async fn call(&self, name: &str, args: &Map<String, Value>, ctx: DispatchContext<'_>) -> Result<Value> {
        match self.dispatch(name, args, ctx).await? {
            Dispatched::Output(value) => Ok(value),
            Dispatched::Handoff { target, .. } => Err(AgentError::tool(
                name,
                format!("handoff to `{}` is only available inside a run", target.name),
            )),
        }
    }

    /// Skill allowlists may name a skill by id or display name; the latter
    /// needs a listing to resolve.
    async fn skill_permitted(&self, skills: &dyn SkillsService, id: &str, agent: &Agent) -> bool {
        if agent.skills.iter().any(|a| a == "*" || a == id) {
            return true;
        }
        match skills.list_skills(None).await {
            Ok(list) => list.iter().any(|s| s.id == id && skill_allowed(s, &agent.skills)),
            Err(e) => {
                tracing::warn!(skill = %id, error = %e, "listing skills failed");
                false
            }
        }
    }

    async fn call_skill(
        &self,
        skills: &dyn SkillsService,
        name: &str,
        id: &str,
        args: &Map<String, Value>,
    ) -> Result<Value> {
        let variables: BTreeMap<String, String> = args
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect();
        let result = skills
            .execute(SkillRequest {
                id: id.to_owned(),
                variables,
                interactive: false,
            })
            .await?;
        if result.success {
            Ok(Value::String(result.output))
        } else {
            Err(AgentError::tool(
                name,
                result.error.unwrap_or_else(|| "skill failed".to_owned()),
            ))
        }
    }

    async fn call_llm(
        &self,
        llm: &dyn LlmProvider,
        name: &str,
        args: &Map<String, Value>,
        agent: Option<&Agent>,
    ) -> Result<Value> {
        let prompt = arg_str(args, "prompt")
            .or_else(|| arg_str(args, "input"))
            .ok_or_else(|| AgentError::tool(name, "missing `prompt` argument"))?;
        let mut opts = agent.map(Agent::generate_options).unwrap_or_default();
        if let Some(t) = args.get("temperature").and_then(Value::as_f64) {
            opts.temperature = Some(t as f32);
        }
        if let Some(m) = args.get("max_tokens").and_then(Value::as_u64) {
            opts.max_tokens = Some(u32::try_from(m).unwrap_or(u32::MAX));
        }
        let text = llm.generate(prompt, &opts).await?;
        Ok(Value::String(text))
    }
}

fn not_permitted(name: &str, agent: &Agent) -> AgentError {
    AgentError::tool(name, format!("tool is not permitted for agent `{}`", agent.name))
}

/// Definition of the direct LLM tool, offered to the planner.
pub fn llm_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        "llm",
        "Generate text with the language model from a prompt.",
        object_schema(
            json!({
                "prompt": {"type": "string"},
                "temperature": {"type": "number"},
                "max_tokens": {"type": "integer"},
            }),
            &["prompt"],
        ),
    )
}
