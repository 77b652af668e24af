//! Agents, handoffs and function tools.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use rago_kernel::{Message, ToolDefinition};
use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::llm::GenerateOptions;
use crate::tools::object_schema;

pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// Local async handler behind a [`FunctionTool`].
pub type FunctionHandler = Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A tool implemented in-process.
#[derive(Clone)]
pub struct FunctionTool {
    pub definition: ToolDefinition,
    handler: FunctionHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, parameters: Value, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            definition: ToolDefinition::new(name, description, parameters),
            handler: Arc::new(move |args| Box::pin(f(args))),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub async fn call(&self, args: Map<String, Value>) -> Result<Value> {
        (self.handler)(args).await
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool").field("name", &self.definition.name).finish()
    }
}

pub type HandoffCallback = Arc<dyn Fn(&str, &Map<String, Value>) + Send + Sync>;
pub type InputFilter = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;
pub type EnabledPredicate = Arc<dyn Fn(&Agent) -> bool + Send + Sync>;

/// Delegation of the conversation to another agent.
#[derive(Clone)]
pub struct Handoff {
    pub target: String,
    pub tool_name: String,
    pub description: String,
    /// Called with the source agent's name and the call arguments.
    pub on_handoff: Option<HandoffCallback>,
    /// Rewrites the history the target agent sees.
    pub input_filter: Option<InputFilter>,
    pub is_enabled: Option<EnabledPredicate>,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("target", &self.target)
            .field("tool_name", &self.tool_name)
            .finish()
    }
}

/// `transfer_to_` plus the lowercased name with non-alphanumerics as `_`.
pub fn handoff_tool_name(target: &str) -> String {
    let normalized: String = target
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{HANDOFF_TOOL_PREFIX}{}", normalized.trim_matches('_'))
}

impl Handoff {
    pub fn to(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            tool_name: handoff_tool_name(&target),
            description: format!("Transfer the conversation to the {target} agent."),
            target,
            on_handoff: None,
            input_filter: None,
            is_enabled: None,
        }
    }

    pub fn tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn on_handoff(mut self, f: impl Fn(&str, &Map<String, Value>) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Arc::new(f));
        self
    }

    pub fn input_filter(mut self, f: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static) -> Self {
        self.input_filter = Some(Arc::new(f));
        self
    }

    pub fn enabled_when(mut self, f: impl Fn(&Agent) -> bool + Send + Sync + 'static) -> Self {
        self.is_enabled = Some(Arc::new(f));
        self
    }

    pub fn enabled_for(&self, agent: &Agent) -> bool {
        self.is_enabled.as_ref().is_none_or(|f| f(agent))
    }

    pub fn tool_definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.tool_name.clone(),
            self.description.clone(),
            object_schema(
                json!({"reason": {"type": "string", "description": "Why the transfer is needed"}}),
                &[],
            ),
        )
    }

    pub fn filter_input(&self, messages: Vec<Message>) -> Vec<Message> {
        match &self.input_filter {
            Some(f) => f(messages),
            None => messages,
        }
    }
}

/// A named LLM persona.
#[derive(Debug, Clone)]
pub struct Agent {
    pub name: String,
    pub id: String,
    pub instructions: String,
    /// MCP tool allowlist; `"*"` allows all.
    pub mcp_tools: Vec<String>,
    /// Skill allowlist; `"*"` allows all.
    pub skills: Vec<String>,
    pub function_tools: Vec<FunctionTool>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub handoffs: Vec<Handoff>,
}

impl Agent {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: rago_kernel::new_id(),
            instructions: instructions.into(),
            mcp_tools: vec!["*".into()],
            skills: vec!["*".into()],
            function_tools: Vec::new(),
            model: None,
            temperature: None,
            handoffs: Vec::new(),
        }
    }

    pub fn with_mcp_tools<I, S>(mut self, allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mcp_tools = allow.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skills<I, S>(mut self, allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = allow.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_function_tool(mut self, tool: FunctionTool) -> Self {
        self.function_tools.push(tool);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(handoff);
        self
    }

    pub fn enabled_handoffs(&self) -> impl Iterator<Item = &Handoff> {
        self.handoffs.iter().filter(|h| h.enabled_for(self))
    }

    pub fn find_handoff(&self, tool_name: &str) -> Option<&Handoff> {
        self.enabled_handoffs().find(|h| h.tool_name == tool_name)
    }

    pub fn function_tool(&self, name: &str) -> Option<&FunctionTool> {
        self.function_tools.iter().find(|t| t.name() == name)
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: None,
        }
    }
}

/// Agents by name, shared across runs.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Agent) -> Arc<Agent> {
        let agent = Arc::new(agent);
        self.agents.insert(agent.name.clone(), Arc::clone(&agent));
        agent
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).map(|a| Arc::clone(a.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.remove(name).map(|(_, a)| a)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
