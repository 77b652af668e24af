//! Task planner.
//!
//! Two phases: intent recognition, then plan synthesis. Recognition prefers
//! the semantic router, falls back to a schema-constrained LLM call and
//! finally to keyword heuristics. Synthesis asks the LLM for a structured
//! plan over a categorized tool catalog, then repairs tool choices the
//! catalog cannot satisfy.

use std::fmt;
use std::sync::Arc;

use rago_kernel::{Plan, Session, Step, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::dispatcher::llm_tool_definition;
use crate::error::{AgentError, Result};
use crate::llm::{GenerateOptions, LlmProvider};
use crate::semantic_router::SemanticRouter;

/// Router score at which the planner trusts a semantic match.
pub const ROUTE_THRESHOLD: f32 = 0.75;

/// Confidence reported by the keyword fallback.
const FALLBACK_CONFIDENCE: f32 = 0.3;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    FileCreate,
    FileRead,
    FileEdit,
    WebSearch,
    RagQuery,
    Analysis,
    GeneralQa,
}

impl IntentType {
    pub const ALL: [IntentType; 7] = [
        Self::FileCreate,
        Self::FileRead,
        Self::FileEdit,
        Self::WebSearch,
        Self::RagQuery,
        Self::Analysis,
        Self::GeneralQa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileCreate => "file_create",
            Self::FileRead => "file_read",
            Self::FileEdit => "file_edit",
            Self::WebSearch => "web_search",
            Self::RagQuery => "rag_query",
            Self::Analysis => "analysis",
            Self::GeneralQa => "general_qa",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a recognized intent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Router,
    Llm,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedIntent {
    pub intent_type: IntentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    pub confidence: f32,
    pub source: IntentSource,
    /// Router intent name when the router matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Tool the matched router intent maps to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_tool: Option<String>,
}

impl RecognizedIntent {
    fn keyword(goal: &str) -> Self {
        Self {
            intent_type: IntentType::GeneralQa,
            target_file: extract_target_file(goal),
            topic: None,
            requirements: Vec::new(),
            confidence: FALLBACK_CONFIDENCE,
            source: IntentSource::Keyword,
            route: None,
            suggested_tool: None,
        }
    }
}

/// LLM reply for intent recognition.
#[derive(Debug, Deserialize)]
struct LlmIntent {
    intent_type: String,
    #[serde(default)]
    target_file: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

fn intent_schema() -> Value {
    let types: Vec<&str> = IntentType::ALL.iter().map(IntentType::as_str).collect();
    json!({
        "type": "object",
        "properties": {
            "intent_type": {"type": "string", "enum": types},
            "target_file": {"type": ["string", "null"]},
            "topic": {"type": ["string", "null"]},
            "requirements": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
        },
        "required": ["intent_type", "confidence"],
    })
}

/// First whitespace token that looks like a file path (`name.ext`).
pub fn extract_target_file(goal: &str) -> Option<String> {
    goal.split_whitespace()
        .map(|t| t.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | ',' | ';' | ':' | '(' | ')')))
        .map(|t| t.trim_end_matches(['.', '!', '?']))
        .filter(|t| !t.contains("://"))
        .find(|t| {
            let Some((stem, ext)) = t.rsplit_once('.') else {
                return false;
            };
            let stem = stem.trim_start_matches(['.', '/', '~']);
            !stem.is_empty()
                && (1..=8).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic())
        })
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Tool catalog
// ---------------------------------------------------------------------------

const CATEGORIES: [&str; 5] = [
    "Information Retrieval",
    "File Operations",
    "Database",
    "Web Search",
    "LLM & Generation",
];

fn category(name: &str) -> &'static str {
    let n = name.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| n.contains(k));
    if has(&["rag", "query", "memory", "retriev", "knowledge"]) {
        CATEGORIES[0]
    } else if has(&["file", "write", "read", "dir", "path", "fs"]) {
        CATEGORIES[1]
    } else if has(&["sql", "database", "db", "table"]) {
        CATEGORIES[2]
    } else if has(&["web", "search", "browse", "fetch", "http", "url"]) {
        CATEGORIES[3]
    } else {
        CATEGORIES[4]
    }
}

/// Tools grouped under headings, in a fixed category order.
pub fn render_catalog(tools: &[ToolDefinition]) -> String {
    let mut out = String::new();
    for cat in CATEGORIES {
        let members: Vec<&ToolDefinition> = tools.iter().filter(|t| category(&t.name) == cat).collect();
        if members.is_empty() {
            continue;
        }
        out.push_str(&format!("### {cat}\n"));
        for t in members {
            out.push_str(&format!("- `{}`: {}\n", t.name, t.description));
        }
    }
    out
}

fn find_tool(tools: &[ToolDefinition], keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        tools
            .iter()
            .find(|t| t.name.to_lowercase().contains(k))
            .map(|t| t.name.clone())
    })
}

/// A filesystem write tool from the catalog.
pub fn write_tool(tools: &[ToolDefinition]) -> Option<String> {
    find_tool(tools, &["write_file", "create_file", "save_file", "write"])
}

/// Whether `tool` writes files.
pub fn is_write_tool(tool: &str) -> bool {
    let t = tool.to_lowercase();
    ["write_file", "create_file", "save_file", "write"].iter().any(|k| t.contains(k))
}

const WRITE_PHRASES: [&str; 8] = [
    "save",
    "write to",
    "write it to",
    "write the file",
    "write file",
    "to file",
    "to disk",
    "store it in",
];

fn looks_like_write(description: &str, target_file: Option<&str>) -> bool {
    let d = description.to_lowercase();
    WRITE_PHRASES.iter().any(|p| d.contains(p)) || target_file.is_some_and(|f| d.contains(&f.to_lowercase()))
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Recent session messages shown to the planner.
    pub history: usize,
    pub route_threshold: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2000,
            history: 5,
            route_threshold: ROUTE_THRESHOLD,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    description: String,
    tool: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    /// 1-based numbers of earlier steps this one needs.
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    output_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlannedResponse {
    #[serde(default)]
    reasoning: String,
    steps: Vec<PlannedStep>,
}

/// Decomposes goals into executable plans using an LLM.
pub struct Planner {
    llm: Arc<dyn LlmProvider>,
    router: Option<Arc<SemanticRouter>>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            router: None,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_router(mut self, router: Arc<SemanticRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Classify `goal`. Never fails: the keyword fallback always answers.
    pub async fn recognize_intent(&self, goal: &str) -> RecognizedIntent {
        if let Some(router) = &self.router {
            match router.route(goal).await {
                Ok(m) if m.score >= self.config.route_threshold && !m.name.is_empty() => {
                    tracing::debug!(intent = %m.name, score = m.score, "intent routed");
                    let suggested_tool = router.intent(&m.name).and_then(|i| i.tool().map(str::to_owned));
                    return RecognizedIntent {
                        intent_type: IntentType::parse(&m.name).unwrap_or(IntentType::GeneralQa),
                        target_file: extract_target_file(goal),
                        topic: None,
                        requirements: Vec::new(),
                        confidence: m.score,
                        source: IntentSource::Router,
                        route: Some(m.name),
                        suggested_tool,
                    };
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "semantic routing failed"),
            }
        }

        let prompt = format!(
            "Classify the user's request.\n\nRequest: {goal}\n\n\
             intent_type is one of: {}. Set target_file when the request names a file \
             to create, read or edit. confidence is between 0 and 1.",
            IntentType::ALL.map(|t| t.as_str()).join(", ")
        );
        let opts = GenerateOptions::default().temperature(0.0).max_tokens(300);
        match self.llm.generate_structured(&prompt, &intent_schema(), &opts).await {
            Ok(out) => match serde_json::from_value::<LlmIntent>(out.parsed) {
                Ok(reply) => {
                    if let Some(intent_type) = IntentType::parse(&reply.intent_type) {
                        return RecognizedIntent {
                            intent_type,
                            target_file: reply
                                .target_file
                                .filter(|f| !f.trim().is_empty())
                                .or_else(|| extract_target_file(goal)),
                            topic: reply.topic.filter(|t| !t.trim().is_empty()),
                            requirements: reply.requirements,
                            confidence: reply.confidence.clamp(0.0, 1.0),
                            source: IntentSource::Llm,
                            route: None,
                            suggested_tool: None,
                        };
                    }
                    tracing::warn!(intent_type = %reply.intent_type, "llm returned unknown intent type");
                }
                Err(e) => tracing::warn!(error = %e, "intent reply did not deserialize"),
            },
            Err(e) => tracing::warn!(error = %e, "intent recognition failed; using keyword fallback"),
        }
        RecognizedIntent::keyword(goal)
    }

    /// Recognize the intent and synthesize a plan. LLM failures produce
    /// [`fallback_plan`](Self::fallback_plan); the plan is not persisted.
    pub async fn plan(&self, goal: &str, session: Option<&Session>, tools: &[ToolDefinition]) -> Result<Plan> {
        if goal.trim().is_empty() {
            return Err(AgentError::input("goal is empty"));
        }
        let intent = self.recognize_intent(goal).await;
        let session_id = session.map(|s| s.id.clone()).unwrap_or_default();

        let prompt = self.build_prompt(goal, &intent, session, tools);
        match self.synthesize(&prompt, tools).await {
            Ok(response) => {
                let steps = post_process(response.steps, &intent, tools);
                tracing::info!(steps = steps.len(), intent = %intent.intent_type, "plan synthesized");
                let mut plan = Plan::new(goal, session_id, steps);
                if !response.reasoning.is_empty() {
                    plan = plan.with_reasoning(response.reasoning);
                }
                Ok(plan)
            }
            Err(e) => {
                tracing::warn!(error = %e, "plan synthesis failed; using fallback plan");
                Ok(self.fallback_plan(goal, &session_id, tools))
            }
        }
    }

    /// Single step calling the tool that best matches the goal.
    pub fn fallback_plan(&self, goal: &str, session_id: &str, tools: &[ToolDefinition]) -> Plan {
        let words: Vec<String> = goal
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(str::to_lowercase)
            .collect();
        let best = tools
            .iter()
            .map(|t| {
                let hay = format!("{} {}", t.name, t.description).to_lowercase();
                (words.iter().filter(|w| hay.contains(w.as_str())).count(), t)
            })
            .filter(|(score, _)| *score > 0)
            .fold(None::<(usize, &ToolDefinition)>, |best, cur| match best {
                Some(b) if b.0 >= cur.0 => Some(b),
                _ => Some(cur),
            })
            .map(|(_, t)| t.name.clone());

        let mut args = Map::new();
        let tool = match best {
            Some(name) => {
                args.insert("query".into(), Value::String(goal.to_owned()));
                name
            }
            None => {
                args.insert("prompt".into(), Value::String(goal.to_owned()));
                "llm".to_owned()
            }
        };
        Plan::new(goal, session_id, vec![Step::new(format!("Answer: {goal}"), tool, args)])
            .with_reasoning("fallback plan")
    }

    /// A new plan (new id, same goal and session) that takes `feedback` on
    /// `plan` into account. The original is left untouched.
    pub async fn revise_plan(&self, plan: &Plan, feedback: &str, tools: &[ToolDefinition]) -> Result<Plan> {
        let intent = self.recognize_intent(&plan.goal).await;
        let previous: String = plan
            .steps()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let outcome = s.error.as_deref().map(|e| format!(" (error: {e})")).unwrap_or_default();
                format!("{}. [{}] {} via `{}`{}\n", i + 1, s.status, s.description, s.tool, outcome)
            })
            .collect();
        let prompt = format!(
            "{}\n## Previous Plan\n{previous}\n## Feedback\n{feedback}\n\n\
             Produce a revised plan that addresses the feedback.",
            self.build_prompt(&plan.goal, &intent, None, tools)
        );
        let response = self.synthesize(&prompt, tools).await?;
        let steps = post_process(response.steps, &intent, tools);
        let mut revised = Plan::new(plan.goal.clone(), plan.session_id.clone(), steps);
        if !response.reasoning.is_empty() {
            revised = revised.with_reasoning(response.reasoning);
        }
        tracing::info!(from = %plan.id, to = %revised.id, "plan revised");
        Ok(revised)
    }

    async fn synthesize(&self, prompt: &str, tools: &[ToolDefinition]) -> Result<PlannedResponse> {
        let opts = GenerateOptions::default()
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens);
        let out = self.llm.generate_structured(prompt, &plan_schema(tools), &opts).await?;
        let response: PlannedResponse = serde_json::from_value(out.parsed)?;
        if response.steps.is_empty() {
            return Err(AgentError::PlanningFailed {
                reason: "plan has no steps".into(),
            });
        }
        Ok(response)
    }

    fn build_prompt(
        &self,
        goal: &str,
        intent: &RecognizedIntent,
        session: Option<&Session>,
        tools: &[ToolDefinition],
    ) -> String {
        let mut catalog: Vec<ToolDefinition> = tools.to_vec();
        if !catalog.iter().any(|t| t.name == "llm") {
            catalog.push(llm_tool_definition());
        }

        let mut prompt = format!(
            "You are a task planner. Decompose the goal into the fewest concrete steps.\n\n\
             ## Available Tools\n{}\n## Recognized Intent\ntype: {} (confidence {:.2})\n",
            render_catalog(&catalog),
            intent.intent_type,
            intent.confidence,
        );
        if let Some(f) = &intent.target_file {
            prompt.push_str(&format!("target file: {f}\n"));
        }
        if let Some(t) = &intent.topic {
            prompt.push_str(&format!("topic: {t}\n"));
        }
        if !intent.requirements.is_empty() {
            prompt.push_str(&format!("requirements: {}\n", intent.requirements.join("; ")));
        }

        if let Some(session) = session {
            prompt.push_str("\n## Conversation\n");
            if let Some(summary) = session.summary.as_deref().filter(|s| !s.is_empty()) {
                prompt.push_str(&format!("Summary: {summary}\n"));
            }
            for m in session.last_n_messages(self.config.history) {
                prompt.push_str(&format!("{}: {}\n", m.role.as_str(), m.content));
            }
        }

        prompt.push_str(&format!(
            "\n## Goal\n{goal}\n\n## Rules\n\
             - Use only the tools listed above.\n\
             - Use `{{{{PREVIOUS_OUTPUT}}}}` in an argument to refer to the previous step's result.\n\
             - A file write step without `content` receives the previous step's result.\n\
             - `depends_on` lists the numbers of earlier steps a step needs.\n"
        ));
        prompt
    }
}

fn plan_schema(tools: &[ToolDefinition]) -> Value {
    let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    if !names.contains(&"llm") {
        names.push("llm");
    }
    json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "steps": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "properties": {
                        "description": {"type": "string"},
                        "tool": {"type": "string", "enum": names},
                        "arguments": {"type": "object"},
                        "depends_on": {"type": "array", "items": {"type": "integer", "minimum": 1}},
                        "output_file": {"type": "string"},
                    },
                    "required": ["description", "tool"],
                },
            },
        },
        "required": ["reasoning", "steps"],
    })
}

/// Tool to use in place of one the catalog does not offer.
fn infer_tool(intent: &RecognizedIntent, tools: &[ToolDefinition]) -> String {
    let found = match intent.intent_type {
        IntentType::FileCreate | IntentType::FileEdit => write_tool(tools),
        IntentType::FileRead => find_tool(tools, &["read_file", "read"]),
        IntentType::WebSearch => find_tool(tools, &["web_search", "search", "fetch"]),
        IntentType::RagQuery => find_tool(tools, &["rag_query", "query"]),
        IntentType::Analysis | IntentType::GeneralQa => None,
    };
    found
        .or_else(|| intent.suggested_tool.clone().filter(|t| tools.iter().any(|d| &d.name == t)))
        .unwrap_or_else(|| "llm".to_owned())
}

fn post_process(planned: Vec<PlannedStep>, intent: &RecognizedIntent, tools: &[ToolDefinition]) -> Vec<Step> {
    let known = |name: &str| name == "llm" || tools.iter().any(|t| t.name == name);
    let write = write_tool(tools);
    let target = intent.target_file.as_deref();

    let mut numbers = Vec::with_capacity(planned.len());
    let mut steps: Vec<Step> = planned
        .into_iter()
        .map(|p| {
            numbers.push(p.depends_on);
            let mut tool = p.tool;
            let mut arguments = p.arguments;
            if !known(&tool) {
                let inferred = infer_tool(intent, tools);
                tracing::debug!(from = %tool, to = %inferred, "replacing unknown plan tool");
                tool = inferred;
            }
            if tool == "llm"
                && let Some(w) = &write
                && looks_like_write(&p.description, target)
            {
                tool = w.clone();
            }
            if is_write_tool(&tool)
                && let Some(path) = target
            {
                arguments
                    .entry("path")
                    .or_insert_with(|| Value::String(path.to_owned()));
            }
            let step = Step::new(p.description, tool, arguments);
            match p.output_file.filter(|f| !f.trim().is_empty()) {
                Some(path) => step.output_file(path),
                None => step,
            }
        })
        .collect();

    let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    for (i, (step, deps)) in steps.iter_mut().zip(numbers).enumerate() {
        // Only earlier steps; forward references are dropped.
        step.depends_on = deps
            .into_iter()
            .filter(|n| (1..=i).contains(n))
            .map(|n| ids[n - 1].clone())
            .collect();
    }

    if intent.intent_type == IntentType::FileCreate
        && let (Some(w), Some(path)) = (&write, target)
        && !steps.iter().any(|s| is_write_tool(&s.tool))
    {
        let mut arguments = Map::new();
        arguments.insert("path".into(), Value::String(path.to_owned()));
        steps.push(Step::new(format!("Save the result to {path}"), w.clone(), arguments));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::Intent;
    use crate::llm::{Embedder, ToolResponse};
    use async_trait::async_trait;
    use rago_kernel::Message;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies to `generate` calls from a queue; an empty queue is an error.
    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn generate(&self, prompt: &str, _opts: &GenerateOptions) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::LlmRequestFailed { reason: "script exhausted".into() })
        }

        async fn generate_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> Result<ToolResponse> {
            Ok(ToolResponse::text(""))
        }
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new("rag_query", "Query the knowledge base", json!({})),
            ToolDefinition::new("filesystem.write_file", "Write a file", json!({})),
            ToolDefinition::new("filesystem.read_file", "Read a file", json!({})),
        ]
    }

    const FILE_INTENT: &str = r#"{"intent_type": "file_create", "target_file": "./go.md", "topic": "Go", "confidence": 0.9}"#;

    #[test]
    fn target_files_are_extracted() {
        assert_eq!(
            extract_target_file("Create a markdown about Go and save to ./go.md").as_deref(),
            Some("./go.md")
        );
        assert_eq!(extract_target_file("read 'notes.txt', please").as_deref(), Some("notes.txt"));
        assert_eq!(extract_target_file("see https://example.com/a.html"), None);
        assert_eq!(extract_target_file("version 1.2 is out"), None);
    }

    #[test]
    fn catalog_is_grouped() {
        let mut all = tools();
        all.push(llm_tool_definition());
        let text = render_catalog(&all);
        let ir = text.find("### Information Retrieval").unwrap();
        let files = text.find("### File Operations").unwrap();
        let llm = text.find("### LLM & Generation").unwrap();
        assert!(ir < files && files < llm);
        assert!(text.contains("- `filesystem.write_file`: Write a file"));
    }

    #[tokio::test]
    async fn file_creation_plan_is_repaired() {
        let plan_reply = r#"{"reasoning": "look up, write, save", "steps": [
            {"description": "Look up Go", "tool": "rag_query", "arguments": {"query": "Go"}},
            {"description": "Generate a markdown document about Go", "tool": "llm", "arguments": {}},
            {"description": "Save the document to ./go.md", "tool": "llm", "arguments": {}}
        ]}"#;
        let llm = Scripted::new(&[FILE_INTENT, plan_reply]);
        let planner = Planner::new(llm.clone());
        let plan = planner
            .plan("Create a markdown about Go and save to ./go.md", None, &tools())
            .await
            .unwrap();

        let tools_used: Vec<&str> = plan.steps().iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools_used, ["rag_query", "llm", "filesystem.write_file"]);
        assert_eq!(plan.steps()[2].arguments["path"], "./go.md");
        assert_eq!(plan.reasoning.as_deref(), Some("look up, write, save"));
        assert!(plan.steps().iter().all(|s| s.status == rago_kernel::StepStatus::Pending));
    }

    #[tokio::test]
    async fn missing_write_step_is_appended() {
        let plan_reply = r#"{"reasoning": "", "steps": [
            {"description": "Generate the text", "tool": "llm", "arguments": {}}
        ]}"#;
        let planner = Planner::new(Scripted::new(&[FILE_INTENT, plan_reply]));
        let plan = planner.plan("Write ./go.md about Go", None, &tools()).await.unwrap();
        assert_eq!(plan.steps().len(), 2);
        assert_eq!(plan.steps()[1].tool, "filesystem.write_file");
    }

    #[tokio::test]
    async fn step_numbers_become_dependency_ids() {
        let plan_reply = r#"{"reasoning": "", "steps": [
            {"description": "Search", "tool": "rag_query", "arguments": {"query": "rust"}},
            {"description": "Summarize", "tool": "llm", "depends_on": [1, 3], "output_file": "out/summary.md"}
        ]}"#;
        let intent = r#"{"intent_type": "analysis", "confidence": 0.8}"#;
        let planner = Planner::new(Scripted::new(&[intent, plan_reply]));
        let plan = planner.plan("summarize what we know about rust", None, &tools()).await.unwrap();
        let steps = plan.steps();
        assert!(steps[0].depends_on.is_empty());
        assert_eq!(steps[1].depends_on, vec![steps[0].id.clone()]);
        assert_eq!(steps[1].output_file.as_deref(), Some("out/summary.md"));
    }

    #[tokio::test]
    async fn llm_failure_uses_keyword_intent_and_fallback_plan() {
        let planner = Planner::new(Scripted::new(&[]));
        let intent = planner.recognize_intent("query the knowledge base for rust").await;
        assert_eq!(intent.intent_type, IntentType::GeneralQa);
        assert_eq!(intent.source, IntentSource::Keyword);
        assert!(intent.confidence < 0.5);

        let plan = planner
            .plan("query the knowledge base for rust", None, &tools())
            .await
            .unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].tool, "rag_query");
        assert_eq!(plan.steps()[0].arguments["query"], "query the knowledge base for rust");
    }

    #[tokio::test]
    async fn fallback_without_matching_tool_uses_llm() {
        let planner = Planner::new(Scripted::new(&[]));
        let plan = planner.fallback_plan("hello there", "s1", &tools());
        assert_eq!(plan.steps()[0].tool, "llm");
        assert_eq!(plan.session_id, "s1");
    }

    #[tokio::test]
    async fn revision_creates_a_new_plan() {
        let reply = r#"{"reasoning": "retry", "steps": [
            {"description": "Ask the model", "tool": "llm", "arguments": {"prompt": "x"}}
        ]}"#;
        let llm = Scripted::new(&[
            r#"{"intent_type": "general_qa", "confidence": 0.6}"#,
            reply,
        ]);
        let planner = Planner::new(llm.clone());
        let original = planner.fallback_plan("explain rust", "s1", &[]);
        let revised = planner.revise_plan(&original, "be more detailed", &[]).await.unwrap();
        assert_ne!(revised.id, original.id);
        assert_eq!(revised.goal, original.goal);
        assert_eq!(revised.session_id, "s1");
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[1].contains("be more detailed"));
    }

    struct Vocab;

    #[async_trait]
    impl Embedder for Vocab {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let t = text.to_lowercase();
            Ok(vec![
                if t.contains("read") { 1.0 } else { 0.0 },
                if t.contains("weather") { 1.0 } else { 0.0 },
            ])
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn router_matches_skip_the_llm() {
        let router = Arc::new(SemanticRouter::new(Arc::new(Vocab)));
        router
            .add_intent(Intent::new("file_read", ["read the file"]).with_tool("filesystem.read_file"))
            .await
            .unwrap();
        let llm = Scripted::new(&[]);
        let planner = Planner::new(llm.clone()).with_router(router);
        let intent = planner.recognize_intent("read notes.txt").await;
        assert_eq!(intent.source, IntentSource::Router);
        assert_eq!(intent.intent_type, IntentType::FileRead);
        assert_eq!(intent.target_file.as_deref(), Some("notes.txt"));
        assert_eq!(intent.suggested_tool.as_deref(), Some("filesystem.read_file"));
        assert!(llm.prompts.lock().unwrap().is_empty());
    }
}
