//! Agent runtime.
//!
//! A run loads the session, gathers knowledge and memory context, then
//! alternates LLM calls and tool dispatch until the model answers without
//! calling a tool:
//!
//! 1. Input guardrails, intent recognition, RAG and memory context.
//! 2. The tool loop, bounded by `max_rounds`, with handoffs between agents.
//! 3. Optional verification with up to [`verify::MAX_VERIFY_RETRIES`] retries.
//! 4. Output guardrails, then the session, plan record, memory and
//!    compaction are updated.
//!
//! Progress is reported as [`Event`]s when the caller streams.

pub mod context;
pub mod verify;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rago_kernel::{
    Event, EventPayload, HookData, HookEvent, HookRegistry, Message, Plan, PlanStatus, Role, SpanKind, Step,
    ToolCall, ToolDefinition, TraceContext, Tracer, global_hooks, global_tracer,
};
use rago_store::PlanStore;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::compaction::Compactor;
use crate::config::AgentConfig;
use crate::dispatcher::{DispatchContext, Dispatched, Dispatcher};
use crate::error::{AgentError, Result};
use crate::executor::format_result;
use crate::guardrails::{GuardrailChain, GuardrailContext};
use crate::llm::{LlmProvider, ToolResponse};
use crate::planner::Planner;
use crate::session::SessionManager;
use crate::tools::memory::{StoreRequest, direct_memory_record, is_direct_memory_goal};
use crate::tools::rag::QueryRequest;

use self::context::{EventSink, truncate_chars};

pub const DEFAULT_MAX_ROUNDS: u32 = 15;

/// Characters of a tool result kept in the conversation.
pub const TOOL_RESULT_LIMIT: usize = 5000;

pub const EVENT_BUFFER: usize = 256;

/// Answer returned when the model repeats an identical tool call.
pub const REPEATED_CALL_ANSWER: &str =
    "The task appears to be complete: the same tool call was requested again with identical arguments.";

const HANDOFF_SKIPPED: &str = "Skipped: the conversation was transferred to another agent.";

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub max_rounds: u32,
    /// Check the final answer against the goal.
    pub verify: bool,
    /// Stream LLM output as partial events.
    pub stream: bool,
    pub rag_top_k: usize,
    pub tool_result_limit: usize,
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            verify: false,
            stream: true,
            rag_top_k: 5,
            tool_result_limit: TOOL_RESULT_LIMIT,
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl From<&AgentConfig> for RuntimeConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_rounds: config.max_rounds.max(1),
            verify: config.verify,
            stream: config.stream,
            ..Self::default()
        }
    }
}

/// Allow and deny lists over tool names. An empty allow list, or one
/// containing `*`, allows everything; the deny list always wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolFilter {
    pub fn permits(&self, name: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|a| a == "*" || a == name);
        allowed && !self.deny.iter().any(|d| d == name)
    }

    pub fn apply(&self, mut tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        tools.retain(|t| self.permits(&t.name));
        tools
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub content: String,
    pub session_id: String,
    /// The agent that produced the answer, after any handoffs.
    pub agent: String,
    pub rounds: u32,
    /// `None` when verification did not run.
    pub verified: Option<bool>,
    /// Id of the plan recording this run, when a plan store is configured.
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Chat,
}

/// Per-pass inputs of [`Runtime::run_loop`].
pub(crate) struct LoopInput<'a> {
    pub session_id: &'a str,
    pub max_rounds: u32,
    pub filter: Option<&'a ToolFilter>,
    pub trace: &'a TraceContext,
    pub token: &'a CancellationToken,
    pub sink: &'a EventSink,
}

pub(crate) struct LoopOutput {
    pub content: String,
    pub agent: Arc<Agent>,
    pub rounds: u32,
    /// One `tool: ok|error` line per dispatched call.
    pub log: Vec<String>,
}

/// Tool arguments as an object; JSON-encoded strings are decoded.
fn call_arguments(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// A one-step completed plan recording a direct run.
fn run_record(goal: &str, session_id: &str, agent: &str, content: &str) -> Result<Plan> {
    let mut step = Step::new("Answer the goal", "llm", Map::new());
    step.start()?;
    step.complete(Value::String(content.to_owned()))?;
    let mut plan = Plan::new(goal, session_id, vec![step]).with_reasoning(format!("answered directly by {agent}"));
    plan.start()?;
    plan.finish(PlanStatus::Completed, None)?;
    Ok(plan)
}

pub struct Runtime {
    llm: Arc<dyn LlmProvider>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    agent: Arc<Agent>,
    plans: Option<PlanStore>,
    planner: Option<Arc<Planner>>,
    guardrails: Option<Arc<GuardrailChain>>,
    compactor: Option<Arc<Compactor>>,
    config: RuntimeConfig,
    /// Token of the current run; replaced when a run starts.
    cancel: Mutex<CancellationToken>,
    hooks: &'static HookRegistry,
    tracer: &'static Tracer,
}

impl Runtime {
    /// A runtime whose entry agent is `agent`. The agent is registered with
    /// the dispatcher so other agents can hand back to it.
    pub fn new(llm: Arc<dyn LlmProvider>, dispatcher: Arc<Dispatcher>, agent: Agent) -> Self {
        let agent = dispatcher.agents().register(agent);
        Self {
            llm,
            dispatcher,
            sessions: Arc::new(SessionManager::new()),
            agent,
            plans: None,
            planner: None,
            guardrails: None,
            compactor: None,
            config: RuntimeConfig::default(),
            cancel: Mutex::new(CancellationToken::new()),
            hooks: global_hooks(),
            tracer: global_tracer(),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Record each run as a completed plan.
    pub fn with_plan_store(mut self, plans: PlanStore) -> Self {
        self.plans = Some(plans);
        self
    }

    /// Recognize the goal's intent before each run.
    pub fn with_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_guardrails(mut self, guardrails: Arc<GuardrailChain>) -> Self {
        self.guardrails = Some(guardrails);
        self
    }

    pub fn with_compactor(mut self, compactor: Arc<Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: &'static HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_tracer(mut self, tracer: &'static Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn llm(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn hooks(&self) -> &'static HookRegistry {
        self.hooks
    }

    pub(crate) fn tracer(&self) -> &'static Tracer {
        self.tracer
    }

    /// Run `goal` to completion in the given session, or a new one.
    pub async fn run(&self, goal: &str, session_id: Option<&str>) -> Result<RunOutput> {
        let token = self.begin();
        self.execute(goal, session_id, Mode::Run, &EventSink::none(), &token).await
    }

    /// One conversational turn: the full loop without verification or
    /// intent recognition.
    pub async fn chat(&self, message: &str, session_id: Option<&str>) -> Result<RunOutput> {
        let token = self.begin();
        self.execute(message, session_id, Mode::Chat, &EventSink::none(), &token).await
    }

    /// Run `goal` on a background task and stream its events. The channel
    /// closes after the terminal `workflow_complete` or `workflow_error`.
    pub fn run_stream(self: &Arc<Self>, goal: impl Into<String>, session_id: Option<String>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let token = self.begin();
        let this = Arc::clone(self);
        let goal = goal.into();
        tokio::spawn(async move {
            let sink = EventSink::new(tx);
            if let Err(e) = this.execute(&goal, session_id.as_deref(), Mode::Run, &sink, &token).await {
                tracing::debug!(error = %e, "streamed run ended with error");
            }
        });
        rx
    }

    /// Cancel the run in progress, if any.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    async fn execute(
        &self,
        goal: &str,
        session_id: Option<&str>,
        mode: Mode,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<RunOutput> {
        let goal = goal.trim();
        if goal.is_empty() {
            let err = AgentError::input("goal must not be empty");
            sink.emit_terminal(&self.agent.name, EventPayload::WorkflowError { error: err.to_string() })
                .await;
            return Err(err);
        }
        let session = match self.sessions.load_or_create(session_id, &self.agent.name).await {
            Ok(s) => s,
            Err(e) => {
                sink.emit_terminal(&self.agent.name, EventPayload::WorkflowError { error: e.to_string() })
                    .await;
                return Err(e);
            }
        };
        let sid = session.id.clone();

        let span = self.tracer.start_span(
            &TraceContext::root(),
            format!("agent:{}", self.agent.name),
            SpanKind::Agent,
        );
        self.tracer.set_attribute(&span, "session_id", sid.clone());
        tracing::info!(agent = %self.agent.name, session_id = %sid, "run started");
        sink.emit(
            &self.agent.name,
            EventPayload::WorkflowStart {
                goal: goal.to_owned(),
                session_id: sid.clone(),
            },
        );

        match self.drive(goal, &session, mode, sink, token, &span).await {
            Ok(out) => {
                self.tracer.end_span(&span, None);
                tracing::info!(agent = %out.agent, session_id = %sid, rounds = out.rounds, "run completed");
                sink.emit_terminal(
                    &out.agent,
                    EventPayload::WorkflowComplete {
                        content: out.content.clone(),
                    },
                )
                .await;
                self.hooks
                    .emit(
                        HookEvent::AgentStop,
                        HookData::agent(out.agent.clone())
                            .with_session(sid)
                            .with_output(json!(out.content)),
                    )
                    .await;
                Ok(out)
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.tracer.cancel_span(&span);
                } else {
                    self.tracer.end_span(&span, Some(&e.to_string()));
                }
                tracing::warn!(agent = %self.agent.name, session_id = %sid, error = %e, "run failed");
                sink.emit_terminal(&self.agent.name, EventPayload::WorkflowError { error: e.to_string() })
                    .await;
                self.hooks
                    .emit(
                        HookEvent::AgentStop,
                        HookData::agent(self.agent.name.clone())
                            .with_session(sid)
                            .with_error(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        goal: &str,
        session: &rago_kernel::Session,
        mode: Mode,
        sink: &EventSink,
        token: &CancellationToken,
        span: &TraceContext,
    ) -> Result<RunOutput> {
        let sid = session.id.as_str();
        self.hooks
            .emit_with_result(
                HookEvent::AgentStart,
                HookData::agent(self.agent.name.clone())
                    .with_session(sid)
                    .with_metadata("goal", goal),
            )
            .await?;

        let guard_ctx = GuardrailContext {
            session_id: Some(sid.to_owned()),
            agent: Some(self.agent.name.clone()),
            trace: span.clone(),
        };
        let goal = match &self.guardrails {
            Some(chain) => chain.check_input(goal, &guard_ctx).await.into_result()?,
            None => goal.to_owned(),
        };

        let intent = match (&self.planner, mode) {
            (Some(planner), Mode::Run) => Some(planner.recognize_intent(&goal).await),
            _ => None,
        };
        if token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let (knowledge, memory) = self.gather_context(&goal, sid).await;
        let mut messages = vec![Message::system(String::new())];
        messages.extend(context::history(session));
        messages.push(Message::user(context::first_user_message(&goal, &knowledge, &memory)));

        let input = LoopInput {
            session_id: sid,
            max_rounds: self.config.max_rounds,
            filter: None,
            trace: span,
            token,
            sink,
        };
        let mut out = self.run_loop(Arc::clone(&self.agent), &mut messages, &input).await?;

        let mut verified = None;
        if self.config.verify && mode == Mode::Run {
            let mut retries = 0;
            loop {
                let verdict = verify::verify(self.llm.as_ref(), &goal, &out.content).await;
                verified = Some(verdict.verified);
                if !verdict.should_retry() || retries >= verify::MAX_VERIFY_RETRIES {
                    if !verdict.verified {
                        tracing::warn!(session_id = sid, reason = %verdict.reason, "answer not verified");
                    }
                    break;
                }
                retries += 1;
                tracing::info!(session_id = sid, retries, reason = %verdict.reason, "retrying unverified answer");
                messages.push(Message::assistant(out.content.clone()));
                messages.push(Message::user(verify::retry_goal(&goal, &verdict)));
                let previous_rounds = out.rounds;
                let mut log = std::mem::take(&mut out.log);
                out = self.run_loop(Arc::clone(&out.agent), &mut messages, &input).await?;
                out.rounds += previous_rounds;
                log.append(&mut out.log);
                out.log = log;
            }
        }

        let content = match &self.guardrails {
            Some(chain) => {
                let ctx = GuardrailContext {
                    agent: Some(out.agent.name.clone()),
                    ..guard_ctx
                };
                chain.check_output(&out.content, &ctx).await.into_result()?
            }
            None => out.content.clone(),
        };

        let plan_id = self.finalize(&goal, sid, &out, &content, intent).await?;
        Ok(RunOutput {
            content,
            session_id: sid.to_owned(),
            agent: out.agent.name.clone(),
            rounds: out.rounds,
            verified,
            plan_id,
        })
    }

    async fn gather_context(&self, goal: &str, session_id: &str) -> (String, String) {
        let knowledge = match self.dispatcher.rag() {
            Some(rag) => match rag.query(QueryRequest::new(goal).top_k(self.config.rag_top_k)).await {
                Ok(response) => response.context(),
                Err(e) => {
                    tracing::warn!(error = %e, "knowledge retrieval failed");
                    String::new()
                }
            },
            None => String::new(),
        };
        let memory = match self.dispatcher.memory() {
            Some(memory) => match memory.retrieve_and_inject(goal, Some(session_id)).await {
                Ok((rendered, records)) => {
                    tracing::debug!(memories = records.len(), "memory context retrieved");
                    rendered
                }
                Err(e) => {
                    tracing::warn!(error = %e, "memory retrieval failed");
                    String::new()
                }
            },
            None => String::new(),
        };
        (knowledge, memory)
    }

    async fn finalize(
        &self,
        goal: &str,
        sid: &str,
        out: &LoopOutput,
        content: &str,
        intent: Option<crate::planner::RecognizedIntent>,
    ) -> Result<Option<String>> {
        self.sessions.add_message(sid, Message::user(goal))?;
        self.sessions.add_message(sid, Message::assistant(content))?;
        if let Some(intent) = intent {
            self.sessions.set_context(sid, "intent", serde_json::to_value(intent)?)?;
        }
        self.sessions.save(sid).await?;

        let plan_id = match &self.plans {
            Some(plans) => {
                let plan = run_record(goal, sid, &out.agent.name, content)?;
                plans.save(&plan).await?;
                Some(plan.id)
            }
            None => None,
        };

        if let Some(memory) = self.dispatcher.memory() {
            if is_direct_memory_goal(goal) {
                match memory.add(direct_memory_record(goal).with_session(sid)).await {
                    Ok(id) => tracing::info!(memory_id = %id, "stored memory from goal"),
                    Err(e) => tracing::warn!(error = %e, "direct memory write failed"),
                }
            } else {
                let memory = Arc::clone(memory);
                let request = StoreRequest {
                    goal: goal.to_owned(),
                    result: content.to_owned(),
                    execution_log: out.log.clone(),
                    session_id: Some(sid.to_owned()),
                };
                tokio::spawn(async move {
                    if let Err(e) = memory.store_if_worthwhile(request).await {
                        tracing::warn!(error = %e, "memory store failed");
                    }
                });
            }
        }

        if let Some(compactor) = &self.compactor
            && let Some(session) = self.sessions.get(sid)
            && compactor.needs_compaction(&session)
        {
            match compactor.compact(&self.sessions, sid).await {
                Ok(true) => self.sessions.save(sid).await?,
                Ok(false) => {}
                Err(e) => tracing::warn!(session_id = sid, error = %e, "compaction failed"),
            }
        }
        Ok(plan_id)
    }

    /// The LLM/tool loop shared by runs and sub-agents.
    ///
    /// `messages[0]` is rewritten with the acting agent's system prompt each
    /// round. Returns the first tool-free answer.
    pub(crate) async fn run_loop(
        &self,
        agent: Arc<Agent>,
        messages: &mut Vec<Message>,
        input: &LoopInput<'_>,
    ) -> Result<LoopOutput> {
        let mut current = agent;
        let mut seen = HashSet::new();
        let mut log = Vec::new();

        for round in 1..=input.max_rounds {
            if input.token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let system = Message::system(context::system_prompt(&current));
            match messages.first_mut() {
                Some(first) if first.role == Role::System => *first = system,
                _ => messages.insert(0, system),
            }

            let mut tools = self.dispatcher.tools_for(Some(current.as_ref())).await;
            if let Some(filter) = input.filter {
                tools = filter.apply(tools);
            }
            tracing::debug!(agent = %current.name, round, tools = tools.len(), "loop round");
            input.sink.emit(&current.name, EventPayload::Thinking { round });

            let response = self.call_llm(&current, messages, &tools, input).await?;
            if response.tool_calls.is_empty() {
                return Ok(LoopOutput {
                    content: response.content,
                    agent: current,
                    rounds: round,
                    log,
                });
            }
            tracing::info!(
                agent = %current.name,
                round,
                tools = ?response.tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "model requested tool calls"
            );
            messages.push(response.to_message());

            let mut next = None;
            for call in &response.tool_calls {
                if next.is_some() {
                    messages.push(Message::tool_result(&call.id, HANDOFF_SKIPPED));
                    continue;
                }
                if !seen.insert(call.fingerprint()) {
                    tracing::warn!(tool = %call.name, "repeated tool call; ending loop");
                    return Ok(LoopOutput {
                        content: REPEATED_CALL_ANSWER.to_owned(),
                        agent: current,
                        rounds: round,
                        log,
                    });
                }
                input.sink.emit(
                    &current.name,
                    EventPayload::ToolCall {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                );

                let outcome = if input.filter.is_some() && !tools.iter().any(|t| t.name == call.name) {
                    Err(AgentError::tool(&call.name, "tool is not available to this agent"))
                } else {
                    self.call_tool(&current, call, input).await
                };

                match outcome {
                    Ok(Dispatched::Handoff { handoff, target }) => {
                        self.hand_off(&current, &target, input).await;
                        messages.push(Message::tool_result(&call.id, format!("Transferred to {}.", target.name)));
                        let rest = messages.split_off(1);
                        messages.extend(handoff.filter_input(rest));
                        log.push(format!("handoff: {} -> {}", current.name, target.name));
                        next = Some(target);
                    }
                    Ok(Dispatched::Output(value)) => {
                        let text = truncate_chars(&format_result(&value), self.config.tool_result_limit);
                        input.sink.emit(
                            &current.name,
                            EventPayload::ToolResult {
                                call_id: call.id.clone(),
                                name: call.name.clone(),
                                result: text.clone(),
                                is_error: false,
                            },
                        );
                        messages.push(Message::tool_result(&call.id, text));
                        log.push(format!("{}: ok", call.name));
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                        let text = format!("Error: {e}");
                        input.sink.emit(
                            &current.name,
                            EventPayload::ToolResult {
                                call_id: call.id.clone(),
                                name: call.name.clone(),
                                result: text.clone(),
                                is_error: true,
                            },
                        );
                        messages.push(Message::tool_result(&call.id, text));
                        log.push(format!("{}: error", call.name));
                    }
                }
            }
            if let Some(target) = next {
                current = target;
            }
        }

        Err(AgentError::MaxRoundsExceeded {
            max_rounds: input.max_rounds,
        })
    }

    async fn call_llm(
        &self,
        agent: &Agent,
        messages: &[Message],
        tools: &[ToolDefinition],
        input: &LoopInput<'_>,
    ) -> Result<ToolResponse> {
        let opts = agent.generate_options();
        self.hooks
            .emit(
                HookEvent::PreLlmCall,
                HookData::agent(agent.name.clone())
                    .with_session(input.session_id)
                    .with_metadata("messages", messages.len())
                    .with_metadata("tools", tools.len()),
            )
            .await;
        let span = self.tracer.start_span(input.trace, "llm", SpanKind::Llm);

        let call = async {
            if self.config.stream {
                let sink = input.sink.clone();
                let name = agent.name.clone();
                let mut on_chunk = move |text: &str, _calls: &[ToolCall]| {
                    if !text.is_empty() {
                        sink.emit(&name, EventPayload::Partial { content: text.to_owned() });
                    }
                };
                self.llm.stream_with_tools(messages, tools, &opts, &mut on_chunk).await
            } else {
                self.llm.generate_with_tools(messages, tools, &opts).await
            }
        };
        let result = tokio::select! {
            r = call => r,
            () = input.token.cancelled() => Err(AgentError::Cancelled),
        };

        let post = HookData::agent(agent.name.clone()).with_session(input.session_id);
        let post = match &result {
            Ok(response) => {
                self.tracer.set_attribute(&span, "tool_calls", response.tool_calls.len());
                self.tracer.end_span(&span, None);
                post.with_output(json!({
                    "content": response.content,
                    "tool_calls": response.tool_calls.len(),
                }))
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.tracer.cancel_span(&span);
                } else {
                    self.tracer.end_span(&span, Some(&e.to_string()));
                }
                post.with_error(e.to_string())
            }
        };
        self.hooks.emit(HookEvent::PostLlmCall, post).await;
        result
    }

    async fn call_tool(&self, agent: &Agent, call: &ToolCall, input: &LoopInput<'_>) -> Result<Dispatched> {
        let data = HookData::tool(call.name.clone(), Value::Object(call_arguments(&call.arguments)))
            .with_agent(agent.name.clone())
            .with_session(input.session_id);
        let data = self
            .hooks
            .emit_with_result(HookEvent::PreToolUse, data)
            .await
            .map_err(|e| AgentError::tool(&call.name, format!("blocked by hook: {e}")))?;
        let args = match &data.input {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let span = self.tracer.start_span(input.trace, format!("tool:{}", call.name), SpanKind::Tool);
        let ctx = DispatchContext::new(agent, input.session_id);
        let result = tokio::select! {
            r = self.dispatcher.dispatch(&call.name, &args, ctx) => r,
            () = input.token.cancelled() => Err(AgentError::Cancelled),
        };

        let post = match &result {
            Ok(Dispatched::Output(value)) => {
                self.tracer.end_span(&span, None);
                data.with_output(value.clone())
            }
            Ok(Dispatched::Handoff { target, .. }) => {
                self.tracer.end_span(&span, None);
                data.with_output(json!({ "handoff": target.name }))
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.tracer.cancel_span(&span);
                } else {
                    self.tracer.end_span(&span, Some(&e.to_string()));
                }
                data.with_error(e.to_string())
            }
        };
        self.hooks.emit(HookEvent::PostToolUse, post).await;
        result
    }

    async fn hand_off(&self, from: &Agent, to: &Agent, input: &LoopInput<'_>) {
        tracing::info!(from = %from.name, to = %to.name, "handoff");
        self.hooks
            .emit(
                HookEvent::Handoff,
                HookData::agent(from.name.clone())
                    .with_session(input.session_id)
                    .with_metadata("to", to.name.clone()),
            )
            .await;
        let span = self.tracer.start_span(
            input.trace,
            format!("handoff:{}->{}", from.name, to.name),
            SpanKind::Handoff,
        );
        self.tracer.end_span(&span, None);
        input.sink.emit(
            &from.name,
            EventPayload::Handoff {
                from: from.name.clone(),
                to: to.name.clone(),
            },
        );
        if let Err(e) = self.sessions.add_handoff_message(input.session_id, &from.name, &to.name) {
            tracing::debug!(error = %e, "handoff not recorded in session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FunctionTool, Handoff};
    use crate::guardrails::{Guardrail, GuardrailKind, GuardrailResult};
    use crate::llm::GenerateOptions;
    use async_trait::async_trait;
    use rago_kernel::EventKind;
    use std::collections::VecDeque;

    /// Replays queued responses and records the messages it was sent.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<ToolResponse>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl Scripted {
        fn new(replies: Vec<ToolResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
            Ok(r#"{"verified": true, "reason": "ok", "needs_retry": false}"#.into())
        }

        async fn generate_with_tools(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> Result<ToolResponse> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ToolResponse::text("done")))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    fn isolated(runtime: Runtime) -> Runtime {
        runtime
            .with_hooks(Box::leak(Box::new(HookRegistry::new())))
            .with_tracer(Box::leak(Box::new(Tracer::new())))
    }

    fn echo_agent() -> Agent {
        Agent::new("main", "Be brief.").with_function_tool(FunctionTool::new(
            "echo",
            "Echo the text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args| async move { Ok(args.get("text").cloned().unwrap_or(Value::Null)) },
        ))
    }

    #[tokio::test]
    async fn answers_without_tools() {
        let llm = Scripted::new(vec![ToolResponse::text("Hello!")]);
        let rt = isolated(Runtime::new(llm.clone(), Arc::new(Dispatcher::new()), Agent::new("main", "")));
        let out = rt.run("Say hello", None).await.unwrap();
        assert_eq!(out.content, "Hello!");
        assert_eq!(out.rounds, 1);
        let session = rt.sessions().get(&out.session_id).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "Say hello");

        let sent = &llm.seen.lock().unwrap()[0];
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.contains("## System Context"));
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_round() {
        let llm = Scripted::new(vec![
            ToolResponse::calls(vec![call("c1", "echo", json!({"text": "pong"}))]),
            ToolResponse::text("got pong"),
        ]);
        let rt = isolated(Runtime::new(llm.clone(), Arc::new(Dispatcher::new()), echo_agent()));
        let out = rt.run("ping", None).await.unwrap();
        assert_eq!(out.content, "got pong");
        assert_eq!(out.rounds, 2);
        let second = &llm.seen.lock().unwrap()[1];
        let result = second.last().unwrap();
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.content, "pong");
    }

    #[tokio::test]
    async fn repeated_call_ends_the_loop() {
        let same = || ToolResponse::calls(vec![call("c", "echo", json!({"text": "x"}))]);
        let llm = Scripted::new(vec![same(), same(), same()]);
        let rt = isolated(Runtime::new(llm, Arc::new(Dispatcher::new()), echo_agent()));
        let out = rt.run("loop", None).await.unwrap();
        assert_eq!(out.content, REPEATED_CALL_ANSWER);
        assert_eq!(out.rounds, 2);
    }

    #[tokio::test]
    async fn max_rounds_is_an_error_and_leaves_session_untouched() {
        let replies = (0..5)
            .map(|i| ToolResponse::calls(vec![call("c", "echo", json!({ "text": i }))]))
            .collect();
        let rt = isolated(
            Runtime::new(Scripted::new(replies), Arc::new(Dispatcher::new()), echo_agent()).with_config(
                RuntimeConfig {
                    max_rounds: 3,
                    ..RuntimeConfig::default()
                },
            ),
        );
        let session = rt.sessions().create("main");
        let err = rt.run("go", Some(&session.id)).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxRoundsExceeded { max_rounds: 3 }));
        assert!(rt.sessions().get(&session.id).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_the_model() {
        let llm = Scripted::new(vec![
            ToolResponse::calls(vec![call("c1", "nope", json!({}))]),
            ToolResponse::text("sorry"),
        ]);
        let rt = isolated(Runtime::new(llm.clone(), Arc::new(Dispatcher::new()), Agent::new("main", "")));
        assert_eq!(rt.run("x", None).await.unwrap().content, "sorry");
        let second = &llm.seen.lock().unwrap()[1];
        assert!(second.last().unwrap().content.starts_with("Error: "));
    }

    #[tokio::test]
    async fn handoff_switches_agents_and_skips_remaining_calls() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.agents().register(Agent::new("billing", "You handle invoices."));
        let llm = Scripted::new(vec![
            ToolResponse::calls(
                vec![
                    call("h", "transfer_to_billing", json!({"reason": "invoice"})),
                    call("e", "echo", json!({"text": "late"})),
                ],
            ),
            ToolResponse::text("Invoice sent."),
        ]);
        let agent = echo_agent().with_handoff(Handoff::to("billing"));
        let rt = isolated(Runtime::new(llm.clone(), dispatcher, agent));

        let out = rt.run("Where is my invoice?", None).await.unwrap();
        assert_eq!(out.agent, "billing");
        let second = &llm.seen.lock().unwrap()[1];
        assert!(second[0].content.starts_with("You handle invoices."));
        assert_eq!(second.last().unwrap().content, HANDOFF_SKIPPED);
        let session = rt.sessions().get(&out.session_id).unwrap();
        assert_eq!(session.agent_id, "billing");
    }

    #[tokio::test]
    async fn output_guardrail_blocks_the_answer() {
        let chain = GuardrailChain::new().with(Guardrail::new(
            "no-secrets",
            GuardrailKind::Output,
            |content: &str, _: &GuardrailContext| {
                if content.contains("secret") {
                    GuardrailResult::fail("leaks a secret")
                } else {
                    GuardrailResult::pass()
                }
            },
        ));
        let llm = Scripted::new(vec![ToolResponse::text("the secret is 42")]);
        let rt = isolated(
            Runtime::new(llm, Arc::new(Dispatcher::new()), Agent::new("main", ""))
                .with_guardrails(Arc::new(chain.with_hooks(Box::leak(Box::new(HookRegistry::new()))))),
        );
        let err = rt.run("tell me", None).await.unwrap_err();
        assert!(matches!(err, AgentError::Guardrail { .. }));
    }

    #[tokio::test]
    async fn stream_ends_with_terminal_event() {
        let llm = Scripted::new(vec![
            ToolResponse::calls(vec![call("c1", "echo", json!({"text": "hi"}))]),
            ToolResponse::text("all done"),
        ]);
        let rt = Arc::new(isolated(Runtime::new(llm, Arc::new(Dispatcher::new()), echo_agent())));
        let mut rx = rt.run_stream("stream it", None);
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds.first(), Some(&EventKind::WorkflowStart));
        assert_eq!(kinds.last(), Some(&EventKind::WorkflowComplete));
        assert!(kinds.contains(&EventKind::ToolCall));
        assert!(kinds.contains(&EventKind::ToolResult));
        assert!(kinds.contains(&EventKind::Partial));
    }

    #[tokio::test]
    async fn empty_goal_is_rejected() {
        let rt = isolated(Runtime::new(
            Scripted::new(vec![]),
            Arc::new(Dispatcher::new()),
            Agent::new("main", ""),
        ));
        assert!(matches!(rt.run("  ", None).await, Err(AgentError::Input { .. })));
    }

    #[test]
    fn filter_deny_wins() {
        let filter = ToolFilter {
            allow: vec!["*".into()],
            deny: vec!["shell".into()],
        };
        assert!(filter.permits("echo"));
        assert!(!filter.permits("shell"));
        let only = ToolFilter {
            allow: vec!["echo".into()],
            deny: vec![],
        };
        assert!(!only.permits("other"));
    }

    #[test]
    fn string_arguments_are_decoded() {
        assert_eq!(call_arguments(&json!("{\"a\": 1}"))["a"], 1);
        assert!(call_arguments(&json!("not json")).is_empty());
    }
}
