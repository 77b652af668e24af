//! Sub-agents: bounded child runs of an agent.
//!
//! A sub-agent runs the runtime's tool loop for one goal in its own session,
//! limited to `max_turns` rounds and a filtered tool set. It may carry a
//! timeout and a retry budget, and can be paused, resumed with a new goal or
//! cancelled while running. State moves only along
//! `pending -> running -> {completed, failed, cancelled, timeout, paused}`,
//! with `paused -> running` through [`SubAgent::resume`].

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rago_kernel::{Event, EventPayload, HookData, HookEvent, Message, SpanKind, TraceContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::runtime::context::{self, EventSink};
use crate::runtime::{EVENT_BUFFER, LoopInput, Runtime, ToolFilter};

pub const DEFAULT_MAX_TURNS: u32 = 10;

const PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentMode {
    /// The caller awaits [`SubAgent::run`].
    #[default]
    Foreground,
    /// The caller consumes [`SubAgent::run_async`].
    Background,
}

impl SubAgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentState {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
    Timeout,
}

impl SubAgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout)
    }

    pub fn can_transition_to(&self, next: SubAgentState) -> bool {
        use SubAgentState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed | Failed | Cancelled | Timeout | Paused)
                | (Paused, Running)
        )
    }
}

impl fmt::Display for SubAgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SubAgentConfig {
    pub goal: String,
    pub mode: SubAgentMode,
    pub max_turns: u32,
    /// Start from the parent's context only, without its history.
    pub isolated: bool,
    pub tools: ToolFilter,
    pub parent_session: Option<String>,
    /// Extra context shown with the goal and stored on the session.
    pub user_context: Map<String, Value>,
    pub timeout: Option<Duration>,
    /// Further attempts after a failed one.
    pub retry_on_failure: u32,
}

impl SubAgentConfig {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            mode: SubAgentMode::default(),
            max_turns: DEFAULT_MAX_TURNS,
            isolated: true,
            tools: ToolFilter::default(),
            parent_session: None,
            user_context: Map::new(),
            timeout: None,
            retry_on_failure: 0,
        }
    }

    pub fn mode(mut self, mode: SubAgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns;
        self
    }

    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn allow_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.allow = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn deny_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.deny = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn parent_session(mut self, id: impl Into<String>) -> Self {
        self.parent_session = Some(id.into());
        self
    }

    pub fn user_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_context.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_on_failure(mut self, retries: u32) -> Self {
        self.retry_on_failure = retries;
        self
    }
}

/// One progress report on a sub-agent's channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentProgress {
    pub subagent_id: String,
    pub state: SubAgentState,
    pub turn: u32,
    pub message: String,
}

/// Point-in-time view of a sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentStatus {
    pub id: String,
    pub agent: String,
    pub mode: SubAgentMode,
    pub state: SubAgentState,
    pub goal: String,
    pub session_id: String,
    pub turn: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

struct Inner {
    state: SubAgentState,
    goal: String,
    turn: u32,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    result: Option<String>,
    error: Option<String>,
    token: CancellationToken,
    progress: broadcast::Sender<SubAgentProgress>,
    /// Bumped by resume so a superseded run leaves the state alone.
    generation: u64,
}

pub struct SubAgent {
    id: String,
    agent: Arc<Agent>,
    runtime: Arc<Runtime>,
    session_id: String,
    mode: SubAgentMode,
    max_turns: u32,
    tools: ToolFilter,
    user_context: Map<String, Value>,
    timeout: Option<Duration>,
    retry_on_failure: u32,
    inner: RwLock<Inner>,
}

impl fmt::Debug for SubAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAgent")
            .field("id", &self.id)
            .field("agent", &self.agent.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SubAgent {
    /// Validate `config` and create the sub-agent's session.
    ///
    /// With a parent session, an isolated sub-agent copies only the parent's
    /// context map; a non-isolated one also starts from its history.
    pub fn new(runtime: Arc<Runtime>, agent: Agent, config: SubAgentConfig) -> Result<Self> {
        let goal = config.goal.trim().to_owned();
        if goal.is_empty() {
            return Err(AgentError::input("sub-agent goal must not be empty"));
        }
        let max_turns = if config.max_turns == 0 {
            DEFAULT_MAX_TURNS
        } else {
            config.max_turns
        };

        let sessions = runtime.sessions();
        let session = sessions.create(&agent.name);
        if let Some(parent_id) = &config.parent_session {
            let parent = sessions
                .get(parent_id)
                .ok_or_else(|| AgentError::input(format!("unknown parent session: {parent_id}")))?;
            for (key, value) in parent.context {
                sessions.set_context(&session.id, &key, value)?;
            }
            if !config.isolated {
                for message in parent.messages {
                    sessions.add_message(&session.id, message)?;
                }
            }
            sessions.set_context(&session.id, "parent_session", Value::String(parent_id.clone()))?;
        }
        for (key, value) in &config.user_context {
            sessions.set_context(&session.id, key, value.clone())?;
        }

        let id = rago_kernel::new_id();
        tracing::debug!(subagent_id = %id, agent = %agent.name, session_id = %session.id, "sub-agent created");
        Ok(Self {
            id,
            agent: Arc::new(agent),
            runtime,
            session_id: session.id,
            mode: config.mode,
            max_turns,
            tools: config.tools,
            user_context: config.user_context,
            timeout: config.timeout,
            retry_on_failure: config.retry_on_failure,
            inner: RwLock::new(Inner {
                state: SubAgentState::Pending,
                goal,
                turn: 0,
                started_at: None,
                ended_at: None,
                result: None,
                error: None,
                token: CancellationToken::new(),
                progress: broadcast::channel(PROGRESS_BUFFER).0,
                generation: 0,
            }),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> SubAgentMode {
        self.mode
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn state(&self) -> SubAgentState {
        self.read(|i| i.state)
    }

    pub fn goal(&self) -> String {
        self.read(|i| i.goal.clone())
    }

    pub fn result(&self) -> Option<String> {
        self.read(|i| i.result.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.read(|i| i.error.clone())
    }

    pub fn status(&self) -> SubAgentStatus {
        self.read(|i| SubAgentStatus {
            id: self.id.clone(),
            agent: self.agent.name.clone(),
            mode: self.mode,
            state: i.state,
            goal: i.goal.clone(),
            session_id: self.session_id.clone(),
            turn: i.turn,
            started_at: i.started_at,
            ended_at: i.ended_at,
            result: i.result.clone(),
            error: i.error.clone(),
        })
    }

    /// Progress reports until the current run ends. Resume opens a new
    /// channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SubAgentProgress> {
        self.read(|i| i.progress.subscribe())
    }

    fn report(&self, message: impl Into<String>) {
        let (progress, state, turn) = self.read(|i| (i.progress.clone(), i.state, i.turn));
        // No receivers is fine.
        let _ = progress.send(SubAgentProgress {
            subagent_id: self.id.clone(),
            state,
            turn,
            message: message.into(),
        });
    }

    fn transition(&self, inner: &mut Inner, next: SubAgentState, action: &'static str) -> Result<()> {
        if !inner.state.can_transition_to(next) {
            return Err(AgentError::InvalidState {
                entity: "sub-agent",
                state: inner.state.to_string(),
                action,
            });
        }
        inner.state = next;
        Ok(())
    }

    /// Run the goal under a child of `parent`. Only legal while pending.
    pub async fn run(&self, parent: &CancellationToken) -> Result<String> {
        let generation = self.write(|inner| {
            self.transition(inner, SubAgentState::Running, "run")?;
            inner.started_at = Some(rago_kernel::now());
            inner.token = parent.child_token();
            Ok::<_, AgentError>(inner.generation)
        })?;
        self.runtime
            .hooks()
            .emit(
                HookEvent::SubagentStart,
                HookData::agent(self.agent.name.clone())
                    .with_session(self.session_id.clone())
                    .with_metadata("subagent_id", self.id.clone())
                    .with_metadata("mode", self.mode.as_str())
                    .with_metadata("goal", self.goal()),
            )
            .await;
        self.report("started");
        self.execute(generation).await
    }

    /// Stop a running sub-agent without ending it; the run in progress
    /// returns [`AgentError::Cancelled`].
    pub fn pause(&self) -> Result<()> {
        self.write(|inner| {
            self.transition(inner, SubAgentState::Paused, "pause")?;
            inner.token.cancel();
            Ok::<_, AgentError>(())
        })?;
        tracing::info!(subagent_id = %self.id, "sub-agent paused");
        self.report("paused");
        Ok(())
    }

    /// Continue a paused sub-agent with `goal`.
    pub async fn resume(&self, parent: &CancellationToken, goal: impl Into<String>) -> Result<String> {
        let goal = goal.into();
        let generation = self.write(|inner| {
            self.transition(inner, SubAgentState::Running, "resume")?;
            inner.goal = goal;
            inner.token = parent.child_token();
            inner.progress = broadcast::channel(PROGRESS_BUFFER).0;
            inner.generation += 1;
            Ok::<_, AgentError>(inner.generation)
        })?;
        tracing::info!(subagent_id = %self.id, "sub-agent resumed");
        self.report("resumed");
        self.execute(generation).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.write(|inner| {
            self.transition(inner, SubAgentState::Cancelled, "cancel")?;
            inner.token.cancel();
            inner.ended_at = Some(rago_kernel::now());
            Ok::<_, AgentError>(())
        })?;
        tracing::info!(subagent_id = %self.id, "sub-agent cancelled");
        self.runtime
            .hooks()
            .emit(
                HookEvent::SubagentCancel,
                HookData::agent(self.agent.name.clone())
                    .with_session(self.session_id.clone())
                    .with_metadata("subagent_id", self.id.clone()),
            )
            .await;
        Ok(())
    }

    /// Run on a background task. Progress arrives as `state_update` events,
    /// followed by `workflow_complete` or `workflow_error`.
    pub fn run_async(self: &Arc<Self>, parent: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut progress = self.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink::new(tx);
            let name = this.agent.name.clone();
            let forward = |sink: &EventSink, p: SubAgentProgress| {
                sink.emit(
                    &name,
                    EventPayload::StateUpdate {
                        state: p.state.to_string(),
                        message: Some(p.message),
                    },
                );
            };

            let run = this.run(&parent);
            tokio::pin!(run);
            let mut open = true;
            let result = loop {
                tokio::select! {
                    r = &mut run => break r,
                    p = progress.recv(), if open => match p {
                        Ok(p) => forward(&sink, p),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => open = false,
                    },
                }
            };
            while let Ok(p) = progress.try_recv() {
                forward(&sink, p);
            }
            let payload = match result {
                Ok(content) => EventPayload::WorkflowComplete { content },
                Err(e) => EventPayload::WorkflowError { error: e.to_string() },
            };
            sink.emit_terminal(&name, payload).await;
        });
        rx
    }

    async fn execute(&self, generation: u64) -> Result<String> {
        let (token, goal) = self.read(|i| (i.token.clone(), i.goal.clone()));
        let tracer = self.runtime.tracer();
        let span = tracer.start_span(
            &TraceContext::root(),
            format!("subagent:{}", self.agent.name),
            SpanKind::Agent,
        );
        tracer.set_attribute(&span, "subagent_id", self.id.clone());
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut outcome = Err(AgentError::Cancelled);
        for attempt in 1..=self.retry_on_failure + 1 {
            if token.is_cancelled() {
                break;
            }
            if attempt > 1 {
                tracing::info!(subagent_id = %self.id, attempt, "retrying sub-agent");
                self.report(format!("retrying (attempt {attempt})"));
            }
            let run = self.attempt(&goal, &token, &span);
            outcome = match (deadline, self.timeout) {
                (Some(deadline), Some(timeout)) => tokio::time::timeout_at(deadline, run)
                    .await
                    .unwrap_or(Err(AgentError::Timeout(timeout))),
                _ => run.await,
            };
            match &outcome {
                Ok(_) => break,
                Err(AgentError::Timeout(_)) => {
                    token.cancel();
                    break;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => tracing::warn!(subagent_id = %self.id, attempt, error = %e, "sub-agent attempt failed"),
            }
        }

        let finished = self.write(|inner| {
            if inner.generation != generation {
                return None;
            }
            if inner.state == SubAgentState::Running {
                inner.state = match &outcome {
                    Ok(_) => SubAgentState::Completed,
                    Err(AgentError::Timeout(_)) => SubAgentState::Timeout,
                    Err(e) if e.is_cancelled() => SubAgentState::Cancelled,
                    Err(_) => SubAgentState::Failed,
                };
            }
            if inner.state == SubAgentState::Paused {
                return Some(inner.state);
            }
            inner.ended_at = Some(rago_kernel::now());
            match &outcome {
                Ok(content) => inner.result = Some(content.clone()),
                Err(e) => inner.error = Some(e.to_string()),
            }
            Some(inner.state)
        });

        match finished {
            None => tracer.cancel_span(&span),
            Some(SubAgentState::Paused) => {
                tracer.cancel_span(&span);
            }
            Some(state) => {
                match &outcome {
                    Ok(_) => tracer.end_span(&span, None),
                    Err(e) => tracer.end_span(&span, Some(&e.to_string())),
                }
                tracing::info!(subagent_id = %self.id, state = %state, "sub-agent finished");
                self.report(state.as_str());
                self.write(|inner| inner.progress = broadcast::channel(PROGRESS_BUFFER).0);
                let mut data = HookData::agent(self.agent.name.clone())
                    .with_session(self.session_id.clone())
                    .with_metadata("subagent_id", self.id.clone())
                    .with_metadata("state", state.as_str());
                data = match &outcome {
                    Ok(content) => data.with_output(Value::String(content.clone())),
                    Err(e) => data.with_error(e.to_string()),
                };
                self.runtime.hooks().emit(HookEvent::SubagentStop, data).await;
            }
        }
        outcome
    }

    async fn attempt(&self, goal: &str, token: &CancellationToken, span: &TraceContext) -> Result<String> {
        let sessions = self.runtime.sessions();
        let session = sessions
            .get(&self.session_id)
            .ok_or_else(|| AgentError::Internal(format!("sub-agent session {} missing", self.session_id)))?;

        let mut first = goal.to_owned();
        if !self.user_context.is_empty() {
            let rendered = serde_json::to_string_pretty(&self.user_context)?;
            first.push_str(&format!("\n\n## Context\n{rendered}"));
        }
        let mut messages = vec![Message::system(String::new())];
        messages.extend(context::history(&session));
        messages.push(Message::user(first));

        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let run = async {
            let sink = EventSink::new(tx);
            let input = LoopInput {
                session_id: &self.session_id,
                max_rounds: self.max_turns,
                filter: Some(&self.tools),
                trace: span,
                token,
                sink: &sink,
            };
            self.runtime.run_loop(Arc::clone(&self.agent), &mut messages, &input).await
        };
        let track = async {
            while let Some(event) = rx.recv().await {
                match event.payload {
                    EventPayload::Thinking { round } => {
                        self.write(|i| i.turn = i.turn.max(round));
                        self.report(format!("turn {round}"));
                    }
                    EventPayload::ToolCall { name, .. } => self.report(format!("calling {name}")),
                    _ => {}
                }
            }
        };
        let (out, ()) = tokio::join!(run, track);
        let out = out?;

        sessions.add_message(&self.session_id, Message::user(goal))?;
        sessions.add_message(&self.session_id, Message::assistant(out.content.clone()))?;
        sessions.save(&self.session_id).await?;
        Ok(out.content)
    }
}

/// Live sub-agents by id.
#[derive(Debug, Default)]
pub struct SubAgentRegistry {
    subagents: DashMap<String, Arc<SubAgent>>,
}

impl SubAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subagent: SubAgent) -> Arc<SubAgent> {
        let subagent = Arc::new(subagent);
        self.subagents.insert(subagent.id.clone(), Arc::clone(&subagent));
        subagent
    }

    pub fn get(&self, id: &str) -> Option<Arc<SubAgent>> {
        self.subagents.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SubAgent>> {
        self.subagents.remove(id).map(|(_, s)| s)
    }

    pub fn statuses(&self) -> Vec<SubAgentStatus> {
        let mut out: Vec<SubAgentStatus> = self.subagents.iter().map(|s| s.status()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Drop every sub-agent in a terminal state; returns how many.
    pub fn prune(&self) -> usize {
        let before = self.subagents.len();
        self.subagents.retain(|_, s| !s.state().is_terminal());
        before - self.subagents.len()
    }

    pub fn len(&self) -> usize {
        self.subagents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subagents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FunctionTool;
    use crate::dispatcher::Dispatcher;
    use crate::llm::{GenerateOptions, LlmProvider, ToolResponse};
    use async_trait::async_trait;
    use rago_kernel::{EventKind, HookOptions, HookRegistry, ToolCall, ToolDefinition, Tracer, hook_fn};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies in order; a reply of `None` stalls, `Err` text fails.
    struct Script {
        replies: Mutex<Vec<Step>>,
        calls: AtomicUsize,
        seen_tools: Mutex<Vec<Vec<String>>>,
    }

    #[derive(Clone)]
    enum Step {
        Reply(ToolResponse),
        Fail,
        Stall,
    }

    impl Script {
        fn new(replies: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                seen_tools: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Script {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
            Ok(String::new())
        }

        async fn generate_with_tools(
            &self,
            _messages: &[Message],
            tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> Result<ToolResponse> {
            self.seen_tools
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.name.clone()).collect());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.replies.lock().unwrap().get(n).cloned();
            match step {
                Some(Step::Reply(r)) => Ok(r),
                Some(Step::Fail) => Err(AgentError::LlmRequestFailed { reason: "flaky".into() }),
                Some(Step::Stall) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ToolResponse::text("late"))
                }
                None => Ok(ToolResponse::text("done")),
            }
        }
    }

    fn runtime(llm: Arc<Script>) -> (Arc<Runtime>, &'static HookRegistry) {
        let hooks: &'static HookRegistry = Box::leak(Box::new(HookRegistry::new()));
        let rt = Runtime::new(llm, Arc::new(Dispatcher::new()), Agent::new("main", ""))
            .with_hooks(hooks)
            .with_tracer(Box::leak(Box::new(Tracer::new())));
        (Arc::new(rt), hooks)
    }

    fn worker() -> Agent {
        let tool = |name: &str| {
            FunctionTool::new(name, "test tool", json!({"type": "object"}), |_| async {
                Ok(Value::String("ok".into()))
            })
        };
        Agent::new("worker", "Do the task.")
            .with_function_tool(tool("read"))
            .with_function_tool(tool("shell"))
    }

    async fn wait_for(sub: &SubAgent, state: SubAgentState) {
        for _ in 0..200 {
            if sub.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sub-agent never reached {state}");
    }

    #[test]
    fn state_dag() {
        use SubAgentState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[tokio::test]
    async fn defaults_and_validation() {
        let (rt, _) = runtime(Script::new(vec![]));
        let sub = SubAgent::new(rt.clone(), worker(), SubAgentConfig::new("task").max_turns(0)).unwrap();
        assert_eq!(sub.max_turns(), DEFAULT_MAX_TURNS);
        assert_eq!(sub.mode(), SubAgentMode::Foreground);
        assert_eq!(sub.state(), SubAgentState::Pending);
        assert!(SubAgent::new(rt, worker(), SubAgentConfig::new("  ")).is_err());
    }

    #[tokio::test]
    async fn isolation_copies_context_only() {
        let (rt, _) = runtime(Script::new(vec![]));
        let parent = rt.sessions().create("main");
        rt.sessions().add_message(&parent.id, Message::user("secret history")).unwrap();
        rt.sessions().set_context(&parent.id, "project", json!("rago")).unwrap();

        let isolated = SubAgent::new(rt.clone(), worker(), SubAgentConfig::new("t").parent_session(&parent.id)).unwrap();
        let session = rt.sessions().get(isolated.session_id()).unwrap();
        assert!(session.messages.is_empty());
        assert_eq!(session.context["project"], "rago");

        let shared = SubAgent::new(
            rt.clone(),
            worker(),
            SubAgentConfig::new("t").parent_session(&parent.id).isolated(false),
        )
        .unwrap();
        assert_eq!(rt.sessions().get(shared.session_id()).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn completes_and_fires_lifecycle_hooks() {
        let (rt, hooks) = runtime(Script::new(vec![Step::Reply(ToolResponse::text("report ready"))]));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = fired.clone();
        hooks.register(
            None,
            hook_fn(move |event, _| {
                seen.lock().unwrap().push(event);
                async { Ok(None) }
            }),
            HookOptions::default(),
        );

        let sub = SubAgent::new(rt.clone(), worker(), SubAgentConfig::new("write a report")).unwrap();
        let out = sub.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(out, "report ready");
        assert_eq!(sub.state(), SubAgentState::Completed);
        assert!(sub.status().ended_at.is_some());
        let fired = fired.lock().unwrap();
        assert!(fired.contains(&HookEvent::SubagentStart));
        assert!(fired.contains(&HookEvent::SubagentStop));
        assert_eq!(rt.sessions().get(sub.session_id()).unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn deny_list_filters_tools() {
        let llm = Script::new(vec![
            Step::Reply(ToolResponse::calls(vec![ToolCall::new("c", "shell", json!({}))])),
            Step::Reply(ToolResponse::text("fine")),
        ]);
        let (rt, _) = runtime(llm.clone());
        let sub = SubAgent::new(rt, worker(), SubAgentConfig::new("t").deny_tools(["shell"])).unwrap();
        assert_eq!(sub.run(&CancellationToken::new()).await.unwrap(), "fine");
        let tools = llm.seen_tools.lock().unwrap();
        assert!(tools[0].contains(&"read".to_owned()));
        assert!(!tools[0].contains(&"shell".to_owned()));
    }

    #[tokio::test]
    async fn retries_failed_attempts() {
        let (rt, _) = runtime(Script::new(vec![Step::Fail, Step::Reply(ToolResponse::text("second time"))]));
        let sub = SubAgent::new(rt, worker(), SubAgentConfig::new("t").retry_on_failure(1)).unwrap();
        assert_eq!(sub.run(&CancellationToken::new()).await.unwrap(), "second time");
    }

    #[tokio::test]
    async fn failure_without_retries() {
        let (rt, _) = runtime(Script::new(vec![Step::Fail]));
        let sub = SubAgent::new(rt, worker(), SubAgentConfig::new("t")).unwrap();
        assert!(sub.run(&CancellationToken::new()).await.is_err());
        assert_eq!(sub.state(), SubAgentState::Failed);
        assert!(sub.error().is_some());
    }

    #[tokio::test]
    async fn timeout_is_not_cancellation() {
        let (rt, _) = runtime(Script::new(vec![Step::Stall]));
        let sub = SubAgent::new(
            rt,
            worker(),
            SubAgentConfig::new("t").timeout(Duration::from_millis(50)).retry_on_failure(3),
        )
        .unwrap();
        let err = sub.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert_eq!(sub.state(), SubAgentState::Timeout);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_subagent() {
        let (rt, _) = runtime(Script::new(vec![Step::Stall]));
        let sub = Arc::new(SubAgent::new(rt, worker(), SubAgentConfig::new("t")).unwrap());
        let running = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.run(&CancellationToken::new()).await })
        };
        wait_for(&sub, SubAgentState::Running).await;
        sub.cancel().await.unwrap();
        assert!(running.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(sub.state(), SubAgentState::Cancelled);
        assert!(sub.cancel().await.is_err());
    }

    #[tokio::test]
    async fn pause_then_resume_with_new_goal() {
        let (rt, _) = runtime(Script::new(vec![Step::Stall, Step::Reply(ToolResponse::text("resumed"))]));
        let sub = Arc::new(SubAgent::new(rt, worker(), SubAgentConfig::new("first")).unwrap());
        assert!(sub.pause().is_err());

        let running = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.run(&CancellationToken::new()).await })
        };
        wait_for(&sub, SubAgentState::Running).await;
        sub.pause().unwrap();
        assert!(running.await.unwrap().is_err());
        assert_eq!(sub.state(), SubAgentState::Paused);

        let out = sub.resume(&CancellationToken::new(), "second").await.unwrap();
        assert_eq!(out, "resumed");
        assert_eq!(sub.goal(), "second");
        assert_eq!(sub.state(), SubAgentState::Completed);
    }

    #[tokio::test]
    async fn run_async_streams_progress_then_completion() {
        let (rt, _) = runtime(Script::new(vec![Step::Reply(ToolResponse::text("async done"))]));
        let sub = Arc::new(
            SubAgent::new(rt, worker(), SubAgentConfig::new("t").mode(SubAgentMode::Background)).unwrap(),
        );
        let mut rx = sub.run_async(CancellationToken::new());
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&EventKind::StateUpdate));
        assert_eq!(kinds.last(), Some(&EventKind::WorkflowComplete));
    }

    #[tokio::test]
    async fn registry_prunes_finished() {
        let (rt, _) = runtime(Script::new(vec![]));
        let registry = SubAgentRegistry::new();
        let done = registry.insert(SubAgent::new(rt.clone(), worker(), SubAgentConfig::new("a")).unwrap());
        registry.insert(SubAgent::new(rt, worker(), SubAgentConfig::new("b")).unwrap());
        done.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);
    }
}
