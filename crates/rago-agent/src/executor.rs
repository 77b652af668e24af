//! Step executor.
//!
//! Runs a plan's steps in order through the [`Dispatcher`]. A step whose
//! dependencies did not complete is failed without running. String
//! arguments may reference the previous completed step's result with
//! `{{PREVIOUS_OUTPUT}}`; file-write steps without `content` receive it
//! implicitly.

use std::path::Path;
use std::sync::Arc;

use rago_kernel::{
    HookData, HookEvent, HookRegistry, Plan, PlanStatus, SpanKind, StepStatus, TraceContext, Tracer,
    global_hooks, global_tracer,
};
use rago_store::PlanStore;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::dispatcher::{DispatchContext, Dispatcher, LLM_TOOL_NAMES};
use crate::error::{AgentError, Result};
use crate::planner::is_write_tool;
use crate::tools::memory::{MemoryService, StoreRequest};

pub const PREVIOUS_OUTPUT: [&str; 2] = ["{{PREVIOUS_OUTPUT}}", "{{previous_output}}"];

const DEPENDENCIES_NOT_SATISFIED: &str = "dependencies not satisfied";

/// String form of a tool result: strings as-is, anything else (null
/// included) as pretty JSON.
pub fn format_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Replace every previous-output placeholder inside string values.
pub fn substitute_previous(value: &Value, previous: &str) -> Value {
    match value {
        Value::String(s) if PREVIOUS_OUTPUT.iter().any(|p| s.contains(p)) => {
            let mut out = s.clone();
            for p in PREVIOUS_OUTPUT {
                out = out.replace(p, previous);
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_previous(v, previous)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_previous(v, previous)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Executes plans step by step.
pub struct Executor {
    dispatcher: Arc<Dispatcher>,
    agent: Option<Arc<Agent>>,
    memory: Option<Arc<dyn MemoryService>>,
    plans: Option<PlanStore>,
    cancel: CancellationToken,
    hooks: &'static HookRegistry,
    tracer: &'static Tracer,
}

impl Executor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            agent: None,
            memory: None,
            plans: None,
            cancel: CancellationToken::new(),
            hooks: global_hooks(),
            tracer: global_tracer(),
        }
    }

    /// Acting agent for function tools and LLM option overrides.
    pub fn with_agent(mut self, agent: Arc<Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Fire store-if-worthwhile after each plan.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Persist plans once they finish.
    pub fn with_plan_store(mut self, plans: PlanStore) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
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

    /// Load a stored plan by id and execute it.
    pub async fn execute_stored(&self, plan_id: &str) -> Result<Plan> {
        let store = self
            .plans
            .as_ref()
            .ok_or_else(|| AgentError::config("no plan store configured"))?;
        let mut plan = store.get(plan_id).await.map_err(|e| {
            if e.is_not_found() {
                AgentError::input(format!("unknown plan id: {plan_id}"))
            } else {
                e.into()
            }
        })?;
        self.execute_plan(&mut plan).await?;
        Ok(plan)
    }

    /// Run every step of a pending plan, then settle its status.
    ///
    /// The plan ends `completed` when no step failed or at least one step
    /// succeeded, `failed` otherwise. Cancellation skips the remaining steps,
    /// fails the plan and returns [`AgentError::Cancelled`].
    pub async fn execute_plan(&self, plan: &mut Plan) -> Result<()> {
        if plan.status != PlanStatus::Pending {
            return Err(AgentError::InvalidState {
                entity: "plan",
                state: plan.status.to_string(),
                action: "execute",
            });
        }
        plan.start()?;
        let span = self.tracer.start_span(&TraceContext::root(), "plan", SpanKind::Internal);
        self.tracer.set_attribute(&span, "plan_id", plan.id.clone());
        tracing::info!(plan_id = %plan.id, steps = plan.steps().len(), goal = %plan.goal, "executing plan");

        let mut cancelled = false;
        for index in 0..plan.steps().len() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                plan.step_mut(index)?.skip("cancelled")?;
                continue;
            }
            self.execute_step(plan, index, &span).await?;
        }

        let completed = plan.steps().iter().filter(|s| s.status == StepStatus::Completed).count();
        let failed = plan.steps().len() - completed;
        let (status, error) = if cancelled {
            (PlanStatus::Failed, Some("cancelled".to_owned()))
        } else if failed == 0 || completed > 0 {
            let error = (failed > 0).then(|| format!("{failed} of {} steps failed", plan.steps().len()));
            (PlanStatus::Completed, error)
        } else {
            (PlanStatus::Failed, Some("all steps failed".to_owned()))
        };
        plan.finish(status, error.clone())?;
        self.tracer.end_span(&span, if status == PlanStatus::Failed { error.as_deref() } else { None });
        tracing::info!(plan_id = %plan.id, status = %plan.status, completed, failed, "plan finished");

        if let Some(store) = &self.plans {
            store.save(plan).await?;
        }
        self.store_memory(plan);

        if cancelled {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Execute `plan.steps()[index]` and record the outcome on the step.
    ///
    /// Tool failures are recorded, not returned; an error here means the
    /// plan itself could not be updated.
    pub async fn execute_step(&self, plan: &mut Plan, index: usize, parent: &TraceContext) -> Result<StepStatus> {
        if !plan.dependencies_satisfied(index) {
            let step = plan.step_mut(index)?;
            tracing::warn!(step = %step.id, "step dependencies not satisfied");
            step.fail(DEPENDENCIES_NOT_SATISFIED)?;
            plan.touch();
            return Ok(StepStatus::Failed);
        }

        let previous = plan.steps()[..index]
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
            .map(format_result);
        let session_id = plan.session_id.clone();
        let step = plan.step_mut(index)?;
        let args = resolve_arguments(&step.tool, &step.description, &step.arguments, previous.as_deref());
        let tool = step.tool.clone();
        let output_file = step.output_file.clone();
        step.start()?;
        tracing::info!(step = %step.id, tool = %tool, description = %step.description, "executing step");

        let span = self.tracer.start_span(parent, format!("tool:{tool}"), SpanKind::Tool);
        let outcome = self.run_tool(&tool, args, &session_id).await;
        let outcome = match (outcome, output_file) {
            (Ok(value), Some(path)) => write_output(&path, &format_result(&value)).await.map(|()| value),
            (outcome, _) => outcome,
        };

        let step = plan.step_mut(index)?;
        let status = match outcome {
            Ok(value) => {
                self.tracer.end_span(&span, None);
                step.complete(value)?;
                StepStatus::Completed
            }
            Err(e) => {
                tracing::warn!(step = %step.id, tool = %tool, error = %e, "step failed");
                self.tracer.end_span(&span, Some(&e.to_string()));
                step.fail(e.to_string())?;
                StepStatus::Failed
            }
        };
        plan.touch();
        Ok(status)
    }

    async fn run_tool(&self, tool: &str, args: Map<String, Value>, session_id: &str) -> Result<Value> {
        let mut data = HookData::tool(tool, Value::Object(args)).with_session(session_id);
        if let Some(agent) = &self.agent {
            data = data.with_agent(agent.name.clone());
        }
        let data = self.hooks.emit_with_result(HookEvent::PreToolUse, data).await?;
        let args = match &data.input {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let ctx = DispatchContext {
            agent: self.agent.as_deref(),
            session_id: (!session_id.is_empty()).then_some(session_id),
        };
        let result = tokio::select! {
            r = self.dispatcher.call(tool, &args, ctx) => r,
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
        };

        let post = match &result {
            Ok(v) => data.with_output(v.clone()),
            Err(e) => data.with_error(e.to_string()),
        };
        self.hooks.emit(HookEvent::PostToolUse, post).await;
        result
    }

    fn store_memory(&self, plan: &Plan) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let result = plan
            .final_result()
            .or_else(|| plan.steps().iter().rev().find_map(|s| s.result.as_ref()))
            .map(format_result)
            .unwrap_or_default();
        let request = StoreRequest {
            goal: plan.goal.clone(),
            result,
            execution_log: plan
                .steps()
                .iter()
                .map(|s| format!("[{}] {} ({})", s.status, s.description, s.tool))
                .collect(),
            session_id: (!plan.session_id.is_empty()).then(|| plan.session_id.clone()),
        };
        tokio::spawn(async move {
            match memory.store_if_worthwhile(request).await {
                Ok(Some(id)) => tracing::debug!(memory_id = %id, "plan outcome remembered"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "storing plan memory failed"),
            }
        });
    }
}

fn resolve_arguments(
    tool: &str,
    description: &str,
    arguments: &Map<String, Value>,
    previous: Option<&str>,
) -> Map<String, Value> {
    let mut args = match previous {
        Some(prev) => arguments
            .iter()
            .map(|(k, v)| (k.clone(), substitute_previous(v, prev)))
            .collect(),
        None => arguments.clone(),
    };
    if let Some(prev) = previous
        && is_write_tool(tool)
    {
        args.entry("content").or_insert_with(|| Value::String(prev.to_owned()));
    }
    if LLM_TOOL_NAMES.contains(&tool) && !args.contains_key("prompt") {
        let prompt = match previous {
            Some(prev) => format!("{description}\n\nContext:\n{prev}"),
            None => description.to_owned(),
        };
        args.insert("prompt".into(), Value::String(prompt));
    }
    args
}

async fn write_output(path: &str, content: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    tracing::debug!(path = %path.display(), bytes = content.len(), "step output written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FunctionTool;
    use rago_kernel::Step;
    use serde_json::json;
    use std::sync::Mutex;

    fn isolated() -> (&'static HookRegistry, &'static Tracer) {
        (Box::leak(Box::new(HookRegistry::new())), Box::leak(Box::new(Tracer::new())))
    }

    /// Agent with `echo` (returns its `text` argument), `boom` (fails) and
    /// `record` (stores its arguments).
    fn agent(seen: Arc<Mutex<Vec<Map<String, Value>>>>) -> Arc<Agent> {
        Arc::new(
            Agent::new("worker", "")
                .with_function_tool(FunctionTool::new("echo", "", json!({}), |args| async move {
                    Ok(args.get("text").cloned().unwrap_or(Value::Null))
                }))
                .with_function_tool(FunctionTool::new("boom", "", json!({}), |_| async {
                    Err(AgentError::tool("boom", "exploded"))
                }))
                .with_function_tool(FunctionTool::new("write_file", "", json!({}), move |args| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(args);
                        Ok(json!("written"))
                    }
                })),
        )
    }

    fn executor(agent: Arc<Agent>) -> Executor {
        let (hooks, tracer) = isolated();
        Executor::new(Arc::new(Dispatcher::new()))
            .with_agent(agent)
            .with_hooks(hooks)
            .with_tracer(tracer)
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn results_are_formatted_for_content() {
        assert_eq!(format_result(&json!("text")), "text");
        assert_eq!(format_result(&Value::Null), "null");
        assert_eq!(format_result(&json!({"a": 1})), "{\n  \"a\": 1\n}");
        assert_eq!(format_result(&json!(3)), "3");
    }

    #[test]
    fn placeholders_are_substituted_recursively() {
        let v = json!({"a": "x {{PREVIOUS_OUTPUT}} y", "b": ["{{previous_output}}"], "c": 1});
        let out = substitute_previous(&v, "P");
        assert_eq!(out, json!({"a": "x P y", "b": ["P"], "c": 1}));
    }

    #[test]
    fn llm_steps_get_a_prompt() {
        let args = resolve_arguments("llm", "Summarize", &Map::new(), Some("facts"));
        assert_eq!(args["prompt"], "Summarize\n\nContext:\nfacts");
        let args = resolve_arguments("llm", "Summarize", &Map::new(), None);
        assert_eq!(args["prompt"], "Summarize");
    }

    #[tokio::test]
    async fn previous_output_flows_into_write_steps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let exec = executor(agent(seen.clone()));
        let a = Step::new("produce", "echo", args(json!({"text": "hello"})));
        let b = Step::new("quote", "echo", args(json!({"text": "<{{PREVIOUS_OUTPUT}}>"})));
        let c = Step::new("save", "write_file", args(json!({"path": "out.md"})));
        let mut plan = Plan::new("goal", "s1", vec![a, b, c]);

        exec.execute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.steps()[1].result, Some(json!("<hello>")));
        let recorded = seen.lock().unwrap();
        assert_eq!(recorded[0]["content"], "<hello>");
        assert_eq!(recorded[0]["path"], "out.md");
        assert_eq!(plan.final_result(), Some(&json!("written")));
    }

    #[tokio::test]
    async fn failed_dependency_fails_dependents() {
        let exec = executor(agent(Arc::new(Mutex::new(Vec::new()))));
        let a = Step::new("A", "boom", Map::new());
        let b = Step::new("B", "echo", args(json!({"text": "x"}))).depends_on([a.id.clone()]);
        let mut plan = Plan::new("goal", "s1", vec![a, b]);

        exec.execute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.steps()[0].status, StepStatus::Failed);
        assert!(plan.steps()[0].error.as_deref().unwrap().contains("exploded"));
        assert_eq!(plan.steps()[1].status, StepStatus::Failed);
        assert_eq!(plan.steps()[1].error.as_deref(), Some("dependencies not satisfied"));
    }

    #[tokio::test]
    async fn partial_success_counts_as_completed() {
        let exec = executor(agent(Arc::new(Mutex::new(Vec::new()))));
        let steps = vec![
            Step::new("ok", "echo", args(json!({"text": "x"}))),
            Step::new("bad", "boom", Map::new()),
            Step::new("missing", "no_such_tool", Map::new()),
        ];
        let mut plan = Plan::new("goal", "", steps);
        exec.execute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.error.as_deref(), Some("2 of 3 steps failed"));
        assert!(plan.steps()[2].error.as_deref().unwrap().contains("unknown tool"));
        assert!(plan.final_result().is_none());
    }

    #[tokio::test]
    async fn output_files_are_written_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        let exec = executor(agent(Arc::new(Mutex::new(Vec::new()))));
        let step = Step::new("produce", "echo", args(json!({"text": "file body"})))
            .output_file(path.to_string_lossy());
        let mut plan = Plan::new("goal", "s1", vec![step]);
        exec.execute_plan(&mut plan).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "file body");
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_steps() {
        let token = CancellationToken::new();
        token.cancel();
        let exec = executor(agent(Arc::new(Mutex::new(Vec::new())))).with_cancellation(token);
        let mut plan = Plan::new("goal", "s1", vec![Step::new("a", "echo", Map::new())]);
        let err = exec.execute_plan(&mut plan).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.steps()[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn stored_plans_execute_by_id() {
        let store = rago_store::AgentStore::in_memory().await.unwrap();
        let plan = Plan::new("goal", "s1", vec![Step::new("a", "echo", args(json!({"text": "hi"})))]);
        store.plans.save(&plan).await.unwrap();

        let exec = executor(agent(Arc::new(Mutex::new(Vec::new())))).with_plan_store(store.plans.clone());
        let done = exec.execute_stored(&plan.id).await.unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(store.plans.get(&plan.id).await.unwrap().status, PlanStatus::Completed);

        let err = exec.execute_stored("missing").await.unwrap_err();
        assert!(matches!(err, AgentError::Input { .. }));
    }

    #[tokio::test]
    async fn blocking_hooks_fail_the_step() {
        let (hooks, tracer) = isolated();
        hooks.register(
            Some(HookEvent::PreToolUse),
            rago_kernel::hook_fn(|_, _| async {
                Err(rago_kernel::KernelError::HookFailed {
                    hook_id: "deny".into(),
                    reason: "not allowed".into(),
                })
            }),
            rago_kernel::HookOptions::default(),
        );
        let exec = Executor::new(Arc::new(Dispatcher::new()))
            .with_agent(agent(Arc::new(Mutex::new(Vec::new()))))
            .with_hooks(hooks)
            .with_tracer(tracer);
        let mut plan = Plan::new("goal", "s1", vec![Step::new("a", "echo", Map::new())]);
        exec.execute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.steps()[0].status, StepStatus::Failed);
        assert!(plan.steps()[0].error.as_deref().unwrap().contains("not allowed"));
    }
}
