//! Subcommand: `rago agent` -- runs, plans and stored state.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rago_agent::{RagoConfig, Runtime};
use rago_kernel::{EventPayload, Plan, Session, StepStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::Services;
use crate::cli::AgentAction;
use crate::helpers::truncate;
use crate::repl;

pub async fn handle(mut config: RagoConfig, action: AgentAction) -> Result<()> {
    if let AgentAction::Run { verify: true, .. } = action {
        config.agent.verify = true;
    }
    let services = Services::open(config).await?;

    match action {
        AgentAction::Run { goal, session, .. } => {
            cancel_on_ctrl_c(&services.runtime);
            let content = run_streaming(&services.runtime, goal, session).await?;
            println!("{content}");
        }
        AgentAction::Chat { session } => {
            cancel_on_ctrl_c(&services.runtime);
            repl::run(&services, session).await?;
        }
        AgentAction::Plan { goal, session, json } => {
            let plan = create_plan(&services, &goal, session.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", render_plan(&plan));
                println!("\nRun it with: rago agent execute {}", plan.id);
            }
        }
        AgentAction::Execute { plan_id, json } => {
            let cancel = CancellationToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    watcher.cancel();
                }
            });
            let plan = services
                .executor(cancel)
                .execute_stored(&plan_id)
                .await
                .with_context(|| format!("failed to execute plan {plan_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", render_plan(&plan));
            }
        }
        AgentAction::Sessions { delete: Some(id), .. } => {
            if !services.runtime.sessions().delete(&id).await? {
                bail!("unknown session: {id}");
            }
            println!("Deleted session {id}.");
        }
        AgentAction::Sessions { delete: None, limit } => {
            let sessions = services.store.sessions.list(limit).await.context("failed to list sessions")?;
            print!("{}", render_sessions(&sessions));
        }
        AgentAction::Plans { session, limit, json } => {
            let plans = services
                .store
                .plans
                .list(session.as_deref(), limit)
                .await
                .context("failed to list plans")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                print!("{}", render_plan_list(&plans));
            }
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c(runtime: &Arc<Runtime>) {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            runtime.cancel();
        }
    });
}

/// Run `goal`, reporting progress on stderr. Returns the final answer.
async fn run_streaming(runtime: &Arc<Runtime>, goal: String, session: Option<String>) -> Result<String> {
    let mut rx = runtime.run_stream(goal, session);
    let mut session_id = None;
    let mut outcome = None;
    while let Some(event) = rx.recv().await {
        match event.payload {
            EventPayload::WorkflowStart { session_id: id, .. } => session_id = Some(id),
            EventPayload::Thinking { round } if round > 1 => eprintln!("  … round {round}"),
            EventPayload::ToolCall { name, arguments, .. } => {
                eprintln!("  → {name} {}", truncate(&arguments.to_string(), 80));
            }
            EventPayload::ToolResult { name, is_error: true, result, .. } => {
                eprintln!("  ✗ {name}: {}", truncate(&result, 80));
            }
            EventPayload::Handoff { from, to } => eprintln!("  ⇢ {from} → {to}"),
            EventPayload::WorkflowComplete { content } => outcome = Some(Ok(content)),
            EventPayload::WorkflowError { error } => outcome = Some(Err(error)),
            _ => {}
        }
    }
    if let Some(id) = &session_id {
        eprintln!("session: {id}");
    }
    match outcome {
        Some(Ok(content)) => Ok(content),
        Some(Err(error)) => bail!("run failed: {error}"),
        None => bail!("run ended without a result"),
    }
}

async fn create_plan(services: &Services, goal: &str, session_id: Option<&str>) -> Result<Plan> {
    let runtime = &services.runtime;
    let session = runtime
        .sessions()
        .load_or_create(session_id, &runtime.agent().name)
        .await?;
    let tools = services.dispatcher.tools_for(Some(runtime.agent().as_ref())).await;
    let plan = services
        .planner
        .plan(goal, Some(&session), &tools)
        .await
        .context("planning failed")?;
    services.store.plans.save(&plan).await.context("failed to save plan")?;
    info!(plan_id = %plan.id, steps = plan.steps().len(), "plan stored");
    Ok(plan)
}

fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Skipped => "-",
        StepStatus::Running => "…",
        StepStatus::Pending => " ",
    }
}

pub fn render_plan(plan: &Plan) -> String {
    let mut out = format!("Plan {} [{}]\nGoal: {}\n", plan.id, plan.status, plan.goal);
    if let Some(reasoning) = plan.reasoning.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(&format!("Reasoning: {}\n", truncate(reasoning, 200)));
    }
    let steps = plan.steps();
    let numbers: std::collections::HashMap<&str, usize> =
        steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i + 1)).collect();
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("{:>3}. [{}] {}: {}", i + 1, status_mark(step.status), step.tool, step.description));
        if !step.depends_on.is_empty() {
            let deps: Vec<String> = step
                .depends_on
                .iter()
                .map(|id| numbers.get(id.as_str()).map_or_else(|| id.clone(), |n| n.to_string()))
                .collect();
            out.push_str(&format!(" (after {})", deps.join(", ")));
        }
        out.push('\n');
        if let Some(error) = &step.error {
            out.push_str(&format!("       error: {}\n", truncate(error, 160)));
        } else if let Some(result) = &step.result {
            let text = match result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("       result: {}\n", truncate(&text, 160)));
        }
    }
    if let Some(error) = &plan.error {
        out.push_str(&format!("Error: {error}\n"));
    }
    out
}

pub fn render_plan_list(plans: &[Plan]) -> String {
    if plans.is_empty() {
        return "No plans.\n".to_owned();
    }
    plans
        .iter()
        .map(|p| {
            format!(
                "{}  {:<9}  {}  {} steps  {}\n",
                p.id,
                p.status.as_str(),
                p.created_at.format("%Y-%m-%d %H:%M"),
                p.steps().len(),
                truncate(&p.goal, 60)
            )
        })
        .collect()
}

pub fn render_sessions(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "No sessions.\n".to_owned();
    }
    sessions
        .iter()
        .map(|s| {
            let last = s
                .messages
                .iter()
                .rev()
                .find(|m| m.role == rago_kernel::Role::User)
                .map(|m| truncate(&m.content, 50))
                .unwrap_or_default();
            format!(
                "{}  {}  {:>4} msgs  {}  {}\n",
                s.id,
                s.agent_id,
                s.messages.len(),
                s.updated_at.format("%Y-%m-%d %H:%M"),
                last
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rago_kernel::{Message, Step};
    use serde_json::{Map, Value};

    use super::*;

    #[test]
    fn plan_rendering_numbers_dependencies() {
        let a = Step::new("Look up Go", "rag_query", Map::new());
        let b = Step::new("Write it up", "llm", Map::new()).depends_on([a.id.clone()]);
        let mut plan = Plan::new("Write about Go", "s1", vec![a, b]);
        plan.step_mut(0).unwrap().start().unwrap();
        plan.step_mut(0).unwrap().complete(Value::String("Go is\ncompiled".into())).unwrap();

        let out = render_plan(&plan);
        assert!(out.contains("Goal: Write about Go"));
        assert!(out.contains("  1. [✓] rag_query: Look up Go\n"));
        assert!(out.contains("       result: Go is compiled\n"));
        assert!(out.contains("  2. [ ] llm: Write it up (after 1)\n"));
    }

    #[test]
    fn plan_list_and_empty_states() {
        assert_eq!(render_plan_list(&[]), "No plans.\n");
        assert_eq!(render_sessions(&[]), "No sessions.\n");

        let plan = Plan::new("Summarize notes", "s1", vec![]);
        let out = render_plan_list(&[plan.clone()]);
        assert!(out.starts_with(&plan.id));
        assert!(out.contains("pending"));
        assert!(out.contains("0 steps  Summarize notes"));
    }

    #[test]
    fn session_list_shows_last_user_message() {
        let mut session = Session::new("assistant");
        session.add_message(Message::user("first question"));
        session.add_message(Message::assistant("answer"));
        session.add_message(Message::user("second question"));
        let out = render_sessions(&[session]);
        assert!(out.contains("assistant"));
        assert!(out.contains("3 msgs"));
        assert!(out.trim_end().ends_with("second question"));
    }
}
