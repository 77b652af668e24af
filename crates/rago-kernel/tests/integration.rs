//! Cross-module kernel behaviour.

use rago_kernel::{
    Event, EventPayload, HookData, HookEvent, HookOptions, Message, Plan, PlanStatus, Session,
    SpanKind, Step, StepStatus, TraceContext, Tracer, global_hooks, hook_fn,
};
use serde_json::{Map, json};

#[test]
fn plan_round_trips_through_json() {
    let a = Step::new("search", "rag_query", Map::new());
    let b = Step::new("write", "filesystem.write_file", Map::new())
        .depends_on([a.id.clone()])
        .output_file("./out.md");
    let plan = Plan::new("write docs", "s1", vec![a, b]).with_reasoning("two steps");

    let json = serde_json::to_string(&plan).unwrap();
    let back: Plan = serde_json::from_str(&json).unwrap();
    assert_eq!(back, plan);
    assert_eq!(back.steps()[1].output_file.as_deref(), Some("./out.md"));
}

#[test]
fn executing_a_plan_by_hand_respects_invariants() {
    let a = Step::new("a", "rag_query", Map::new());
    let b = Step::new("b", "llm", Map::new()).depends_on([a.id.clone()]);
    let mut plan = Plan::new("goal", "s1", vec![a, b]);
    plan.start().unwrap();

    {
        let step = plan.step_mut(0).unwrap();
        step.start().unwrap();
        step.fail("network").unwrap();
    }
    assert!(!plan.dependencies_satisfied(1));
    plan.step_mut(1)
        .unwrap()
        .fail("dependencies not satisfied")
        .unwrap();
    plan.finish(PlanStatus::Failed, Some("all steps failed".into()))
        .unwrap();

    for step in plan.steps() {
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().is_some_and(|e| !e.is_empty()));
    }
}

#[test]
fn session_history_only_grows() {
    let mut session = Session::new("assistant");
    let mut last = 0;
    for text in ["hi", "hello", "bye"] {
        session.add_message(Message::user(text));
        assert!(session.messages.len() > last);
        last = session.messages.len();
    }
    assert!(session.updated_at >= session.created_at);
}

#[test]
fn events_carry_agent_and_kind() {
    let event = Event::new(
        "researcher",
        EventPayload::ToolCall {
            call_id: "c1".into(),
            name: "rag_query".into(),
            arguments: json!({"query": "rust"}),
        },
    );
    assert_eq!(event.kind().as_str(), "tool_call");
    assert_eq!(event.agent, "researcher");
}

#[tokio::test]
async fn global_registry_is_shared() {
    let id = global_hooks().register(
        Some(HookEvent::SubagentStart),
        hook_fn(|_, data| async move { Ok(Some(data.with_metadata("seen", true))) }),
        HookOptions::default(),
    );
    let out = global_hooks()
        .emit_with_result(HookEvent::SubagentStart, HookData::agent("child"))
        .await
        .unwrap();
    assert_eq!(out.metadata["seen"], true);
    global_hooks().unregister(&id).unwrap();
}

#[test]
fn tracer_contexts_are_explicit() {
    let tracer = Tracer::new();
    let a = tracer.start_span(&TraceContext::root(), "run-a", SpanKind::Agent);
    let b = tracer.start_span(&TraceContext::root(), "run-b", SpanKind::Agent);
    assert_ne!(a.trace_id, b.trace_id);

    let child = tracer.start_span(&a, "llm", SpanKind::Llm);
    tracer.end_span(&child, None);
    assert_eq!(tracer.trace(a.trace_id.as_deref().unwrap()).len(), 2);
}
