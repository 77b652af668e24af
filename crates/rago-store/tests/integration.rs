//! On-disk store behaviour across reopen.

use rago_kernel::{Message, Plan, PlanStatus, Session, Step};
use rago_store::{AgentStore, Database, MemoryKind, MemoryRecord, MemoryStore, Schema};
use serde_json::{Map, json};

// ═══════════════════════════════════════════════════════════════════════
//  Agent database
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn agent_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let mut session = Session::new("assistant");
    session.add_message(Message::user("Hello"));
    session.add_message(Message::assistant("Hi there"));

    let mut plan = Plan::new(
        "say hello",
        session.id.clone(),
        vec![Step::new("greet", "llm", Map::new())],
    );
    plan.start().unwrap();
    {
        let step = plan.step_mut(0).unwrap();
        step.start().unwrap();
        step.complete(json!("Hi there")).unwrap();
    }
    plan.finish(PlanStatus::Completed, None).unwrap();

    {
        let store = AgentStore::open(dir.path(), "assistant").await.unwrap();
        store.sessions.save(&session).await.unwrap();
        store.plans.save(&plan).await.unwrap();
    }

    assert!(dir.path().join("assistant.db").exists());

    let store = AgentStore::open(dir.path(), "assistant").await.unwrap();
    let loaded = store.sessions.get(&session.id).await.unwrap();
    assert_eq!(loaded.messages.len(), 2);
    assert_eq!(loaded, session);

    let loaded_plan = store.plans.get(&plan.id).await.unwrap();
    assert_eq!(loaded_plan, plan);
    assert_eq!(loaded_plan.final_result(), Some(&json!("Hi there")));

    let by_session = store.plans.list(Some(&session.id), 10).await.unwrap();
    assert_eq!(by_session.len(), 1);
}

#[tokio::test]
async fn agents_get_separate_files() {
    let dir = tempfile::tempdir().unwrap();
    let a = AgentStore::open(dir.path(), "researcher").await.unwrap();
    let b = AgentStore::open(dir.path(), "writer").await.unwrap();

    a.sessions.save(&Session::new("researcher")).await.unwrap();
    assert_eq!(a.sessions.list(10).await.unwrap().len(), 1);
    assert!(b.sessions.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_saves_are_serialized() {
    let store = AgentStore::in_memory().await.unwrap();
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let plan = Plan::new(format!("goal {i}"), "s", Vec::new());
            store.plans.save(&plan).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(store.plans.list(None, 100).await.unwrap().len(), 16);
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory database
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn memory_database_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let db = Database::open_and_migrate(path, Schema::Memory).await.unwrap();
    let memories = MemoryStore::new(db);

    memories
        .add(&MemoryRecord::new(MemoryKind::Preference, "favorite color is green").with_session("s1"))
        .await
        .unwrap();
    let hits = memories.search_keyword("color", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].session_id.as_deref(), Some("s1"));
}
