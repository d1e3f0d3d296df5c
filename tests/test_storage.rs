//! Durable execution records: the JSON store and cross-restart resumption.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

use botflow::clients::mock::{MockDataGateway, MockMessenger};
use botflow::engine::BotEngine;
use botflow::engine::context::EngineDeps;
use botflow::engine::scheduler::{DelayScheduler, MockDelayQueue};
use botflow::engine::types::{
    EventKind, Execution, ExecutionStatus, InboundEvent, LogEntry, WaitKind, WaitState,
};
use botflow::graph::WorkflowVersion;
use botflow::graph::repo::WorkflowRepo;
use botflow::storage::ExecutionStore;
use botflow::storage::json_store::JsonExecutionStore;
use botflow::vars::memory::MemoryVariableStore;

fn sample_execution(id: &str, status: ExecutionStatus) -> Execution {
    Execution {
        id: id.to_string(),
        project_id: "p1".to_string(),
        workflow_id: "wf".to_string(),
        version: 1,
        chat_id: "chat1".to_string(),
        session_id: "p1:chat1".to_string(),
        user_id: None,
        status,
        current_node_id: None,
        wait: None,
        step_count: 0,
        started_at: Utc::now(),
        finished_at: None,
        error: None,
    }
}

// --- JSON store basics ---

#[tokio::test]
async fn records_survive_store_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = JsonExecutionStore::new(dir.path());
        let mut exec = sample_execution("e1", ExecutionStatus::Waiting);
        exec.wait = Some(WaitState {
            node_id: "ask".to_string(),
            kind: WaitKind::Callback,
            payload: Value::Null,
        });
        store.insert(&exec).await.unwrap();
    }

    let reopened = JsonExecutionStore::new(dir.path());
    let found = reopened
        .find_waiting("p1", "chat1", WaitKind::Callback)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "e1");
    assert_eq!(found.wait.unwrap().node_id, "ask");
}

#[tokio::test]
async fn logs_append_in_order() {
    let dir = TempDir::new().unwrap();
    let store = JsonExecutionStore::new(dir.path());

    store
        .insert(&sample_execution("e1", ExecutionStatus::Running))
        .await
        .unwrap();

    for step in 1..=3 {
        store
            .append_log(&LogEntry {
                execution_id: "e1".to_string(),
                step,
                node_id: format!("n{}", step),
                node_type: "message".to_string(),
                level: "info".to_string(),
                message: format!("step {}", step),
                data: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let logs = store.logs("e1").await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].node_id, "n1");
    assert_eq!(logs[2].step, 3);
}

#[tokio::test]
async fn list_filters_by_status() {
    let dir = TempDir::new().unwrap();
    let store = JsonExecutionStore::new(dir.path());

    store
        .insert(&sample_execution("e1", ExecutionStatus::Completed))
        .await
        .unwrap();
    store
        .insert(&sample_execution("e2", ExecutionStatus::Failed))
        .await
        .unwrap();
    store
        .insert(&sample_execution("e3", ExecutionStatus::Completed))
        .await
        .unwrap();

    let completed = store.list(Some(ExecutionStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 2);

    let all = store.list(None).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn delete_removes_record() {
    let dir = TempDir::new().unwrap();
    let store = JsonExecutionStore::new(dir.path());

    store
        .insert(&sample_execution("e1", ExecutionStatus::Completed))
        .await
        .unwrap();
    store.delete("e1").await.unwrap();

    assert!(store.get("e1").await.unwrap().is_none());
}

// --- Resumption across engine restarts ---

fn engine_on(dir: &TempDir, messenger: Arc<MockMessenger>) -> Arc<BotEngine> {
    let deps = EngineDeps {
        store: Arc::new(JsonExecutionStore::new(dir.path())),
        vars: Arc::new(MemoryVariableStore::new()),
        messenger,
        gateway: Arc::new(MockDataGateway::new()),
        scheduler: Arc::new(DelayScheduler::new(Arc::new(MockDelayQueue::new()))),
    };
    Arc::new(BotEngine::new(Arc::new(WorkflowRepo::new()), deps))
}

fn menu_workflow() -> WorkflowVersion {
    serde_json::from_value(json!({
        "id": "v1", "workflowId": "menu", "version": 1,
        "nodes": {
            "start": { "id": "start", "type": "trigger.command", "config": { "command": "/start" } },
            "ask": { "id": "ask", "type": "message.keyboard.inline",
                     "config": { "text": "Pick", "buttons": [[ { "text": "Go", "data": "go" } ]] } },
            "done": { "id": "done", "type": "flow.end", "config": { "message": "Done" } }
        },
        "connections": [
            { "id": "c1", "source": "start", "target": "ask" },
            { "id": "c2", "source": "ask", "target": "done" }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn waiting_execution_resumes_after_restart() {
    let dir = TempDir::new().unwrap();

    let first_messenger = Arc::new(MockMessenger::new());
    let engine = engine_on(&dir, first_messenger.clone());
    engine.publish("p1", menu_workflow()).await.unwrap();

    let waiting = engine
        .handle_event(InboundEvent {
            project_id: "p1".to_string(),
            chat_id: "chat1".to_string(),
            user_id: None,
            kind: EventKind::Command,
            text: Some("/start".to_string()),
            callback_data: None,
            contact: None,
            payload: Value::Null,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    drop(engine);

    // New process: fresh engine over the same store directory.
    let second_messenger = Arc::new(MockMessenger::new());
    let engine = engine_on(&dir, second_messenger.clone());
    engine.publish("p1", menu_workflow()).await.unwrap();

    let resumed = engine
        .handle_event(InboundEvent {
            project_id: "p1".to_string(),
            chat_id: "chat1".to_string(),
            user_id: None,
            kind: EventKind::Callback,
            text: None,
            callback_data: Some("go".to_string()),
            contact: None,
            payload: Value::Null,
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resumed.id, waiting.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert!(resumed.step_count > waiting.step_count);
    assert_eq!(second_messenger.sent_count(), 1);
}
