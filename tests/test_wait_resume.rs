//! Suspension, resumption and the one-wait-per-chat rule.

use std::sync::Arc;

use serde_json::{Value, json};

use botflow::clients::mock::{MockDataGateway, MockMessenger};
use botflow::engine::BotEngine;
use botflow::engine::context::EngineDeps;
use botflow::engine::scheduler::{DelayScheduler, MockDelayQueue, TimerFired};
use botflow::engine::types::{EventKind, ExecutionStatus, InboundEvent, WaitKind};
use botflow::engine::wait::SUPERSEDED_ERROR;
use botflow::graph::WorkflowVersion;
use botflow::graph::repo::WorkflowRepo;
use botflow::storage::ExecutionStore;
use botflow::storage::memory_store::MemoryExecutionStore;
use botflow::vars::memory::MemoryVariableStore;

struct Harness {
    engine: Arc<BotEngine>,
    messenger: Arc<MockMessenger>,
    store: Arc<MemoryExecutionStore>,
    queue: Arc<MockDelayQueue>,
}

fn harness() -> Harness {
    let messenger = Arc::new(MockMessenger::new());
    let store = Arc::new(MemoryExecutionStore::new());
    let queue = Arc::new(MockDelayQueue::new());
    let deps = EngineDeps {
        store: store.clone(),
        vars: Arc::new(MemoryVariableStore::new()),
        messenger: messenger.clone(),
        gateway: Arc::new(MockDataGateway::new()),
        scheduler: Arc::new(DelayScheduler::new(queue.clone())),
    };
    Harness {
        engine: Arc::new(BotEngine::new(Arc::new(WorkflowRepo::new()), deps)),
        messenger,
        store,
        queue,
    }
}

fn version(value: Value) -> WorkflowVersion {
    serde_json::from_value(value).unwrap()
}

fn event(kind: EventKind) -> InboundEvent {
    InboundEvent {
        project_id: "p1".to_string(),
        chat_id: "chat1".to_string(),
        user_id: Some("u1".to_string()),
        kind,
        text: None,
        callback_data: None,
        contact: None,
        payload: Value::Null,
    }
}

fn command(text: &str) -> InboundEvent {
    let mut e = event(EventKind::Command);
    e.text = Some(text.to_string());
    e
}

fn callback(data: &str) -> InboundEvent {
    let mut e = event(EventKind::Callback);
    e.callback_data = Some(data.to_string());
    e
}

/// Menu flow: /start shows an inline keyboard, the button press leads to
/// a confirmation message.
fn menu_workflow() -> WorkflowVersion {
    version(json!({
        "id": "v1", "workflowId": "menu", "version": 1,
        "nodes": {
            "start": { "id": "start", "type": "trigger.command", "config": { "command": "/start" } },
            "ask": { "id": "ask", "type": "message.keyboard.inline",
                     "config": { "text": "Pick one",
                                 "buttons": [[ { "text": "Buy", "data": "buy" } ]] } },
            "confirm": { "id": "confirm", "type": "message", "config": { "text": "You chose {{last_callback}}" } },
            "end": { "id": "end", "type": "flow.end" }
        },
        "connections": [
            { "id": "c1", "source": "start", "target": "ask" },
            { "id": "c2", "source": "ask", "target": "confirm" },
            { "id": "c3", "source": "confirm", "target": "end" }
        ]
    }))
}

// --- Suspend / resume round trip ---

#[tokio::test]
async fn keyboard_suspends_then_callback_resumes() {
    let h = harness();
    h.engine.publish("p1", menu_workflow()).await.unwrap();

    let waiting = h
        .engine
        .handle_event(command("/start"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    assert_eq!(waiting.wait.as_ref().unwrap().kind, WaitKind::Callback);
    assert_eq!(waiting.wait.as_ref().unwrap().node_id, "ask");
    let steps_at_suspend = waiting.step_count;
    assert_eq!(steps_at_suspend, 2);

    let resumed = h
        .engine
        .handle_event(callback("buy"))
        .await
        .unwrap()
        .unwrap();

    // Same durable execution continued, not a new one.
    assert_eq!(resumed.id, waiting.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert!(resumed.step_count > steps_at_suspend);

    let payloads = h.messenger.sent.lock().unwrap();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1].1["text"], "You chose buy");
}

#[tokio::test]
async fn waiting_node_is_not_reexecuted_on_resume() {
    let h = harness();
    h.engine.publish("p1", menu_workflow()).await.unwrap();

    h.engine.handle_event(command("/start")).await.unwrap();
    h.engine.handle_event(callback("buy")).await.unwrap();

    // The keyboard was sent exactly once.
    let methods = h.messenger.sent_methods();
    assert_eq!(methods, vec!["sendMessage", "sendMessage"]);
    let payloads = h.messenger.sent.lock().unwrap();
    assert_eq!(payloads[0].1["text"], "Pick one");
}

// --- Supersede rule ---

#[tokio::test]
async fn newer_wait_supersedes_older_execution() {
    let h = harness();
    h.engine.publish("p1", menu_workflow()).await.unwrap();

    let first = h
        .engine
        .handle_event(command("/start"))
        .await
        .unwrap()
        .unwrap();
    let second = h
        .engine
        .handle_event(command("/start"))
        .await
        .unwrap()
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.status, ExecutionStatus::Waiting);

    let stale = h.store.get(&first.id).await.unwrap().unwrap();
    assert_eq!(stale.status, ExecutionStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some(SUPERSEDED_ERROR));

    // The button press resumes only the newer execution.
    let resumed = h
        .engine
        .handle_event(callback("buy"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.id, second.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn waits_in_other_chats_are_untouched() {
    let h = harness();
    h.engine.publish("p1", menu_workflow()).await.unwrap();

    let chat1 = h
        .engine
        .handle_event(command("/start"))
        .await
        .unwrap()
        .unwrap();

    let mut other = command("/start");
    other.chat_id = "chat2".to_string();
    let chat2 = h.engine.handle_event(other).await.unwrap().unwrap();

    assert_eq!(chat2.status, ExecutionStatus::Waiting);
    let still_waiting = h.store.get(&chat1.id).await.unwrap().unwrap();
    assert_eq!(still_waiting.status, ExecutionStatus::Waiting);
}

// --- Contact collection ---

#[tokio::test]
async fn contact_request_waits_for_shared_contact() {
    let h = harness();
    h.engine
        .publish(
            "p1",
            version(json!({
                "id": "v1", "workflowId": "link", "version": 1,
                "nodes": {
                    "start": { "id": "start", "type": "trigger.command", "config": { "command": "/link" } },
                    "ask": { "id": "ask", "type": "action.request_contact",
                             "config": { "text": "Share your phone" } },
                    "thanks": { "id": "thanks", "type": "message",
                                "config": { "text": "Got {{event.contact.phone}}" } }
                },
                "connections": [
                    { "id": "c1", "source": "start", "target": "ask" },
                    { "id": "c2", "source": "ask", "target": "thanks" }
                ]
            })),
        )
        .await
        .unwrap();

    let waiting = h
        .engine
        .handle_event(command("/link"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waiting.wait.as_ref().unwrap().kind, WaitKind::Contact);

    let mut share = event(EventKind::Contact);
    share.contact = Some(json!({ "phone": "+15550100" }));
    share.payload = json!({ "contact": { "phone": "+15550100" } });
    let resumed = h.engine.handle_event(share).await.unwrap().unwrap();

    assert_eq!(resumed.id, waiting.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    let payloads = h.messenger.sent.lock().unwrap();
    assert_eq!(payloads[1].1["text"], "Got +15550100");
}

// --- Delays and timers ---

fn delay_workflow(duration_ms: u64) -> WorkflowVersion {
    version(json!({
        "id": "v1", "workflowId": "slow", "version": 1,
        "nodes": {
            "start": { "id": "start", "type": "trigger.command", "config": { "command": "/wait" } },
            "nap": { "id": "nap", "type": "flow.delay", "config": { "duration_ms": duration_ms } },
            "after": { "id": "after", "type": "message", "config": { "text": "awake" } }
        },
        "connections": [
            { "id": "c1", "source": "start", "target": "nap" },
            { "id": "c2", "source": "nap", "target": "after" }
        ]
    }))
}

#[tokio::test]
async fn short_delay_stays_synchronous() {
    let h = harness();
    h.engine.publish("p1", delay_workflow(20)).await.unwrap();

    let execution = h
        .engine
        .handle_event(command("/wait"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.queue.schedule_count().await, 0);
    assert_eq!(h.messenger.sent_count(), 1);
}

#[tokio::test]
async fn long_delay_suspends_and_timer_resumes() {
    let h = harness();
    h.engine.publish("p1", delay_workflow(60_000)).await.unwrap();

    let waiting = h
        .engine
        .handle_event(command("/wait"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    assert_eq!(waiting.wait.as_ref().unwrap().kind, WaitKind::Timer);
    assert_eq!(h.queue.schedule_count().await, 1);
    assert_eq!(h.messenger.sent_count(), 0);

    let resumed = h
        .engine
        .resume_timer(TimerFired {
            job_id: "job-0".to_string(),
            execution_id: waiting.id.clone(),
            resume_node_id: "nap".to_string(),
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(h.messenger.sent_count(), 1);
}

#[tokio::test]
async fn timer_for_completed_execution_is_ignored() {
    let h = harness();
    h.engine.publish("p1", delay_workflow(20)).await.unwrap();

    let execution = h
        .engine
        .handle_event(command("/wait"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let result = h
        .engine
        .resume_timer(TimerFired {
            job_id: "stray".to_string(),
            execution_id: execution.id,
            resume_node_id: "nap".to_string(),
        })
        .await
        .unwrap();
    assert!(result.is_none());
}
