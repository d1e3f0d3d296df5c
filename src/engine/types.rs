use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeId;

/// Lifecycle status of a durable execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Waiting => write!(f, "waiting"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The kind of external input a suspended execution is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    Contact,
    Callback,
    Text,
    Timer,
}

impl std::fmt::Display for WaitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitKind::Contact => write!(f, "contact"),
            WaitKind::Callback => write!(f, "callback"),
            WaitKind::Text => write!(f, "text"),
            WaitKind::Timer => write!(f, "timer"),
        }
    }
}

/// Persisted waiting state: enough to resume after an arbitrary delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitState {
    /// The node the execution is parked on. Resumption continues from
    /// this node's outgoing edges.
    pub node_id: NodeId,
    pub kind: WaitKind,
    /// Keyboard/prompt metadata, scheduler job id, and similar.
    #[serde(default)]
    pub payload: Value,
}

/// One durable, resumable run of a workflow for a single trigger/session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub project_id: String,
    pub workflow_id: String,
    pub version: u32,
    pub chat_id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_node_id: Option<NodeId>,
    #[serde(default)]
    pub wait: Option<WaitState>,
    pub step_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Append-only trace record for diagnosis. Never used for control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: String,
    pub step: u32,
    pub node_id: NodeId,
    pub node_type: String,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub at: DateTime<Utc>,
}

/// What a handler tells the interpreter to do next. Replaces the
/// ambiguous "null means follow the graph" convention with a closed set.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Defer to the connection graph: single edge, or the stored
    /// branch/switch result for multi-edge nodes.
    Advance,
    /// Jump to an explicit node unconditionally.
    Jump(NodeId),
    /// Halt without completing or failing; the execution stays waiting.
    Suspend(WaitState),
    /// Terminate the execution normally.
    Halt,
}

/// Classification of an inbound trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Text,
    Callback,
    Contact,
    Timer,
}

/// An inbound event from the chat platform (or the delay queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub project_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub kind: EventKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub callback_data: Option<String>,
    #[serde(default)]
    pub contact: Option<Value>,
    /// Raw platform payload, exposed to templates as `event.*`.
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    /// Session identity: one conversation per (project, chat).
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.project_id, self.chat_id)
    }

    /// The command verb of a command event (`/start arg` → `/start`).
    pub fn command(&self) -> Option<&str> {
        if self.kind != EventKind::Command {
            return None;
        }
        self.text.as_deref().and_then(|t| t.split_whitespace().next())
    }

    /// The wait kind this event can satisfy, if any.
    pub fn satisfies(&self) -> Option<WaitKind> {
        match self.kind {
            EventKind::Contact => Some(WaitKind::Contact),
            EventKind::Callback => Some(WaitKind::Callback),
            EventKind::Text | EventKind::Command => Some(WaitKind::Text),
            EventKind::Timer => Some(WaitKind::Timer),
        }
    }
}
