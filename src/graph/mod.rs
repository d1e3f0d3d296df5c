pub mod repo;
pub mod validate;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a node within a workflow version.
pub type NodeId = String;

/// Closed taxonomy of node types. The serde representation matches the
/// wire strings used by the workflow editor (`trigger.command`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "trigger.command")]
    TriggerCommand,
    #[serde(rename = "trigger.message")]
    TriggerMessage,
    #[serde(rename = "trigger.callback")]
    TriggerCallback,
    #[serde(rename = "trigger.webhook")]
    TriggerWebhook,
    #[serde(rename = "trigger.contact")]
    TriggerContact,

    #[serde(rename = "message")]
    Message,
    #[serde(rename = "message.keyboard.inline")]
    MessageKeyboardInline,
    #[serde(rename = "message.keyboard.reply")]
    MessageKeyboardReply,
    #[serde(rename = "message.photo")]
    MessagePhoto,
    #[serde(rename = "message.video")]
    MessageVideo,
    #[serde(rename = "message.document")]
    MessageDocument,
    #[serde(rename = "message.edit")]
    MessageEdit,
    #[serde(rename = "message.delete")]
    MessageDelete,

    #[serde(rename = "condition")]
    Condition,

    #[serde(rename = "flow.delay")]
    FlowDelay,
    #[serde(rename = "flow.loop")]
    FlowLoop,
    #[serde(rename = "flow.jump")]
    FlowJump,
    #[serde(rename = "flow.switch")]
    FlowSwitch,
    #[serde(rename = "flow.end")]
    FlowEnd,
    #[serde(rename = "flow.sub_workflow")]
    FlowSubWorkflow,

    #[serde(rename = "action.api_request")]
    ActionApiRequest,
    #[serde(rename = "action.database_query")]
    ActionDatabaseQuery,
    #[serde(rename = "action.set_variable")]
    ActionSetVariable,
    #[serde(rename = "action.get_variable")]
    ActionGetVariable,
    #[serde(rename = "action.request_contact")]
    ActionRequestContact,
    #[serde(rename = "action.send_notification")]
    ActionSendNotification,
    #[serde(rename = "action.check_user_linked")]
    ActionCheckUserLinked,
    #[serde(rename = "action.find_user_by_contact")]
    ActionFindUserByContact,
    #[serde(rename = "action.link_account")]
    ActionLinkAccount,
    #[serde(rename = "action.get_balance")]
    ActionGetBalance,

    #[serde(rename = "integration.webhook")]
    IntegrationWebhook,
    #[serde(rename = "integration.analytics")]
    IntegrationAnalytics,
}

impl NodeType {
    /// Every known node type, in taxonomy order. Used by the registry to
    /// probe handler capabilities at bootstrap.
    pub fn all() -> &'static [NodeType] {
        use NodeType::*;
        &[
            TriggerCommand,
            TriggerMessage,
            TriggerCallback,
            TriggerWebhook,
            TriggerContact,
            Message,
            MessageKeyboardInline,
            MessageKeyboardReply,
            MessagePhoto,
            MessageVideo,
            MessageDocument,
            MessageEdit,
            MessageDelete,
            Condition,
            FlowDelay,
            FlowLoop,
            FlowJump,
            FlowSwitch,
            FlowEnd,
            FlowSubWorkflow,
            ActionApiRequest,
            ActionDatabaseQuery,
            ActionSetVariable,
            ActionGetVariable,
            ActionRequestContact,
            ActionSendNotification,
            ActionCheckUserLinked,
            ActionFindUserByContact,
            ActionLinkAccount,
            ActionGetBalance,
            IntegrationWebhook,
            IntegrationAnalytics,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        use NodeType::*;
        match self {
            TriggerCommand => "trigger.command",
            TriggerMessage => "trigger.message",
            TriggerCallback => "trigger.callback",
            TriggerWebhook => "trigger.webhook",
            TriggerContact => "trigger.contact",
            Message => "message",
            MessageKeyboardInline => "message.keyboard.inline",
            MessageKeyboardReply => "message.keyboard.reply",
            MessagePhoto => "message.photo",
            MessageVideo => "message.video",
            MessageDocument => "message.document",
            MessageEdit => "message.edit",
            MessageDelete => "message.delete",
            Condition => "condition",
            FlowDelay => "flow.delay",
            FlowLoop => "flow.loop",
            FlowJump => "flow.jump",
            FlowSwitch => "flow.switch",
            FlowEnd => "flow.end",
            FlowSubWorkflow => "flow.sub_workflow",
            ActionApiRequest => "action.api_request",
            ActionDatabaseQuery => "action.database_query",
            ActionSetVariable => "action.set_variable",
            ActionGetVariable => "action.get_variable",
            ActionRequestContact => "action.request_contact",
            ActionSendNotification => "action.send_notification",
            ActionCheckUserLinked => "action.check_user_linked",
            ActionFindUserByContact => "action.find_user_by_contact",
            ActionLinkAccount => "action.link_account",
            ActionGetBalance => "action.get_balance",
            IntegrationWebhook => "integration.webhook",
            IntegrationAnalytics => "integration.analytics",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            NodeType::TriggerCommand
                | NodeType::TriggerMessage
                | NodeType::TriggerCallback
                | NodeType::TriggerWebhook
                | NodeType::TriggerContact
        )
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step in a workflow graph. The config shape is determined entirely
/// by `node_type`; handlers parse it into typed structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: String,
    // Absent configs must parse as `{}` (not `null`) so handlers with
    // fully-defaultable config structs can deserialize them.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Directed edge between two nodes. `source_handle` disambiguates
/// multiple outgoing edges from branching nodes ("true"/"false",
/// "case_0", "default").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Per-version execution settings with guard defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Maximum total steps per execution.
    pub max_steps: u32,
    /// Maximum visits of a single node per execution (cycle guard).
    pub visit_ceiling: u32,
    /// Optional message sent best-effort when an execution fails after
    /// at least one message was already delivered.
    pub failure_message: Option<String>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_steps: 200,
            visit_ceiling: 100,
            failure_message: None,
        }
    }
}

/// Immutable snapshot of a published workflow. A new version is built
/// wholesale and swapped atomically; there is no mutation API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub id: String,
    pub workflow_id: String,
    pub version: u32,
    pub nodes: HashMap<NodeId, Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub entry_node_id: Option<NodeId>,
    #[serde(default)]
    pub variable_defaults: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All connections leaving `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source == node_id)
            .collect()
    }

    /// Trigger nodes of this version, for entry selection.
    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.node_type.is_trigger())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_roundtrip() {
        for t in NodeType::all() {
            let s = serde_json::to_string(t).unwrap();
            assert_eq!(s, format!("\"{}\"", t.as_str()));
            let back: NodeType = serde_json::from_str(&s).unwrap();
            assert_eq!(back, *t);
        }
    }

    #[test]
    fn outgoing_filters_by_source() {
        let version: WorkflowVersion = serde_json::from_value(serde_json::json!({
            "id": "v1",
            "workflowId": "wf",
            "version": 1,
            "nodes": {
                "a": { "id": "a", "type": "message", "config": { "text": "hi" } },
                "b": { "id": "b", "type": "flow.end" }
            },
            "connections": [
                { "id": "c1", "source": "a", "target": "b" }
            ]
        }))
        .unwrap();

        assert_eq!(version.outgoing("a").len(), 1);
        assert!(version.outgoing("b").is_empty());
        assert_eq!(version.settings.max_steps, 200);
    }
}
