use anyhow::Result;
use async_trait::async_trait;

use crate::engine::context::StepContext;
use crate::engine::types::StepOutcome;
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};

/// Trigger nodes carry matching config for entry selection but do no
/// work at execution time; the interpreter just walks past them.
pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    fn name(&self) -> &str {
        "trigger"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        node_type.is_trigger()
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match node.node_type {
            NodeType::TriggerCommand => {
                match node.config.get("command").and_then(|v| v.as_str()) {
                    Some(c) if c.starts_with('/') && c.len() > 1 => ValidationResult::ok(),
                    Some(c) => ValidationResult::error(format!(
                        "command trigger '{}': command '{}' must start with '/'",
                        node.id, c
                    )),
                    None => ValidationResult::error(format!(
                        "command trigger '{}' requires a 'command' string",
                        node.id
                    )),
                }
            }
            _ => ValidationResult::ok(),
        }
    }

    async fn execute(&self, _node: &Node, _ctx: &mut StepContext) -> Result<StepOutcome> {
        Ok(StepOutcome::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "t1", "type": node_type, "config": config })).unwrap()
    }

    #[test]
    fn command_trigger_requires_slash_prefix() {
        let handler = TriggerHandler;
        assert!(
            handler
                .validate(&node("trigger.command", json!({ "command": "/start" })))
                .is_valid()
        );
        assert!(
            !handler
                .validate(&node("trigger.command", json!({ "command": "start" })))
                .is_valid()
        );
        assert!(
            !handler
                .validate(&node("trigger.command", json!({})))
                .is_valid()
        );
    }

    #[test]
    fn other_triggers_accept_empty_config() {
        let handler = TriggerHandler;
        assert!(handler.validate(&node("trigger.message", json!({}))).is_valid());
        assert!(handler.validate(&node("trigger.contact", json!({}))).is_valid());
    }
}
