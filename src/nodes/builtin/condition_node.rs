use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::context::StepContext;
use crate::engine::interpreter::branch_var;
use crate::engine::types::StepOutcome;
use crate::error::EngineError;
use crate::eval::{CompareOp, evaluate_expression, evaluate_simple};
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};
use crate::vars::VarScope;

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum ConditionConfig {
    Simple {
        left: Value,
        operator: CompareOp,
        #[serde(default)]
        right: Value,
        #[serde(default)]
        case_sensitive: bool,
    },
    Expression {
        expression: String,
    },
}

/// Two-way branch. The verdict is written to a session variable the
/// interpreter reads when picking the "true"/"false" edge; the handler
/// itself never touches the graph.
pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    fn name(&self) -> &str {
        "condition"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        node_type == NodeType::Condition
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match serde_json::from_value::<ConditionConfig>(node.config.clone()) {
            Ok(ConditionConfig::Expression { expression }) if expression.trim().is_empty() => {
                ValidationResult::error(format!("node '{}': expression is empty", node.id))
            }
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let cfg: ConditionConfig = serde_json::from_value(node.config.clone()).map_err(|e| {
            EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e))
        })?;

        let result = match cfg {
            ConditionConfig::Simple {
                left,
                operator,
                right,
                case_sensitive,
            } => {
                let actual = ctx.render_json(&left).await;
                let expected = ctx.render_json(&right).await;
                evaluate_simple(&actual, operator, &expected, case_sensitive)
            }
            ConditionConfig::Expression { expression } => {
                let scope = ctx.snapshot().await;
                evaluate_expression(&expression, &scope)?
            }
        };

        ctx.log(
            &node.id,
            node.node_type,
            "info",
            format!("condition evaluated to {}", result),
        )
        .await;
        ctx.set_var(
            VarScope::Session,
            &branch_var(&node.id),
            Value::Bool(result),
            None,
        )
        .await?;

        Ok(StepOutcome::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "c1", "type": "condition", "config": config }))
            .unwrap()
    }

    #[test]
    fn simple_mode_parses() {
        let handler = ConditionHandler;
        let n = node(json!({
            "mode": "simple",
            "left": "{{balance}}",
            "operator": "greater",
            "right": 100
        }));
        assert!(handler.validate(&n).is_valid());
    }

    #[test]
    fn empty_expression_rejected() {
        let handler = ConditionHandler;
        let n = node(json!({ "mode": "expression", "expression": "  " }));
        assert!(!handler.validate(&n).is_valid());
    }

    #[test]
    fn unknown_mode_rejected() {
        let handler = ConditionHandler;
        let n = node(json!({ "mode": "script", "expression": "1" }));
        assert!(!handler.validate(&n).is_valid());
    }
}
