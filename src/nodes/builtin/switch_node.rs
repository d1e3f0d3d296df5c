use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::context::StepContext;
use crate::engine::interpreter::case_var;
use crate::engine::types::StepOutcome;
use crate::error::EngineError;
use crate::eval::{CompareOp, evaluate_simple};
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};
use crate::vars::VarScope;

#[derive(Debug, Deserialize)]
struct SwitchConfig {
    /// Template resolved once, then compared against every case in
    /// order.
    value: Value,
    cases: Vec<SwitchCase>,
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    #[serde(default = "default_op")]
    operator: CompareOp,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    case_sensitive: bool,
}

fn default_op() -> CompareOp {
    CompareOp::Equals
}

/// Multi-way branch: the first matching case wins and its index is
/// stored for edge selection ("case_0", "case_1", …); no match selects
/// the "default" edge.
pub struct SwitchHandler;

#[async_trait]
impl NodeHandler for SwitchHandler {
    fn name(&self) -> &str {
        "switch"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        node_type == NodeType::FlowSwitch
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match serde_json::from_value::<SwitchConfig>(node.config.clone()) {
            Ok(cfg) if cfg.cases.is_empty() => {
                ValidationResult::error(format!("node '{}': switch has no cases", node.id))
            }
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let cfg: SwitchConfig = serde_json::from_value(node.config.clone()).map_err(|e| {
            EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e))
        })?;

        let actual = ctx.render_json(&cfg.value).await;

        let mut matched = cfg.cases.len();
        for (index, case) in cfg.cases.iter().enumerate() {
            let expected = ctx.render_json(&case.value).await;
            if evaluate_simple(&actual, case.operator, &expected, case.case_sensitive) {
                matched = index;
                break;
            }
        }

        let label = if matched < cfg.cases.len() {
            format!("case_{}", matched)
        } else {
            "default".to_string()
        };
        ctx.log(
            &node.id,
            node.node_type,
            "info",
            format!("switch selected {}", label),
        )
        .await;

        // An index past the last case means "default" to the
        // interpreter.
        ctx.set_var(VarScope::Session, &case_var(&node.id), json!(matched), None)
            .await?;

        Ok(StepOutcome::Advance)
    }
}
