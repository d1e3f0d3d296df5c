use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::context::StepContext;
use crate::engine::interpreter::branch_var;
use crate::engine::scheduler::{DelayOutcome, MAX_DELAY_MS};
use crate::engine::types::{StepOutcome, WaitKind, WaitState};
use crate::error::EngineError;
use crate::eval::evaluate_expression;
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};
use crate::vars::VarScope;

/// Iteration cap for a single loop node, independent of step budget.
pub const LOOP_MAX_ITERATIONS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct DelayConfig {
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct JumpConfig {
    target: String,
}

#[derive(Debug, Deserialize)]
struct EndConfig {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LoopConfig {
    Count {
        count: u64,
        #[serde(default = "default_index_var")]
        index_var: String,
    },
    ForEach {
        items: Value,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
    },
    While {
        expression: String,
        #[serde(default = "default_index_var")]
        index_var: String,
    },
}

fn default_index_var() -> String {
    "loop_index".to_string()
}

fn default_item_var() -> String {
    "loop_item".to_string()
}

fn loop_counter(node_id: &str) -> String {
    format!("_loop_{}", node_id)
}

/// Control-flow nodes: delay, jump, end and loop. Loops keep their
/// iteration counter in a session variable and signal "loop"/"done"
/// through the branch variable the interpreter reads.
pub struct FlowHandler;

#[async_trait]
impl NodeHandler for FlowHandler {
    fn name(&self) -> &str {
        "flow"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        matches!(
            node_type,
            NodeType::FlowDelay | NodeType::FlowJump | NodeType::FlowEnd | NodeType::FlowLoop
        )
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match node.node_type {
            NodeType::FlowDelay => {
                match serde_json::from_value::<DelayConfig>(node.config.clone()) {
                    Ok(cfg) if cfg.duration_ms > MAX_DELAY_MS => ValidationResult::error(
                        format!("node '{}': delay exceeds the 24-hour maximum", node.id),
                    ),
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::FlowJump => {
                match serde_json::from_value::<JumpConfig>(node.config.clone()) {
                    Ok(cfg) if cfg.target.trim().is_empty() => ValidationResult::error(format!(
                        "node '{}': jump target is empty",
                        node.id
                    )),
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::FlowEnd => ValidationResult::ok(),
            NodeType::FlowLoop => {
                match serde_json::from_value::<LoopConfig>(node.config.clone()) {
                    Ok(LoopConfig::Count { count, .. }) if count > LOOP_MAX_ITERATIONS => {
                        ValidationResult::error(format!(
                            "node '{}': loop count exceeds {} iterations",
                            node.id, LOOP_MAX_ITERATIONS
                        ))
                    }
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            other => ValidationResult::error(format!("flow handler cannot validate type {}", other)),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        match node.node_type {
            NodeType::FlowDelay => {
                let cfg: DelayConfig = parse(node)?;
                let outcome = ctx
                    .scheduler
                    .delay(&ctx.execution.id, &node.id, cfg.duration_ms)
                    .await?;
                match outcome {
                    DelayOutcome::Slept => Ok(StepOutcome::Advance),
                    DelayOutcome::Scheduled { job_id } => Ok(StepOutcome::Suspend(WaitState {
                        node_id: node.id.clone(),
                        kind: WaitKind::Timer,
                        payload: json!({ "job_id": job_id }),
                    })),
                }
            }

            NodeType::FlowJump => {
                let cfg: JumpConfig = parse(node)?;
                Ok(StepOutcome::Jump(cfg.target))
            }

            NodeType::FlowEnd => {
                let cfg: EndConfig = parse(node)?;
                if let Some(message) = cfg.message {
                    let text = ctx.render(&message).await;
                    let payload = json!({ "chat_id": ctx.execution.chat_id, "text": text });
                    let response = ctx.messenger.post("sendMessage", payload).await?;
                    if response.ok {
                        ctx.sent_messages += 1;
                    }
                }
                Ok(StepOutcome::Halt)
            }

            NodeType::FlowLoop => self.step_loop(node, ctx).await,

            other => Err(EngineError::handler(
                &node.id,
                format!("flow handler cannot execute type {}", other),
            )
            .into()),
        }
    }
}

impl FlowHandler {
    async fn step_loop(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let cfg: LoopConfig = parse(node)?;
        let counter_name = loop_counter(&node.id);

        let iteration = ctx
            .get_var(VarScope::Session, &counter_name)
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if iteration >= LOOP_MAX_ITERATIONS {
            return Err(EngineError::Guard(format!(
                "loop '{}' exceeded {} iterations",
                node.id, LOOP_MAX_ITERATIONS
            ))
            .into());
        }

        let (continuing, index_var) = match &cfg {
            LoopConfig::Count { count, index_var } => (iteration < *count, index_var.clone()),
            LoopConfig::ForEach {
                items,
                item_var,
                index_var,
            } => {
                let resolved = ctx.render_json(items).await;
                let Some(array) = resolved.as_array() else {
                    return Err(EngineError::handler(
                        &node.id,
                        "loop items did not resolve to an array",
                    )
                    .into());
                };
                let continuing = (iteration as usize) < array.len();
                if continuing {
                    ctx.set_var(
                        VarScope::Session,
                        item_var,
                        array[iteration as usize].clone(),
                        None,
                    )
                    .await?;
                }
                (continuing, index_var.clone())
            }
            LoopConfig::While {
                expression,
                index_var,
            } => {
                let scope = ctx.snapshot().await;
                (evaluate_expression(expression, &scope)?, index_var.clone())
            }
        };

        if continuing {
            ctx.set_var(VarScope::Session, &index_var, json!(iteration), None)
                .await?;
            ctx.set_var(
                VarScope::Session,
                &counter_name,
                json!(iteration + 1),
                None,
            )
            .await?;
        } else {
            // Reset so a later pass through the same node starts fresh.
            ctx.vars
                .delete(&ctx.scope_key(VarScope::Session), &counter_name)
                .await?;
        }

        ctx.set_var(
            VarScope::Session,
            &branch_var(&node.id),
            Value::Bool(continuing),
            None,
        )
        .await?;
        Ok(StepOutcome::Advance)
    }
}

fn parse<T: serde::de::DeserializeOwned>(node: &Node) -> Result<T> {
    serde_json::from_value(node.config.clone()).map_err(|e| {
        EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "f1", "type": node_type, "config": config })).unwrap()
    }

    #[test]
    fn delay_over_24h_rejected_at_validation() {
        let handler = FlowHandler;
        let n = node("flow.delay", json!({ "duration_ms": 25 * 60 * 60 * 1000u64 }));
        assert!(!handler.validate(&n).is_valid());
        let n = node("flow.delay", json!({ "duration_ms": 500 }));
        assert!(handler.validate(&n).is_valid());
    }

    #[test]
    fn jump_requires_target() {
        let handler = FlowHandler;
        assert!(!handler.validate(&node("flow.jump", json!({}))).is_valid());
        assert!(
            !handler
                .validate(&node("flow.jump", json!({ "target": " " })))
                .is_valid()
        );
        assert!(
            handler
                .validate(&node("flow.jump", json!({ "target": "n2" })))
                .is_valid()
        );
    }

    #[test]
    fn loop_count_capped() {
        let handler = FlowHandler;
        let n = node("flow.loop", json!({ "kind": "count", "count": 1001 }));
        assert!(!handler.validate(&n).is_valid());
        let n = node("flow.loop", json!({ "kind": "count", "count": 3 }));
        assert!(handler.validate(&n).is_valid());
    }
}
