use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::engine::context::StepContext;
use crate::engine::interpreter::{RunOutcome, StepInterpreter};
use crate::engine::types::StepOutcome;
use crate::error::EngineError;
use crate::graph::repo::WorkflowRepo;
use crate::graph::{Node, NodeType};
use crate::nodes::{HandlerRegistry, NodeHandler, ValidationResult};

/// Maximum sub-workflow nesting depth.
pub const MAX_SUB_DEPTH: u32 = 5;

#[derive(Debug, Deserialize)]
struct SubWorkflowConfig {
    workflow_id: String,
}

/// Runs another published workflow inline, sharing the parent's
/// execution record, variable scopes and step budget. Child graphs may
/// not suspend; a wait inside a sub-workflow fails the step.
pub struct SubWorkflowHandler {
    repo: Arc<WorkflowRepo>,
    registry: OnceLock<Weak<HandlerRegistry>>,
}

impl SubWorkflowHandler {
    pub fn new(repo: Arc<WorkflowRepo>) -> Self {
        Self {
            repo,
            registry: OnceLock::new(),
        }
    }

    /// Late-bind the finished registry; called once at bootstrap.
    pub fn bind(&self, registry: Weak<HandlerRegistry>) {
        let _ = self.registry.set(registry);
    }

    fn registry(&self) -> Result<Arc<HandlerRegistry>> {
        self.registry
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                EngineError::Config("sub-workflow handler is not bound to a registry".to_string())
                    .into()
            })
    }
}

#[async_trait]
impl NodeHandler for SubWorkflowHandler {
    fn name(&self) -> &str {
        "sub_workflow"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        node_type == NodeType::FlowSubWorkflow
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match serde_json::from_value::<SubWorkflowConfig>(node.config.clone()) {
            Ok(cfg) if cfg.workflow_id.trim().is_empty() => {
                ValidationResult::error(format!("node '{}': workflow_id is empty", node.id))
            }
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let cfg: SubWorkflowConfig = serde_json::from_value(node.config.clone()).map_err(|e| {
            EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e))
        })?;

        if ctx.depth >= MAX_SUB_DEPTH {
            return Err(EngineError::Guard(format!(
                "sub-workflow nesting exceeds depth {}",
                MAX_SUB_DEPTH
            ))
            .into());
        }

        let version = self
            .repo
            .by_workflow_id(&cfg.workflow_id)
            .await
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "sub-workflow '{}' is not published",
                    cfg.workflow_id
                ))
            })?;

        let entry = version.entry_node_id.clone().ok_or_else(|| {
            EngineError::Config(format!(
                "sub-workflow '{}' has no entry node",
                cfg.workflow_id
            ))
        })?;

        info!(
            execution_id = %ctx.execution.id,
            workflow = %cfg.workflow_id,
            depth = ctx.depth + 1,
            "Entering sub-workflow"
        );

        let interpreter = StepInterpreter::new(self.registry()?);
        ctx.depth += 1;
        let result = interpreter.run(&version, ctx, entry, false).await;
        ctx.depth -= 1;

        match result? {
            RunOutcome::Completed => Ok(StepOutcome::Advance),
            RunOutcome::Suspended => Err(EngineError::handler(
                &node.id,
                format!("sub-workflow '{}' tried to suspend", cfg.workflow_id),
            )
            .into()),
        }
    }
}
