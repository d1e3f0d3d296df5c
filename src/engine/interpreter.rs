use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::engine::context::StepContext;
use crate::engine::types::StepOutcome;
use crate::engine::wait::WaitCoordinator;
use crate::error::EngineError;
use crate::graph::{Connection, Node, NodeId, NodeType, WorkflowVersion};
use crate::nodes::HandlerRegistry;
use crate::vars::VarScope;

/// Session variable a condition handler stores its result under.
pub fn branch_var(node_id: &str) -> String {
    format!("_branch_{}", node_id)
}

/// Session variable a switch handler stores its case index under.
pub fn case_var(node_id: &str) -> String {
    format!("_case_{}", node_id)
}

/// How the loop ended for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Suspended,
}

/// The loop that walks the graph: resolve node, resolve handler,
/// execute, pick the next node. Exclusively owns execution-record
/// transitions while running.
pub struct StepInterpreter {
    registry: Arc<HandlerRegistry>,
}

impl StepInterpreter {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Execute from `start`. When `resume` is set, `start` is the node
    /// the execution was parked on: the wait is considered satisfied and
    /// the walk continues from its outgoing edges without re-executing
    /// it.
    pub async fn run(
        &self,
        version: &WorkflowVersion,
        ctx: &mut StepContext,
        start: NodeId,
        resume: bool,
    ) -> Result<RunOutcome> {
        let wait = WaitCoordinator::new(ctx.store.clone());
        let mut visits: HashMap<NodeId, u32> = HashMap::new();

        let mut current: Option<NodeId> = if resume {
            let node = version.node(&start).ok_or_else(|| {
                EngineError::Config(format!("resume node '{}' no longer exists", start))
            })?;
            self.select_next(version, ctx, node).await?
        } else {
            Some(start)
        };

        while let Some(node_id) = current {
            if ctx.execution.step_count >= ctx.max_steps {
                return Err(EngineError::Guard(format!(
                    "step budget of {} exceeded",
                    ctx.max_steps
                ))
                .into());
            }

            let seen = visits.entry(node_id.clone()).or_insert(0);
            *seen += 1;
            if *seen > ctx.visit_ceiling {
                return Err(EngineError::Guard(format!(
                    "infinite loop detected: node '{}' visited more than {} times",
                    node_id, ctx.visit_ceiling
                ))
                .into());
            }

            let node = version.node(&node_id).ok_or_else(|| {
                EngineError::Config(format!("node '{}' does not exist in this version", node_id))
            })?;

            let handler = self.registry.get(&node.node_type).ok_or_else(|| {
                EngineError::Config(format!("no handler registered for type {}", node.node_type))
            })?;

            ctx.execution.step_count += 1;
            ctx.execution.current_node_id = Some(node_id.clone());
            ctx.store.update(&ctx.execution).await?;

            debug!(
                execution_id = %ctx.execution.id,
                step = ctx.execution.step_count,
                node = %node_id,
                node_type = %node.node_type,
                "Executing node"
            );
            ctx.log(&node_id, node.node_type, "info", format!("step {}", ctx.execution.step_count))
                .await;

            let outcome = handler.execute(node, ctx).await.map_err(|e| {
                anyhow::Error::from(EngineError::handler(&node_id, format!("{:#}", e)))
            })?;

            match outcome {
                StepOutcome::Halt => {
                    info!(execution_id = %ctx.execution.id, node = %node_id, "Reached end node");
                    return Ok(RunOutcome::Completed);
                }
                StepOutcome::Suspend(wait_state) => {
                    wait.suspend(&mut ctx.execution, wait_state).await?;
                    return Ok(RunOutcome::Suspended);
                }
                StepOutcome::Jump(target) => {
                    current = Some(target);
                }
                StepOutcome::Advance => {
                    current = self.select_next(version, ctx, node).await?;
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Pick the next node from the connection graph: a single edge is
    /// followed directly; branching nodes use their stored result; zero
    /// edges means normal termination.
    async fn select_next(
        &self,
        version: &WorkflowVersion,
        ctx: &StepContext,
        node: &Node,
    ) -> Result<Option<NodeId>> {
        let outgoing = version.outgoing(&node.id);

        match outgoing.len() {
            0 => Ok(None),
            1 => Ok(Some(outgoing[0].target.clone())),
            _ => match node.node_type {
                NodeType::Condition => {
                    let result = ctx
                        .get_var(VarScope::Session, &branch_var(&node.id))
                        .await
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let handle = if result { "true" } else { "false" };
                    self.edge_by_handle(&outgoing, handle, &node.id)
                }
                NodeType::FlowLoop => {
                    let continuing = ctx
                        .get_var(VarScope::Session, &branch_var(&node.id))
                        .await
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let handle = if continuing { "loop" } else { "done" };
                    self.edge_by_handle(&outgoing, handle, &node.id)
                }
                NodeType::FlowSwitch => {
                    let index = ctx
                        .get_var(VarScope::Session, &case_var(&node.id))
                        .await
                        .and_then(|v| v.as_u64())
                        .unwrap_or(u64::MAX);
                    let case_count = node
                        .config
                        .get("cases")
                        .and_then(|v| v.as_array())
                        .map(|a| a.len() as u64)
                        .unwrap_or(0);
                    let handle = if index < case_count {
                        format!("case_{}", index)
                    } else {
                        "default".to_string()
                    };
                    self.edge_by_handle(&outgoing, &handle, &node.id)
                }
                _ => Err(EngineError::Config(format!(
                    "node '{}' has {} outgoing connections but is not a branching type",
                    node.id,
                    outgoing.len()
                ))
                .into()),
            },
        }
    }

    /// Exact handle match first, then a "default" edge.
    fn edge_by_handle(
        &self,
        outgoing: &[&Connection],
        handle: &str,
        node_id: &str,
    ) -> Result<Option<NodeId>> {
        if let Some(conn) = outgoing
            .iter()
            .find(|c| c.source_handle.as_deref() == Some(handle))
        {
            return Ok(Some(conn.target.clone()));
        }
        if let Some(conn) = outgoing
            .iter()
            .find(|c| c.source_handle.as_deref() == Some("default"))
        {
            return Ok(Some(conn.target.clone()));
        }
        Err(EngineError::Config(format!(
            "node '{}' has no outgoing edge for handle '{}' and no default edge",
            node_id, handle
        ))
        .into())
    }
}
