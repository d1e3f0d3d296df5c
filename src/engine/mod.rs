pub mod context;
pub mod interpreter;
pub mod scheduler;
pub mod types;
pub mod wait;

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::engine::context::{ContextManager, EngineDeps, StepContext, select_entry};
use crate::engine::interpreter::{RunOutcome, StepInterpreter};
use crate::engine::scheduler::TimerFired;
use crate::engine::types::{
    EventKind, Execution, ExecutionStatus, InboundEvent, WaitKind,
};
use crate::engine::wait::WaitCoordinator;
use crate::graph::WorkflowVersion;
use crate::graph::repo::WorkflowRepo;
use crate::nodes::{HandlerRegistry, builtin};

/// Facade tying the repository, registry, context manager and
/// interpreter together. One instance serves every project.
pub struct BotEngine {
    repo: Arc<WorkflowRepo>,
    registry: Arc<HandlerRegistry>,
    contexts: ContextManager,
    waits: WaitCoordinator,
    interpreter: StepInterpreter,
    deps: EngineDeps,
}

impl BotEngine {
    pub fn new(repo: Arc<WorkflowRepo>, deps: EngineDeps) -> Self {
        let registry = builtin::build_registry(repo.clone());
        Self {
            repo,
            registry: registry.clone(),
            contexts: ContextManager::new(deps.clone()),
            waits: WaitCoordinator::new(deps.store.clone()),
            interpreter: StepInterpreter::new(registry),
            deps,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn repo(&self) -> &Arc<WorkflowRepo> {
        &self.repo
    }

    pub fn deps(&self) -> &EngineDeps {
        &self.deps
    }

    /// Validate and activate a workflow version for a project.
    pub async fn publish(&self, project_id: &str, version: WorkflowVersion) -> Result<()> {
        self.repo.publish(project_id, version, &self.registry).await
    }

    /// Route one inbound platform event: resume the waiting execution it
    /// satisfies, or start a fresh one from the matching trigger.
    ///
    /// Returns the touched execution, or `None` when the event matched
    /// nothing (no published workflow, no trigger).
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Option<Execution>> {
        let Some(version) = self.repo.active(&event.project_id).await else {
            warn!(project = %event.project_id, "Event for project without a published workflow");
            return Ok(None);
        };

        if event.kind != EventKind::Timer
            && let Some(waiting) = self.waits.match_event(&event).await?
        {
            let resume_node = waiting
                .wait
                .as_ref()
                .map(|w| w.node_id.clone())
                .or_else(|| waiting.current_node_id.clone());
            let Some(resume_node) = resume_node else {
                warn!(execution_id = %waiting.id, "Waiting execution has no resume node; ignoring");
                return Ok(Some(waiting));
            };

            let mut ctx = self.contexts.resume(waiting, event, &version).await?;
            self.remember_reply(&ctx).await;
            let result = self.interpreter.run(&version, &mut ctx, resume_node, true).await;
            return Ok(Some(self.finish(ctx, result, &version).await?));
        }

        let Some(entry) = select_entry(&version, &event) else {
            info!(project = %event.project_id, "Event matched no trigger");
            return Ok(None);
        };

        let mut ctx = self.contexts.create(&version, event).await?;
        let result = self.interpreter.run(&version, &mut ctx, entry, false).await;
        Ok(Some(self.finish(ctx, result, &version).await?))
    }

    /// Resume an execution parked on a delay job that just fired.
    pub async fn resume_timer(&self, fired: TimerFired) -> Result<Option<Execution>> {
        let Some(execution) = self.deps.store.get(&fired.execution_id).await? else {
            warn!(execution_id = %fired.execution_id, "Timer fired for unknown execution");
            return Ok(None);
        };

        if execution.status != ExecutionStatus::Waiting
            || execution.wait.as_ref().map(|w| w.kind) != Some(WaitKind::Timer)
        {
            warn!(
                execution_id = %execution.id,
                status = %execution.status,
                "Timer fired for execution that is not timer-waiting"
            );
            return Ok(None);
        }

        let Some(version) = self.repo.active(&execution.project_id).await else {
            warn!(project = %execution.project_id, "Timer fired for project without a workflow");
            return Ok(None);
        };

        let event = InboundEvent {
            project_id: execution.project_id.clone(),
            chat_id: execution.chat_id.clone(),
            user_id: execution.user_id.clone(),
            kind: EventKind::Timer,
            text: None,
            callback_data: None,
            contact: None,
            payload: json!({ "job_id": fired.job_id }),
        };

        let mut ctx = self.contexts.resume(execution, event, &version).await?;
        let result = self
            .interpreter
            .run(&version, &mut ctx, fired.resume_node_id, true)
            .await;
        Ok(Some(self.finish(ctx, result, &version).await?))
    }

    /// Drive fired timers from the delay queue until the channel closes.
    pub async fn run_timer_loop(self: Arc<Self>, mut fired: UnboundedReceiver<TimerFired>) {
        while let Some(timer) = fired.recv().await {
            if let Err(e) = self.resume_timer(timer).await {
                error!(error = %e, "Timer resumption failed");
            }
        }
    }

    /// Expose what the user replied with to the resumed graph via
    /// session variables.
    async fn remember_reply(&self, ctx: &StepContext) {
        use crate::vars::VarScope;

        let updates = [
            ("last_text", ctx.event.text.clone().map(Into::into)),
            (
                "last_callback",
                ctx.event.callback_data.clone().map(Into::into),
            ),
            ("last_contact", ctx.event.contact.clone()),
        ];
        for (name, value) in updates {
            if let Some(value) = value
                && let Err(e) = ctx.set_var(VarScope::Session, name, value, None).await
            {
                warn!(error = %e, name, "Failed to record reply variable");
            }
        }
    }

    async fn finish(
        &self,
        mut ctx: StepContext,
        result: Result<RunOutcome>,
        version: &WorkflowVersion,
    ) -> Result<Execution> {
        match result {
            Ok(RunOutcome::Completed) => {
                self.contexts
                    .complete(&mut ctx.execution, ExecutionStatus::Completed, None)
                    .await?;
            }
            Ok(RunOutcome::Suspended) => {
                // Waiting state was already persisted by the coordinator.
            }
            Err(e) => {
                error!(
                    execution_id = %ctx.execution.id,
                    node = ?ctx.execution.current_node_id,
                    error = %format!("{:#}", e),
                    "Execution failed"
                );
                self.contexts
                    .complete(
                        &mut ctx.execution,
                        ExecutionStatus::Failed,
                        Some(format!("{:#}", e)),
                    )
                    .await?;

                // Tell the user the conversation broke, but only if the
                // bot already spoke; a silent failure stays silent.
                if ctx.sent_messages > 0
                    && let Some(message) = &version.settings.failure_message
                {
                    let payload = json!({
                        "chat_id": ctx.execution.chat_id,
                        "text": message,
                    });
                    if let Err(send_err) = self.deps.messenger.post("sendMessage", payload).await {
                        warn!(error = %send_err, "Failed to deliver failure message");
                    }
                }
            }
        }
        Ok(ctx.execution)
    }
}
