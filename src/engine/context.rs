use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clients::{DataGateway, Messenger};
use crate::engine::scheduler::DelayScheduler;
use crate::engine::types::{
    EventKind, Execution, ExecutionStatus, InboundEvent, LogEntry,
};
use crate::eval::EvalScope;
use crate::graph::{NodeId, NodeType, WorkflowVersion};
use crate::storage::ExecutionStore;
use crate::template::{self, TemplateContext};
use crate::vars::{ScopeKey, VarScope, VariableStore};

/// Everything a handler sees while executing one node. The interpreter
/// owns execution-record transitions; handlers reach state only through
/// the variable store and signal via their return value.
pub struct StepContext {
    pub execution: Execution,
    pub event: InboundEvent,
    /// Project metadata exposed to templates as `project.*`.
    pub project: Value,
    pub vars: Arc<dyn VariableStore>,
    pub messenger: Arc<dyn Messenger>,
    pub gateway: Arc<dyn DataGateway>,
    pub scheduler: Arc<DelayScheduler>,
    pub store: Arc<dyn ExecutionStore>,
    pub max_steps: u32,
    pub visit_ceiling: u32,
    /// Sub-workflow nesting depth of this context.
    pub depth: u32,
    /// Messages delivered so far, used for the failure-message decision.
    pub sent_messages: u32,
}

impl StepContext {
    pub fn scope_key(&self, scope: VarScope) -> ScopeKey {
        match scope {
            VarScope::Global => ScopeKey::global(),
            VarScope::Project => ScopeKey::project(self.execution.project_id.clone()),
            VarScope::User => ScopeKey::user(
                self.execution
                    .user_id
                    .clone()
                    .unwrap_or_else(|| self.execution.chat_id.clone()),
            ),
            VarScope::Session => ScopeKey::session(self.execution.session_id.clone()),
        }
    }

    /// Snapshot the four variable scopes for expression evaluation and
    /// template rendering.
    pub async fn snapshot(&self) -> EvalScope {
        EvalScope {
            global: self.vars.list(&self.scope_key(VarScope::Global)).await,
            project: self.vars.list(&self.scope_key(VarScope::Project)).await,
            user: self.vars.list(&self.scope_key(VarScope::User)).await,
            session: self.vars.list(&self.scope_key(VarScope::Session)).await,
        }
    }

    pub async fn get_var(&self, scope: VarScope, name: &str) -> Option<Value> {
        self.vars.get(&self.scope_key(scope), name).await
    }

    pub async fn set_var(
        &self,
        scope: VarScope,
        name: &str,
        value: Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        self.vars
            .set(&self.scope_key(scope), name, value, ttl)
            .await
    }

    /// Render a template string against this step's namespaces.
    pub async fn render(&self, template_str: &str) -> String {
        let scope = self.snapshot().await;
        template::render(
            template_str,
            &TemplateContext {
                event: &self.event.payload,
                project: &self.project,
                scope: &scope,
            },
        )
    }

    /// Resolve templates in a JSON value, preserving types for lone
    /// placeholders.
    pub async fn render_json(&self, value: &Value) -> Value {
        let scope = self.snapshot().await;
        template::resolve_value(
            value,
            &TemplateContext {
                event: &self.event.payload,
                project: &self.project,
                scope: &scope,
            },
        )
    }

    /// Append a log entry; storage failures are logged and swallowed so
    /// tracing never aborts a step.
    pub async fn log(&self, node_id: &str, node_type: NodeType, level: &str, message: String) {
        let entry = LogEntry {
            execution_id: self.execution.id.clone(),
            step: self.execution.step_count,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            level: level.to_string(),
            message,
            data: None,
            at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry).await {
            debug!(execution_id = %self.execution.id, error = %e, "Failed to append log entry");
        }
    }
}

/// Shared collaborators the context manager wires into every context.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn ExecutionStore>,
    pub vars: Arc<dyn VariableStore>,
    pub messenger: Arc<dyn Messenger>,
    pub gateway: Arc<dyn DataGateway>,
    pub scheduler: Arc<DelayScheduler>,
}

/// Creates and resumes persisted execution records and builds per-step
/// contexts.
pub struct ContextManager {
    deps: EngineDeps,
}

impl ContextManager {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Create a fresh execution for a triggering event.
    pub async fn create(
        &self,
        version: &WorkflowVersion,
        event: InboundEvent,
    ) -> Result<StepContext> {
        if version.nodes.is_empty() {
            bail!(
                "workflow '{}' has no nodes; refusing to start execution",
                version.workflow_id
            );
        }

        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            project_id: event.project_id.clone(),
            workflow_id: version.workflow_id.clone(),
            version: version.version,
            chat_id: event.chat_id.clone(),
            session_id: event.session_id(),
            user_id: event.user_id.clone(),
            status: ExecutionStatus::Running,
            current_node_id: None,
            wait: None,
            step_count: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };

        self.deps.store.insert(&execution).await?;
        info!(
            execution_id = %execution.id,
            workflow = %execution.workflow_id,
            chat = %execution.chat_id,
            "Created execution"
        );

        let ctx = self.build(execution, event, version);

        // Seed variable defaults into session scope without clobbering
        // values a previous conversation already set.
        let session_key = ctx.scope_key(VarScope::Session);
        for (name, value) in &version.variable_defaults {
            if !ctx.vars.has(&session_key, name).await {
                ctx.vars
                    .set(&session_key, name, value.clone(), None)
                    .await?;
            }
        }

        Ok(ctx)
    }

    /// Re-hydrate a context for a persisted waiting execution. The new
    /// event's data is merged in; step-count history is preserved.
    pub async fn resume(
        &self,
        mut execution: Execution,
        event: InboundEvent,
        version: &WorkflowVersion,
    ) -> Result<StepContext> {
        execution.status = ExecutionStatus::Running;
        execution.wait = None;
        execution.error = None;
        if execution.user_id.is_none() {
            execution.user_id = event.user_id.clone();
        }
        self.deps.store.update(&execution).await?;

        info!(
            execution_id = %execution.id,
            node = ?execution.current_node_id,
            step = execution.step_count,
            "Resuming execution"
        );

        Ok(self.build(execution, event, version))
    }

    /// Terminal write for an execution.
    pub async fn complete(
        &self,
        execution: &mut Execution,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        execution.status = status;
        execution.error = error;
        execution.finished_at = Some(Utc::now());
        self.deps.store.update(execution).await?;
        info!(
            execution_id = %execution.id,
            status = %status,
            steps = execution.step_count,
            "Execution finished"
        );
        Ok(())
    }

    fn build(
        &self,
        execution: Execution,
        event: InboundEvent,
        version: &WorkflowVersion,
    ) -> StepContext {
        let project = serde_json::json!({
            "id": execution.project_id,
            "workflow_id": execution.workflow_id,
            "version": execution.version,
        });

        StepContext {
            execution,
            event,
            project,
            vars: self.deps.vars.clone(),
            messenger: self.deps.messenger.clone(),
            gateway: self.deps.gateway.clone(),
            scheduler: self.deps.scheduler.clone(),
            store: self.deps.store.clone(),
            max_steps: version.settings.max_steps,
            visit_ceiling: version.settings.visit_ceiling,
            depth: 0,
            sent_messages: 0,
        }
    }
}

/// Match an inbound event to the entry node of a version.
///
/// Priority: shared contact > button callback by data > command by text
/// > free-text pattern > the graph-declared entry node.
pub fn select_entry(version: &WorkflowVersion, event: &InboundEvent) -> Option<NodeId> {
    if event.contact.is_some()
        && let Some(node) = trigger_of(version, NodeType::TriggerContact, |_| true)
    {
        return Some(node);
    }

    if let Some(data) = &event.callback_data
        && let Some(node) = trigger_of(version, NodeType::TriggerCallback, |cfg| {
            match cfg.get("data").and_then(|v| v.as_str()) {
                Some(expected) => expected == data,
                None => true, // catch-all callback trigger
            }
        })
    {
        return Some(node);
    }

    if let Some(command) = event.command()
        && let Some(node) = trigger_of(version, NodeType::TriggerCommand, |cfg| {
            cfg.get("command")
                .and_then(|v| v.as_str())
                .map(|c| c.eq_ignore_ascii_case(command))
                .unwrap_or(false)
        })
    {
        return Some(node);
    }

    if matches!(event.kind, EventKind::Text | EventKind::Command)
        && let Some(text) = &event.text
        && let Some(node) = trigger_of(version, NodeType::TriggerMessage, |cfg| {
            match cfg.get("pattern").and_then(|v| v.as_str()) {
                Some(pattern) => text.to_lowercase().contains(&pattern.to_lowercase()),
                None => true, // catch-all text trigger
            }
        })
    {
        return Some(node);
    }

    version.entry_node_id.clone()
}

fn trigger_of(
    version: &WorkflowVersion,
    node_type: NodeType,
    matches: impl Fn(&Value) -> bool,
) -> Option<NodeId> {
    version
        .triggers()
        .filter(|n| n.node_type == node_type)
        .find(|n| matches(&n.config))
        .map(|n| n.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version_with_triggers() -> WorkflowVersion {
        serde_json::from_value(json!({
            "id": "v1",
            "workflowId": "wf",
            "version": 1,
            "entryNodeId": "fallback",
            "nodes": {
                "fallback": { "id": "fallback", "type": "message", "config": { "text": "hi" } },
                "t_cmd": { "id": "t_cmd", "type": "trigger.command", "config": { "command": "/start" } },
                "t_cb": { "id": "t_cb", "type": "trigger.callback", "config": { "data": "buy" } },
                "t_contact": { "id": "t_contact", "type": "trigger.contact" },
                "t_text": { "id": "t_text", "type": "trigger.message", "config": { "pattern": "help" } }
            }
        }))
        .unwrap()
    }

    fn event(kind: EventKind) -> InboundEvent {
        InboundEvent {
            project_id: "p".into(),
            chat_id: "c".into(),
            user_id: None,
            kind,
            text: None,
            callback_data: None,
            contact: None,
            payload: Value::Null,
        }
    }

    #[test]
    fn contact_beats_everything() {
        let version = version_with_triggers();
        let mut e = event(EventKind::Contact);
        e.contact = Some(json!({ "phone": "+100" }));
        e.callback_data = Some("buy".into());
        assert_eq!(select_entry(&version, &e), Some("t_contact".to_string()));
    }

    #[test]
    fn callback_matched_by_data() {
        let version = version_with_triggers();
        let mut e = event(EventKind::Callback);
        e.callback_data = Some("buy".into());
        assert_eq!(select_entry(&version, &e), Some("t_cb".to_string()));

        e.callback_data = Some("other".into());
        assert_eq!(select_entry(&version, &e), Some("fallback".to_string()));
    }

    #[test]
    fn command_matched_case_insensitively() {
        let version = version_with_triggers();
        let mut e = event(EventKind::Command);
        e.text = Some("/START now".into());
        assert_eq!(select_entry(&version, &e), Some("t_cmd".to_string()));
    }

    #[test]
    fn text_pattern_then_fallback() {
        let version = version_with_triggers();
        let mut e = event(EventKind::Text);
        e.text = Some("I need HELP please".into());
        assert_eq!(select_entry(&version, &e), Some("t_text".to_string()));

        e.text = Some("something else".into());
        assert_eq!(select_entry(&version, &e), Some("fallback".to_string()));
    }
}
