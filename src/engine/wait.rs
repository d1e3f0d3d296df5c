use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::engine::types::{Execution, ExecutionStatus, InboundEvent, WaitState};
use crate::storage::ExecutionStore;

/// Persists and restores waiting state.
///
/// Invariant: at most one execution is waiting per (project, chat) pair
/// for a given wait kind. A newer wait supersedes the older execution,
/// which is failed with a marker error rather than left dangling.
pub struct WaitCoordinator {
    store: Arc<dyn ExecutionStore>,
}

pub const SUPERSEDED_ERROR: &str = "superseded by newer wait";

impl WaitCoordinator {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Park an execution on a wait state. Any previously waiting
    /// execution for the same (project, chat, kind) is superseded.
    pub async fn suspend(&self, execution: &mut Execution, wait: WaitState) -> Result<()> {
        if let Some(mut stale) = self
            .store
            .find_waiting(&execution.project_id, &execution.chat_id, wait.kind)
            .await?
            && stale.id != execution.id
        {
            warn!(
                stale_id = %stale.id,
                new_id = %execution.id,
                kind = %wait.kind,
                "Superseding older waiting execution"
            );
            stale.status = ExecutionStatus::Failed;
            stale.error = Some(SUPERSEDED_ERROR.to_string());
            stale.finished_at = Some(Utc::now());
            stale.wait = None;
            self.store.update(&stale).await?;
        }

        execution.status = ExecutionStatus::Waiting;
        execution.current_node_id = Some(wait.node_id.clone());
        execution.wait = Some(wait);
        self.store.update(execution).await?;

        info!(
            execution_id = %execution.id,
            node = ?execution.current_node_id,
            "Execution suspended"
        );
        Ok(())
    }

    /// Find the waiting execution an inbound event should resume, if
    /// any. Timer events resume by execution id, not by matching, and
    /// are not handled here.
    pub async fn match_event(&self, event: &InboundEvent) -> Result<Option<Execution>> {
        let Some(kind) = event.satisfies() else {
            return Ok(None);
        };
        self.store
            .find_waiting(&event.project_id, &event.chat_id, kind)
            .await
    }
}
