use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::RwLock;
use tracing::info;

use crate::graph::WorkflowVersion;
use crate::graph::validate::validate_version;
use crate::nodes::HandlerRegistry;

/// Holds the active workflow version per project. Exactly one version is
/// active at a time; publishing swaps the snapshot atomically.
pub struct WorkflowRepo {
    active: RwLock<HashMap<String, Arc<WorkflowVersion>>>,
}

impl Default for WorkflowRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRepo {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and activate a version for a project. Validation failures
    /// reject the publish wholesale; the previous version stays active.
    pub async fn publish(
        &self,
        project_id: &str,
        version: WorkflowVersion,
        registry: &HandlerRegistry,
    ) -> Result<()> {
        let errors = validate_version(&version, registry);
        if !errors.is_empty() {
            bail!(
                "workflow '{}' failed validation: {}",
                version.workflow_id,
                errors.join("; ")
            );
        }

        info!(
            project = %project_id,
            workflow = %version.workflow_id,
            version = version.version,
            "Publishing workflow version"
        );

        self.active
            .write()
            .await
            .insert(project_id.to_string(), Arc::new(version));
        Ok(())
    }

    pub async fn active(&self, project_id: &str) -> Option<Arc<WorkflowVersion>> {
        self.active.read().await.get(project_id).cloned()
    }

    /// Look up a version by workflow id across projects, for sub-workflow
    /// resolution.
    pub async fn by_workflow_id(&self, workflow_id: &str) -> Option<Arc<WorkflowVersion>> {
        self.active
            .read()
            .await
            .values()
            .find(|v| v.workflow_id == workflow_id)
            .cloned()
    }
}
