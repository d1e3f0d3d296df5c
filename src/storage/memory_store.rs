use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::types::{Execution, ExecutionStatus, LogEntry, WaitKind};
use crate::storage::ExecutionStore;

/// In-memory execution store, used for tests and sub-workflow runs.
/// State lives only as long as the store instance.
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<String, Execution>>,
    logs: RwLock<HashMap<String, Vec<LogEntry>>>,
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, exec: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(exec.id.clone(), exec.clone());
        Ok(())
    }

    async fn update(&self, exec: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(exec.id.clone(), exec.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn find_waiting(
        &self,
        project_id: &str,
        chat_id: &str,
        kind: WaitKind,
    ) -> Result<Option<Execution>> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .find(|e| {
                e.status == ExecutionStatus::Waiting
                    && e.project_id == project_id
                    && e.chat_id == chat_id
                    && e.wait.as_ref().map(|w| w.kind) == Some(kind)
            })
            .cloned())
    }

    async fn list(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        let executions = self.executions.read().await;
        let mut result: Vec<Execution> = executions
            .values()
            .filter(|e| status.is_none() || status == Some(e.status))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.logs
            .write()
            .await
            .entry(entry.execution_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.executions.write().await.remove(id);
        self.logs.write().await.remove(id);
        Ok(())
    }
}
