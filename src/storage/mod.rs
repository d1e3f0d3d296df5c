pub mod json_store;
pub mod memory_store;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{Execution, ExecutionStatus, LogEntry, WaitKind};

/// Durable store for execution records and their append-only logs.
/// Accessed by primary key; the interpreter is the only writer for a
/// given execution (single-writer-per-execution).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a newly created execution.
    async fn insert(&self, exec: &Execution) -> Result<()>;

    /// Write the current state of an execution (once per step).
    async fn update(&self, exec: &Execution) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Execution>>;

    /// The single waiting execution for a (project, chat, wait-kind)
    /// triple, if any.
    async fn find_waiting(
        &self,
        project_id: &str,
        chat_id: &str,
        kind: WaitKind,
    ) -> Result<Option<Execution>>;

    /// List executions, newest first, optionally filtered by status.
    async fn list(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>>;

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>>;

    async fn delete(&self, id: &str) -> Result<()>;
}
