use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::types::{Execution, ExecutionStatus, LogEntry, WaitKind};
use crate::storage::ExecutionStore;

#[derive(Serialize, Deserialize)]
struct ExecutionFile {
    execution: Execution,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

/// File-based JSON execution store. Each execution is one JSON file
/// (record plus its log trail), written via tmp-file-and-rename so a
/// crash mid-write never corrupts a record.
pub struct JsonExecutionStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonExecutionStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    async fn read_file(&self, id: &str) -> Result<ExecutionFile> {
        let path = self.path(id);
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read execution file: {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse execution record: {}", id))
    }

    async fn write_file(&self, id: &str, file: &ExecutionFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.path(id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(file)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<ExecutionFile>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(file) = serde_json::from_str::<ExecutionFile>(&data)
            {
                files.push(file);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ExecutionStore for JsonExecutionStore {
    async fn insert(&self, exec: &Execution) -> Result<()> {
        let _lock = self.lock.write().await;
        self.write_file(
            &exec.id,
            &ExecutionFile {
                execution: exec.clone(),
                logs: Vec::new(),
            },
        )
        .await
    }

    async fn update(&self, exec: &Execution) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut file = self.read_file(&exec.id).await.unwrap_or(ExecutionFile {
            execution: exec.clone(),
            logs: Vec::new(),
        });
        file.execution = exec.clone();
        self.write_file(&exec.id, &file).await
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>> {
        let _lock = self.lock.read().await;
        if !self.path(id).exists() {
            return Ok(None);
        }
        Ok(Some(self.read_file(id).await?.execution))
    }

    async fn find_waiting(
        &self,
        project_id: &str,
        chat_id: &str,
        kind: WaitKind,
    ) -> Result<Option<Execution>> {
        let _lock = self.lock.read().await;
        let files = self.scan().await?;
        Ok(files
            .into_iter()
            .map(|f| f.execution)
            .find(|e| {
                e.status == ExecutionStatus::Waiting
                    && e.project_id == project_id
                    && e.chat_id == chat_id
                    && e.wait.as_ref().map(|w| w.kind) == Some(kind)
            }))
    }

    async fn list(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        let _lock = self.lock.read().await;
        let files = self.scan().await?;
        let mut result: Vec<Execution> = files
            .into_iter()
            .map(|f| f.execution)
            .filter(|e| status.is_none() || status == Some(e.status))
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut file = self.read_file(&entry.execution_id).await?;
        file.logs.push(entry.clone());
        self.write_file(&entry.execution_id, &file).await
    }

    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        let _lock = self.lock.read().await;
        Ok(self.read_file(execution_id).await?.logs)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
