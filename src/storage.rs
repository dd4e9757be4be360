//! Persistence port consumed by the task state manager.
//!
//! Every call is best effort: callers log failures and continue, the
//! in-memory state stays authoritative for a live run.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::errors::ErrorKind;
use crate::core::models::{TaskStatus, TranslateOutcome};

/// Persistence failures, logged but never escalated
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Durable task fields a scheduler must read or write
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError>;

    async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        tokens: u64,
        partial_translation: &str,
    ) -> Result<(), StoreError>;

    async fn update_completion(
        &self,
        task_id: &str,
        outcome: &TranslateOutcome,
    ) -> Result<(), StoreError>;

    async fn update_error(
        &self,
        task_id: &str,
        kind: ErrorKind,
        message: &str,
        retry_count: u32,
    ) -> Result<(), StoreError>;

    /// Task ids recorded as `sending`, i.e. interrupted by an unclean
    /// shutdown. Read only during crash recovery at startup.
    async fn interrupted_tasks(&self) -> Result<Vec<String>, StoreError>;
}

/// One persisted row
#[derive(Debug, Clone, Default)]
pub struct StoredTask {
    pub status: Option<TaskStatus>,
    pub progress: u8,
    pub tokens: u64,
    pub translation: String,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub cost: f64,
    pub duration_ms: u64,
}

/// In-memory store used by the CLI and tests
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    rows: RwLock<HashMap<String, StoredTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one row, for inspection
    pub async fn row(&self, task_id: &str) -> Option<StoredTask> {
        self.rows.read().await.get(task_id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.entry(task_id.to_string()).or_default().status = Some(status);
        Ok(())
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        tokens: u64,
        partial_translation: &str,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(task_id.to_string()).or_default();
        row.progress = progress;
        row.tokens = tokens;
        row.translation = partial_translation.to_string();
        Ok(())
    }

    async fn update_completion(
        &self,
        task_id: &str,
        outcome: &TranslateOutcome,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(task_id.to_string()).or_default();
        row.status = Some(TaskStatus::Completed);
        row.progress = 100;
        row.tokens = outcome.output_tokens;
        row.translation = outcome.translation.clone();
        row.cost = outcome.cost;
        row.duration_ms = outcome.duration_ms;
        Ok(())
    }

    async fn update_error(
        &self,
        task_id: &str,
        kind: ErrorKind,
        message: &str,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(task_id.to_string()).or_default();
        row.status = Some(if kind == ErrorKind::RateLimit {
            TaskStatus::Throttled
        } else {
            TaskStatus::Error
        });
        row.error_kind = Some(kind);
        row.error_message = Some(message.to_string());
        row.retry_count = retry_count;
        Ok(())
    }

    async fn interrupted_tasks(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|(_, row)| row.status == Some(TaskStatus::Sending))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
