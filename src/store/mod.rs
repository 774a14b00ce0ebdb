//! Task storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database with a dependency index
//!
//! Every mutation goes through a [`TaskTransaction`]. A transaction isolates
//! its writes from concurrent transactions until [`TaskTransaction::commit`];
//! [`TaskTransaction::rollback`] (or dropping the handle) discards them.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::task::{CreateTaskInput, StorageError, Task, UpdateTaskInput};

/// Storage-level observability, passed through unchanged by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetrics {
    pub total_size: u64,
    pub page_size: u64,
    pub page_count: u64,
    pub wal_size: u64,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// An open atomic unit of work.
#[async_trait]
pub trait TaskTransaction: Send {
    /// Read a task as seen by this transaction (including its own writes).
    async fn get_task(&mut self, path: &str) -> Result<Option<Task>, StorageError>;

    /// Tasks whose parent is `parent_path`.
    async fn get_children(&mut self, parent_path: &str) -> Result<Vec<Task>, StorageError>;

    /// Tasks that list `path` among their dependencies.
    async fn get_dependents(&mut self, path: &str) -> Result<Vec<Task>, StorageError>;

    /// Apply a partial update and return the resulting task.
    ///
    /// Fails with [`StorageError::NotFound`] if `path` is unknown.
    async fn update_task(
        &mut self,
        path: &str,
        updates: &UpdateTaskInput,
    ) -> Result<Task, StorageError>;

    /// Paths written so far in this transaction, in first-write order.
    fn touched_paths(&self) -> Vec<String>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Open an atomic unit. Conflicting transactions are serialized.
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StorageError>;

    /// Get a single task by path.
    async fn get_task(&self, path: &str) -> Result<Option<Task>, StorageError>;

    /// Get the tasks whose parent is `parent_path`.
    async fn get_children(&self, parent_path: &str) -> Result<Vec<Task>, StorageError>;

    /// List every task, ordered by path.
    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Create a new `Pending` task. Dependencies must already exist.
    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, StorageError>;

    async fn get_metrics(&self) -> Result<StorageMetrics, StorageError>;

    /// Release backend resources. Later calls fail with [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Apply a single partial update in its own transaction.
    async fn update_task(
        &self,
        path: &str,
        updates: &UpdateTaskInput,
    ) -> Result<Task, StorageError> {
        let mut tx = self.begin().await?;
        match tx.update_task(path, updates).await {
            Ok(task) => {
                tx.commit().await?;
                Ok(task)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback after failed update of {} failed: {}", path, rollback_err);
                }
                Err(e)
            }
        }
    }
}

pub type SharedTaskStore = Arc<dyn TaskStore>;

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    #[default]
    Sqlite,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: TaskStoreType,
    data_dir: PathBuf,
) -> Result<SharedTaskStore, StorageError> {
    match store_type {
        TaskStoreType::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        TaskStoreType::Sqlite => {
            let store = SqliteTaskStore::new(data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Reject dependencies that name the task itself or a missing task.
pub(crate) fn check_new_task(
    input: &CreateTaskInput,
    exists: impl Fn(&str) -> bool,
) -> Result<(), StorageError> {
    if exists(&input.path) {
        return Err(StorageError::AlreadyExists(input.path.clone()));
    }
    for dep in &input.dependencies {
        if dep == &input.path {
            return Err(StorageError::Backend(format!(
                "Task {} cannot depend on itself",
                input.path
            )));
        }
        if !exists(dep) {
            return Err(StorageError::NotFound(dep.clone()));
        }
    }
    Ok(())
}
