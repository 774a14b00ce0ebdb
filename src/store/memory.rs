//! In-memory task store (non-persistent).
//!
//! A transaction holds the write guard of the task map for its whole
//! lifetime, so transactions are fully serialized. Each first write to a path
//! records the prior value; rollback restores those values.

use super::{check_new_task, now_string, StorageMetrics, TaskStore, TaskTransaction};
use crate::task::{CreateTaskInput, StorageError, Task, UpdateTaskInput};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

type TaskMap = BTreeMap<String, Task>;

#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<TaskMap>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn children_of(tasks: &TaskMap, parent_path: &str) -> Vec<Task> {
    tasks
        .values()
        .filter(|t| t.parent_path.as_deref() == Some(parent_path))
        .cloned()
        .collect()
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StorageError> {
        self.ensure_open()?;
        let guard = Arc::clone(&self.tasks).write_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard: Some(guard),
            undo: Vec::new(),
        }))
    }

    async fn get_task(&self, path: &str) -> Result<Option<Task>, StorageError> {
        self.ensure_open()?;
        Ok(self.tasks.read().await.get(path).cloned())
    }

    async fn get_children(&self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
        self.ensure_open()?;
        Ok(children_of(&*self.tasks.read().await, parent_path))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.ensure_open()?;
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, StorageError> {
        self.ensure_open()?;
        let mut tasks = self.tasks.write().await;
        check_new_task(&input, |path| tasks.contains_key(path))?;
        let task = Task::from_input(input, &now_string());
        tasks.insert(task.path.clone(), task.clone());
        Ok(task)
    }

    async fn get_metrics(&self) -> Result<StorageMetrics, StorageError> {
        self.ensure_open()?;
        let tasks = self.tasks.read().await;
        let mut total_size = 0u64;
        for task in tasks.values() {
            total_size += serde_json::to_vec(task)?.len() as u64;
        }
        Ok(StorageMetrics {
            total_size,
            ..Default::default()
        })
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct InMemoryTransaction {
    guard: Option<OwnedRwLockWriteGuard<TaskMap>>,
    /// Prior value of every path written, in first-write order.
    undo: Vec<(String, Task)>,
}

impl InMemoryTransaction {
    fn tasks(&mut self) -> Result<&mut TaskMap, StorageError> {
        self.guard.as_deref_mut().ok_or(StorageError::Closed)
    }

    fn restore(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        if let Some(tasks) = self.guard.as_deref_mut() {
            for (path, original) in undo.into_iter().rev() {
                tasks.insert(path, original);
            }
        }
    }
}

#[async_trait]
impl TaskTransaction for InMemoryTransaction {
    async fn get_task(&mut self, path: &str) -> Result<Option<Task>, StorageError> {
        Ok(self.tasks()?.get(path).cloned())
    }

    async fn get_children(&mut self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
        Ok(children_of(self.tasks()?, parent_path))
    }

    async fn get_dependents(&mut self, path: &str) -> Result<Vec<Task>, StorageError> {
        Ok(self
            .tasks()?
            .values()
            .filter(|t| t.dependencies.iter().any(|dep| dep == path))
            .cloned()
            .collect())
    }

    async fn update_task(
        &mut self,
        path: &str,
        updates: &UpdateTaskInput,
    ) -> Result<Task, StorageError> {
        let tasks = self.guard.as_deref_mut().ok_or(StorageError::Closed)?;
        let task = tasks
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        if !self.undo.iter().any(|(p, _)| p == path) {
            self.undo.push((path.to_string(), task.clone()));
        }
        task.apply(updates, &now_string());
        Ok(task.clone())
    }

    fn touched_paths(&self) -> Vec<String> {
        self.undo.iter().map(|(path, _)| path.clone()).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut this = self;
        this.undo.clear();
        this.guard.take();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        let mut this = self;
        this.restore();
        this.guard.take();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.guard.is_some() && !self.undo.is_empty() {
            tracing::debug!("Rolling back dropped in-memory transaction");
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_transactions_are_serialized() {
        let store = InMemoryTaskStore::new();
        store
            .create_task(CreateTaskInput::new("a", "A"))
            .await
            .expect("create");

        let mut tx = store.begin().await.expect("begin");
        tx.update_task("a", &UpdateTaskInput::status(TaskStatus::InProgress))
            .await
            .expect("update");

        // A second transaction cannot start while the first is open.
        let second = tokio::time::timeout(Duration::from_millis(50), store.begin()).await;
        assert!(second.is_err(), "second begin should wait for the first");

        tx.commit().await.expect("commit");
        let mut tx = store.begin().await.expect("begin after commit");
        let a = tx.get_task("a").await.unwrap().unwrap();
        assert_eq!(a.status, TaskStatus::InProgress);
        tx.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn test_rollback_restores_first_value_after_repeated_writes() {
        let store = InMemoryTaskStore::new();
        store
            .create_task(CreateTaskInput::new("a", "A"))
            .await
            .expect("create");

        let mut tx = store.begin().await.expect("begin");
        tx.update_task("a", &UpdateTaskInput::status(TaskStatus::InProgress))
            .await
            .unwrap();
        tx.update_task("a", &UpdateTaskInput::status(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(tx.touched_paths(), vec!["a".to_string()]);
        tx.rollback().await.unwrap();

        let a = store.get_task("a").await.unwrap().unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = InMemoryTaskStore::new();
        store.close().await.unwrap();
        assert!(matches!(store.begin().await, Err(StorageError::Closed)));
        assert!(matches!(store.get_task("a").await, Err(StorageError::Closed)));
    }
}
