//! Task manager: the single entry point used by tools and the HTTP API.
//!
//! Reads go through the cache, creations go straight to the store, and every
//! update runs as one atomic unit via [`TaskTransactionManager`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::cache::TaskCache;
use crate::events::{DatabaseEvent, EventBus, WriteOperation};
use crate::operations::{StatusOperations, UpdateSink};
use crate::store::{SharedTaskStore, StorageMetrics};
use crate::task::{
    validate_create_input, validate_update_input, CreateTaskInput, StorageError, Task, TaskError,
    UpdateTaskInput,
};
use crate::transaction::TaskTransactionManager;

/// Cache and event sink backing the standard operations.
pub struct TaskEventSink {
    cache: Arc<TaskCache>,
    events: Arc<EventBus>,
}

impl TaskEventSink {
    pub fn new(cache: Arc<TaskCache>, events: Arc<EventBus>) -> Self {
        Self { cache, events }
    }
}

#[async_trait]
impl UpdateSink for TaskEventSink {
    fn update_cache(&self, task: &Task) {
        self.cache.insert(task);
    }

    fn invalidate(&self, path: &str) {
        self.cache.invalidate(path);
    }

    async fn emit_events(&self, task: &Task) {
        let transaction_id = self.events.publish_write(WriteOperation {
            description: "update_task".to_string(),
            path: task.path.clone(),
            status: Some(task.status.as_str().to_string()),
        });
        tracing::debug!("Transaction {} committed for {}", transaction_id, task.path);
    }

    fn emit_error(&self, operation: &str, error: &TaskError, target: &str) {
        self.events.publish_error(operation, error, target);
    }
}

pub struct TaskManager {
    store: SharedTaskStore,
    cache: Arc<TaskCache>,
    events: Arc<EventBus>,
    transactions: TaskTransactionManager,
    operations: StatusOperations,
}

impl TaskManager {
    pub fn new(store: SharedTaskStore, events: Arc<EventBus>) -> Self {
        let cache = Arc::new(TaskCache::new());
        let sink = Arc::new(TaskEventSink::new(Arc::clone(&cache), Arc::clone(&events)));
        Self {
            transactions: TaskTransactionManager::new(Arc::clone(&store)),
            operations: StatusOperations::standard(sink),
            store,
            cache,
            events,
        }
    }

    /// Replace the strategy set used for updates.
    pub fn with_operations(mut self, operations: StatusOperations) -> Self {
        self.operations = operations;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn get_task(&self, path: &str) -> Result<Option<Task>, TaskError> {
        if let Some(task) = self.cache.get(path) {
            return Ok(Some(task));
        }
        let generation = self.cache.generation();
        match self.store.get_task(path).await {
            Ok(task) => {
                self.events.publish_read(format!("get_task {}", path));
                if let Some(task) = &task {
                    if !self.cache.fill(task, generation) {
                        tracing::debug!("Skipped cache fill for {}: written during read", path);
                    }
                }
                Ok(task)
            }
            Err(e) => {
                self.events.publish_error("TaskManager.getTask", &e, path);
                Err(e.into())
            }
        }
    }

    pub async fn get_children(&self, parent_path: &str) -> Result<Vec<Task>, TaskError> {
        let children = self.store.get_children(parent_path).await?;
        self.events.publish_read(format!("get_children {}", parent_path));
        Ok(children)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, TaskError> {
        let tasks = self.store.list_tasks().await?;
        self.events.publish_read("list_tasks");
        Ok(tasks)
    }

    pub async fn create_task(&self, input: CreateTaskInput) -> Result<Task, TaskError> {
        validate_create_input(&input)?;
        let path = input.path.clone();
        let task = self.store.create_task(input).await.map_err(|e| {
            self.events.publish_error("TaskManager.createTask", &e, &path);
            match e {
                StorageError::NotFound(missing) => TaskError::not_found(missing),
                other => TaskError::Storage(other),
            }
        })?;

        self.cache.insert(&task);
        let transaction_id = self.events.publish_write(WriteOperation {
            description: "create_task".to_string(),
            path: task.path.clone(),
            status: Some(task.status.as_str().to_string()),
        });
        tracing::info!("Created task {} (transaction {})", task.path, transaction_id);
        Ok(task)
    }

    /// Validate `updates` and apply them atomically with their cascades.
    pub async fn update_task(
        &self,
        path: &str,
        updates: UpdateTaskInput,
    ) -> Result<Task, TaskError> {
        validate_update_input(&updates)?;
        let task = self
            .get_task(path)
            .await?
            .ok_or_else(|| TaskError::not_found(path))?;
        self.transactions
            .execute_update(&task, updates, &self.operations)
            .await
    }

    pub async fn get_metrics(&self) -> Result<StorageMetrics, TaskError> {
        self.transactions.get_metrics().await
    }

    pub async fn close(&self) -> Result<(), TaskError> {
        self.store.close().await?;
        tracing::info!("Task store closed");
        Ok(())
    }
}
