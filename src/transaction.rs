//! Atomic status updates.
//!
//! [`TaskTransactionManager::execute_update`] runs the whole cascade of one
//! status change inside a single store transaction:
//!
//! ```text
//!   begin
//!     re-read task ─▶ validate ─▶ dependencies ─▶ propagate to dependents
//!       ─▶ transition override ─▶ parent aggregation
//!       ─▶ write task ─▶ write parent
//!   commit ─▶ cache ─▶ write event
//! ```
//!
//! # Invariants
//!
//! - Either every write of the unit is visible afterwards or none is.
//! - Cache entries and write events only ever describe committed state.
//! - A failed unit surfaces as [`TaskError::Transaction`] with the cause
//!   attached; the store is left as it was before `begin`.

use crate::operations::StatusOperations;
use crate::store::{SharedTaskStore, StorageMetrics, TaskTransaction};
use crate::task::{Task, TaskError, TaskStatus, UpdateTaskInput};

const EXECUTE_UPDATE: &str = "TaskTransactionManager.executeUpdate";
const EXECUTE_TASK_UPDATE: &str = "TaskTransactionManager.executeTaskUpdate";
const GET_METRICS: &str = "TaskTransactionManager.getMetrics";

/// Result of a unit that is ready to commit.
struct AppliedUpdate {
    task: Task,
    parent: Option<Task>,
    touched: Vec<String>,
}

pub struct TaskTransactionManager {
    store: SharedTaskStore,
}

impl TaskTransactionManager {
    pub fn new(store: SharedTaskStore) -> Self {
        Self { store }
    }

    /// Apply `updates` to `task` and everything the change cascades to.
    ///
    /// `task` identifies the target; its state is re-read inside the
    /// transaction so decisions never rest on a stale snapshot.
    pub async fn execute_update(
        &self,
        task: &Task,
        updates: UpdateTaskInput,
        ops: &StatusOperations,
    ) -> Result<Task, TaskError> {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                let err = TaskError::Storage(e);
                tracing::error!("Failed to begin transaction for {}: {}", task.path, err);
                ops.sink.emit_error(EXECUTE_UPDATE, &err, &task.path);
                return Err(err);
            }
        };

        let applied = match apply_in_transaction(tx.as_mut(), task, updates, ops).await {
            Ok(applied) => applied,
            Err(err) => {
                tracing::error!("Failed to execute task update transaction for {}: {}", task.path, err);
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback for {} failed: {}", task.path, rollback_err);
                }
                ops.sink.emit_error(EXECUTE_UPDATE, &err, &task.path);
                return Err(TaskError::transaction(&task.path, EXECUTE_UPDATE, err));
            }
        };

        if let Err(e) = tx.commit().await {
            let err = TaskError::Storage(e);
            tracing::error!("Failed to commit update of {}: {}", task.path, err);
            ops.sink.emit_error(EXECUTE_UPDATE, &err, &task.path);
            return Err(TaskError::transaction(&task.path, EXECUTE_UPDATE, err));
        }

        let parent_path = applied.parent.as_ref().map(|p| p.path.as_str());
        for path in &applied.touched {
            if path != &applied.task.path && Some(path.as_str()) != parent_path {
                ops.sink.invalidate(path);
            }
        }
        ops.sink.update_cache(&applied.task);
        if let Some(parent) = &applied.parent {
            tracing::info!("Parent {} moved to {}", parent.path, parent.status);
            ops.sink.update_cache(parent);
        }
        ops.sink.emit_events(&applied.task).await;

        Ok(applied.task)
    }

    pub async fn get_metrics(&self) -> Result<StorageMetrics, TaskError> {
        self.store.get_metrics().await.map_err(|e| {
            tracing::error!("{} failed: {}", GET_METRICS, e);
            TaskError::Storage(e)
        })
    }
}

async fn apply_in_transaction(
    tx: &mut dyn TaskTransaction,
    target: &Task,
    mut updates: UpdateTaskInput,
    ops: &StatusOperations,
) -> Result<AppliedUpdate, TaskError> {
    let task = tx
        .get_task(&target.path)
        .await?
        .ok_or_else(|| TaskError::not_found(&target.path))?;

    ops.validator.validate_update(&task, &updates, tx).await?;

    if updates.dependencies.is_some() {
        if let Some(handler) = &ops.dependencies {
            handler.handle_dependency_updates(&task, &mut updates, tx).await?;
        }
    }

    let mut parent_update = None;
    if let Some(requested) = updates.status.filter(|s| *s != task.status) {
        if let Some(propagator) = &ops.propagation {
            propagator.handle_status_propagation(&task, &updates, tx).await?;
        }

        if let Some(validator) = &ops.transition {
            let result = validator.validate_status_transition(&task, &updates, tx).await?;
            if result.auto_transition {
                tracing::info!(
                    "Requested {} for {} overridden to {} (blocked by {:?})",
                    requested,
                    task.path,
                    result.status,
                    result.blocked_by
                );
            }
            updates.status = Some(result.status);
            if result.status == TaskStatus::Blocked {
                if !result.blocked_by.is_empty() {
                    updates.status_metadata_mut().blocked_by = Some(result.blocked_by);
                }
            } else if !task.status_metadata.blocked_by().is_empty() {
                updates.status_metadata_mut().blocked_by = Some(Vec::new());
            }
        }

        if let Some(validator) = &ops.parent_child {
            let effective = updates.status.unwrap_or(requested);
            parent_update = validator
                .validate_parent_child_status(&task, effective, tx)
                .await?;
        }
    }

    let updated = execute_task_update(tx, &task.path, updates).await?;
    let parent = match parent_update {
        Some(cascade) => Some(
            execute_task_update(tx, &cascade.path, cascade.to_update()).await?,
        ),
        None => None,
    };

    Ok(AppliedUpdate {
        task: updated,
        parent,
        touched: tx.touched_paths(),
    })
}

/// Single write inside the unit; failures keep the path and payload.
async fn execute_task_update(
    tx: &mut dyn TaskTransaction,
    path: &str,
    updates: UpdateTaskInput,
) -> Result<Task, TaskError> {
    match tx.update_task(path, &updates).await {
        Ok(task) => Ok(task),
        Err(source) => Err(TaskError::TaskOperation {
            operation: EXECUTE_TASK_UPDATE,
            path: path.to_string(),
            updates: Box::new(updates),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaskCache;
    use crate::events::{DatabaseEvent, EventBus};
    use crate::manager::TaskEventSink;
    use crate::store::{InMemoryTaskStore, TaskStore};
    use crate::task::{CreateTaskInput, StorageError};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Store wrapper whose transactions fail writes to one path.
    struct FailingStore {
        inner: InMemoryTaskStore,
        fail_path: String,
    }

    struct FailingTransaction {
        inner: Box<dyn TaskTransaction>,
        fail_path: String,
    }

    #[async_trait]
    impl TaskTransaction for FailingTransaction {
        async fn get_task(&mut self, path: &str) -> Result<Option<Task>, StorageError> {
            self.inner.get_task(path).await
        }

        async fn get_children(&mut self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
            self.inner.get_children(parent_path).await
        }

        async fn get_dependents(&mut self, path: &str) -> Result<Vec<Task>, StorageError> {
            self.inner.get_dependents(path).await
        }

        async fn update_task(
            &mut self,
            path: &str,
            updates: &UpdateTaskInput,
        ) -> Result<Task, StorageError> {
            if path == self.fail_path {
                return Err(StorageError::Backend("disk full".to_string()));
            }
            self.inner.update_task(path, updates).await
        }

        fn touched_paths(&self) -> Vec<String> {
            self.inner.touched_paths()
        }

        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl TaskStore for FailingStore {
        fn is_persistent(&self) -> bool {
            false
        }

        async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StorageError> {
            Ok(Box::new(FailingTransaction {
                inner: self.inner.begin().await?,
                fail_path: self.fail_path.clone(),
            }))
        }

        async fn get_task(&self, path: &str) -> Result<Option<Task>, StorageError> {
            self.inner.get_task(path).await
        }

        async fn get_children(&self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
            self.inner.get_children(parent_path).await
        }

        async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
            self.inner.list_tasks().await
        }

        async fn create_task(&self, input: CreateTaskInput) -> Result<Task, StorageError> {
            self.inner.create_task(input).await
        }

        async fn get_metrics(&self) -> Result<StorageMetrics, StorageError> {
            self.inner.get_metrics().await
        }
    }

    struct Harness {
        store: InMemoryTaskStore,
        cache: Arc<TaskCache>,
        events: Arc<EventBus>,
        ops: StatusOperations,
    }

    impl Harness {
        fn new() -> Self {
            let cache = Arc::new(TaskCache::new());
            let events = Arc::new(EventBus::new(64));
            let sink = Arc::new(TaskEventSink::new(Arc::clone(&cache), Arc::clone(&events)));
            Self {
                store: InMemoryTaskStore::new(),
                cache,
                events,
                ops: StatusOperations::standard(sink),
            }
        }

        fn manager(&self) -> TaskTransactionManager {
            TaskTransactionManager::new(Arc::new(self.store.clone()))
        }

        async fn seed(&self, path: &str, deps: &[&str], status: TaskStatus) -> Task {
            self.store
                .create_task(CreateTaskInput::new(path, path).with_dependencies(deps.iter().copied()))
                .await
                .expect("create");
            self.store
                .update_task(path, &UpdateTaskInput::status(status))
                .await
                .expect("seed status")
        }

        async fn status(&self, path: &str) -> TaskStatus {
            self.store.get_task(path).await.unwrap().unwrap().status
        }

        async fn task(&self, path: &str) -> Task {
            self.store.get_task(path).await.unwrap().unwrap()
        }

        /// Blocked tasks carry a justification; completed tasks only depend
        /// on completed tasks.
        async fn assert_consistent(&self) {
            let tasks = self.store.list_tasks().await.unwrap();
            for task in &tasks {
                if task.status == TaskStatus::Blocked {
                    assert!(
                        !task.status_metadata.blocked_by().is_empty()
                            || task.status_metadata.blocked_reason.is_some(),
                        "{} is blocked without blockedBy or blockedReason",
                        task.path
                    );
                }
                if task.status == TaskStatus::Completed {
                    for dep in &task.dependencies {
                        let dep = tasks.iter().find(|t| &t.path == dep).unwrap();
                        assert_eq!(
                            dep.status,
                            TaskStatus::Completed,
                            "{} is completed but {} is not",
                            task.path,
                            dep.path
                        );
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_auto_transition_to_blocked() {
        let h = Harness::new();
        h.seed("proj", &[], TaskStatus::InProgress).await;
        h.seed("proj/db", &[], TaskStatus::Pending).await;
        h.seed("proj/other", &[], TaskStatus::InProgress).await;
        let api = h.seed("proj/api", &["proj/db"], TaskStatus::Pending).await;
        let mut rx = h.events.subscribe();
        let before = h.events.current_transaction_id();

        let updated = h
            .manager()
            .execute_update(&api, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .expect("update");

        assert_eq!(updated.status, TaskStatus::Blocked);
        assert_eq!(updated.status_metadata.blocked_by().to_vec(), vec!["proj/db".to_string()]);
        assert_eq!(h.status("proj").await, TaskStatus::InProgress);
        assert_eq!(h.cache.get("proj/api").unwrap().status, TaskStatus::Blocked);

        match rx.recv().await.expect("event") {
            DatabaseEvent::WriteOperation { transaction_id, operation, .. } => {
                assert_eq!(transaction_id, before + 1);
                assert_eq!(operation.path, "proj/api");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "exactly one write event");
    }

    #[tokio::test]
    async fn test_last_blocked_child_completes_parent() {
        let h = Harness::new();
        h.seed("p", &[], TaskStatus::Blocked).await;
        h.seed("p/a", &[], TaskStatus::Completed).await;
        h.seed("p/b", &[], TaskStatus::Completed).await;
        let c = h.seed("p/c", &[], TaskStatus::Blocked).await;

        h.manager()
            .execute_update(&c, UpdateTaskInput::status(TaskStatus::Completed), &h.ops)
            .await
            .expect("update");

        assert_eq!(h.status("p/c").await, TaskStatus::Completed);
        assert_eq!(h.status("p").await, TaskStatus::Completed);
        assert_eq!(h.cache.get("p").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_parent_write_rolls_back_child() {
        let h = Harness::new();
        h.seed("p", &[], TaskStatus::Pending).await;
        let a = h.seed("p/a", &[], TaskStatus::Pending).await;
        let store = FailingStore {
            inner: h.store.clone(),
            fail_path: "p".to_string(),
        };
        let manager = TaskTransactionManager::new(Arc::new(store));
        let mut rx = h.events.subscribe();
        let before = h.events.current_transaction_id();

        let err = manager
            .execute_update(&a, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .unwrap_err();

        match &err {
            TaskError::Transaction { path, source, .. } => {
                assert_eq!(path, "p/a");
                assert!(matches!(
                    source.as_ref(),
                    TaskError::TaskOperation { path, .. } if path == "p"
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(h.status("p/a").await, TaskStatus::Pending);
        assert_eq!(h.status("p").await, TaskStatus::Pending);
        assert!(h.cache.get("p/a").is_none());
        assert_eq!(h.events.current_transaction_id(), before);
        assert!(matches!(rx.recv().await.unwrap(), DatabaseEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_idempotent_update_writes_once() {
        let h = Harness::new();
        let parent = h.seed("p", &[], TaskStatus::InProgress).await;
        let a = h.seed("p/a", &[], TaskStatus::InProgress).await;
        let manager = h.manager();
        let mut rx = h.events.subscribe();
        let before = h.events.current_transaction_id();

        let first = manager
            .execute_update(&a, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .unwrap();
        let second = manager
            .execute_update(&first, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .unwrap();

        let mut expected = a.clone();
        expected.updated_at = first.updated_at.clone();
        assert_eq!(first, expected);
        expected.updated_at = second.updated_at.clone();
        assert_eq!(second, expected);

        // No parent cascade write.
        assert_eq!(h.task("p").await, parent);
        assert!(h.cache.get("p").is_none());

        let mut ids = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DatabaseEvent::WriteOperation { transaction_id, operation, .. } = event {
                assert_eq!(operation.path, "p/a");
                ids.push(transaction_id);
            }
        }
        assert_eq!(ids, vec![before + 1, before + 2]);
    }

    #[tokio::test]
    async fn test_cascaded_blocked_parent_keeps_justification() {
        let h = Harness::new();
        h.seed("p", &[], TaskStatus::Pending).await;
        let a = h.seed("p/a", &[], TaskStatus::Pending).await;
        let b = h.seed("p/b", &[], TaskStatus::Pending).await;
        let manager = h.manager();

        let mut block = UpdateTaskInput::status(TaskStatus::Blocked);
        block.status_metadata_mut().blocked_reason = Some("waiting on vendor".to_string());
        let a = manager.execute_update(&a, block, &h.ops).await.unwrap();

        let p = h.task("p").await;
        assert_eq!(p.status, TaskStatus::Blocked);
        assert_eq!(
            p.status_metadata.blocked_reason.as_deref(),
            Some("Blocked children: p/a")
        );
        h.assert_consistent().await;

        // An edit that resubmits the dependency list leaves the derived status alone.
        let rename = UpdateTaskInput {
            name: Some("renamed".to_string()),
            dependencies: Some(Vec::new()),
            ..Default::default()
        };
        let p = manager.execute_update(&p, rename, &h.ops).await.unwrap();
        assert_eq!(p.name, "renamed");
        assert_eq!(p.status, TaskStatus::Blocked);
        h.assert_consistent().await;

        manager
            .execute_update(&a, UpdateTaskInput::status(TaskStatus::Completed), &h.ops)
            .await
            .unwrap();
        manager
            .execute_update(&b, UpdateTaskInput::status(TaskStatus::Completed), &h.ops)
            .await
            .unwrap();
        let p = h.task("p").await;
        assert_eq!(p.status, TaskStatus::Completed);
        assert!(p.status_metadata.blocked_reason.is_none());
        h.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_reopening_blocks_completed_dependents() {
        let h = Harness::new();
        let db = h.seed("db", &[], TaskStatus::Completed).await;
        h.seed("svc", &[], TaskStatus::Completed).await;
        h.seed("svc/api", &["db"], TaskStatus::Completed).await;
        h.seed("web", &["svc/api"], TaskStatus::Completed).await;
        h.seed("docs", &["db"], TaskStatus::Pending).await;
        let manager = h.manager();
        let before = h.events.current_transaction_id();

        let db = manager
            .execute_update(&db, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .unwrap();
        assert_eq!(db.status, TaskStatus::InProgress);
        assert_eq!(h.events.current_transaction_id(), before + 1);

        let api = h.task("svc/api").await;
        assert_eq!(api.status, TaskStatus::Blocked);
        assert_eq!(api.status_metadata.blocked_by().to_vec(), vec!["db".to_string()]);
        let web = h.task("web").await;
        assert_eq!(web.status, TaskStatus::Blocked);
        assert_eq!(web.status_metadata.blocked_by().to_vec(), vec!["svc/api".to_string()]);
        let svc = h.task("svc").await;
        assert_eq!(svc.status, TaskStatus::Blocked);
        assert_eq!(
            svc.status_metadata.blocked_reason.as_deref(),
            Some("Blocked children: svc/api")
        );
        assert_eq!(h.status("docs").await, TaskStatus::Pending);
        h.assert_consistent().await;

        // Completing again releases the direct dependent only.
        manager
            .execute_update(&db, UpdateTaskInput::status(TaskStatus::Completed), &h.ops)
            .await
            .unwrap();
        assert_eq!(h.status("svc/api").await, TaskStatus::Pending);
        assert_eq!(h.status("web").await, TaskStatus::Blocked);
        h.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_completion_unblocks_dependent() {
        let h = Harness::new();
        let db = h.seed("db", &[], TaskStatus::InProgress).await;
        let api = h.seed("api", &["db"], TaskStatus::Pending).await;
        let manager = h.manager();

        manager
            .execute_update(&api, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
            .await
            .unwrap();
        assert_eq!(h.status("api").await, TaskStatus::Blocked);

        manager
            .execute_update(&db, UpdateTaskInput::status(TaskStatus::Completed), &h.ops)
            .await
            .unwrap();
        let api = h.store.get_task("api").await.unwrap().unwrap();
        assert_eq!(api.status, TaskStatus::Pending);
        assert!(api.status_metadata.blocked_by().is_empty());
    }

    #[tokio::test]
    async fn test_business_rule_failure_is_wrapped() {
        let h = Harness::new();
        let a = h.seed("a", &[], TaskStatus::Pending).await;

        let err = h
            .manager()
            .execute_update(&a, UpdateTaskInput::status(TaskStatus::Blocked), &h.ops)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Transaction { .. }));
        assert!(err.is_validation());
        assert_eq!(h.status("a").await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_updates_get_distinct_ids() {
        let h = Arc::new(Harness::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            tasks.push(h.seed(&format!("t{}", i), &[], TaskStatus::Pending).await);
        }
        let before = h.events.current_transaction_id();
        let mut rx = h.events.subscribe();

        let mut handles = Vec::new();
        for task in tasks {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                h.manager()
                    .execute_update(&task, UpdateTaskInput::status(TaskStatus::InProgress), &h.ops)
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }

        let mut ids = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DatabaseEvent::WriteOperation { transaction_id, .. } = event {
                ids.push(transaction_id);
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, ((before + 1)..=(before + 16)).collect::<Vec<_>>());
    }
}
