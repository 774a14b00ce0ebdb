//! Strategies consulted by the transaction manager while applying an update.
//!
//! Each cascade concern is a separate trait so that it can be supplied,
//! omitted, or replaced independently:
//!
//! | Step | Strategy | Required |
//! |------|----------|----------|
//! | business rules | [`UpdateValidator`] | yes |
//! | dependency list changes | [`DependencyHandler`] | no |
//! | notify dependents | [`StatusPropagator`] | no |
//! | dependency override | [`TransitionValidator`] | no |
//! | parent aggregation | [`ParentChildValidator`] | no |
//! | cache & events | [`UpdateSink`] | yes |
//!
//! Strategies read and write through the open [`TaskTransaction`] only, so
//! everything they do is rolled back with the unit.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::store::TaskTransaction;
use crate::task::{
    aggregate_parent_status, blocked_children_reason, decide_status_transition,
    incomplete_dependencies, validate_update_input, ParentStatusUpdate, StatusTransitionResult,
    Task, TaskError, TaskStatus, UpdateTaskInput, ValidationError,
};

/// Business-rule check run before any mutation.
#[async_trait]
pub trait UpdateValidator: Send + Sync {
    async fn validate_update(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError>;
}

/// Reconciles a changed dependency list; may revise the pending update.
#[async_trait]
pub trait DependencyHandler: Send + Sync {
    async fn handle_dependency_updates(
        &self,
        task: &Task,
        updates: &mut UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError>;
}

/// Notifies dependents of an impending status change.
#[async_trait]
pub trait StatusPropagator: Send + Sync {
    async fn handle_status_propagation(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError>;
}

/// Decides the effective status. Must not write.
#[async_trait]
pub trait TransitionValidator: Send + Sync {
    async fn validate_status_transition(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<StatusTransitionResult, TaskError>;
}

/// Computes the parent cascade for a child's new status. Must not write.
#[async_trait]
pub trait ParentChildValidator: Send + Sync {
    async fn validate_parent_child_status(
        &self,
        task: &Task,
        new_status: TaskStatus,
        tx: &mut dyn TaskTransaction,
    ) -> Result<Option<ParentStatusUpdate>, TaskError>;
}

/// Receives committed results.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    fn update_cache(&self, task: &Task);

    /// Drop a cached entry written indirectly inside the unit.
    fn invalidate(&self, path: &str);

    async fn emit_events(&self, task: &Task);

    fn emit_error(&self, operation: &str, error: &TaskError, target: &str);
}

/// The strategy set handed to [`crate::transaction::TaskTransactionManager::execute_update`].
#[derive(Clone)]
pub struct StatusOperations {
    pub validator: Arc<dyn UpdateValidator>,
    pub dependencies: Option<Arc<dyn DependencyHandler>>,
    pub propagation: Option<Arc<dyn StatusPropagator>>,
    pub transition: Option<Arc<dyn TransitionValidator>>,
    pub parent_child: Option<Arc<dyn ParentChildValidator>>,
    pub sink: Arc<dyn UpdateSink>,
}

impl StatusOperations {
    /// Only the required strategies; every optional step is skipped.
    pub fn new(validator: Arc<dyn UpdateValidator>, sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            validator,
            dependencies: None,
            propagation: None,
            transition: None,
            parent_child: None,
            sink,
        }
    }

    /// The full set of built-in strategies.
    pub fn standard(sink: Arc<dyn UpdateSink>) -> Self {
        Self::new(Arc::new(StandardUpdateValidator), sink)
            .with_dependency_handler(Arc::new(StandardDependencyHandler))
            .with_propagation(Arc::new(DependentPropagator))
            .with_transition_validator(Arc::new(DependencyTransitionValidator))
            .with_parent_child_validator(Arc::new(ParentAggregationValidator))
    }

    pub fn with_dependency_handler(mut self, handler: Arc<dyn DependencyHandler>) -> Self {
        self.dependencies = Some(handler);
        self
    }

    pub fn with_propagation(mut self, propagator: Arc<dyn StatusPropagator>) -> Self {
        self.propagation = Some(propagator);
        self
    }

    pub fn with_transition_validator(mut self, validator: Arc<dyn TransitionValidator>) -> Self {
        self.transition = Some(validator);
        self
    }

    pub fn with_parent_child_validator(mut self, validator: Arc<dyn ParentChildValidator>) -> Self {
        self.parent_child = Some(validator);
        self
    }
}

fn effective_dependencies<'a>(task: &'a Task, updates: &'a UpdateTaskInput) -> &'a [String] {
    updates.dependencies.as_deref().unwrap_or(&task.dependencies)
}

/// Load the dependency snapshot visible to the transaction.
async fn load_dependencies(
    deps: &[String],
    tx: &mut dyn TaskTransaction,
) -> Result<Vec<Task>, TaskError> {
    let mut snapshot = Vec::with_capacity(deps.len());
    for dep in deps {
        if let Some(task) = tx.get_task(dep).await? {
            snapshot.push(task);
        }
    }
    Ok(snapshot)
}

/// Built-in business rules.
///
/// - the payload respects the input bounds
/// - a task with children has a derived status and cannot be set directly
/// - a move (`parent_path`) cannot be combined with a status change
/// - the new parent exists and is not the task or one of its descendants
/// - a requested `Blocked` needs unmet dependencies, `blockedBy`, or a reason
pub struct StandardUpdateValidator;

#[async_trait]
impl UpdateValidator for StandardUpdateValidator {
    async fn validate_update(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError> {
        validate_update_input(updates)?;

        let status_change = updates.status.filter(|s| *s != task.status);
        let moved_to = updates
            .parent_path
            .as_deref()
            .filter(|p| Some(*p) != task.parent_path.as_deref());

        if status_change.is_some() && moved_to.is_some() {
            return Err(ValidationError::single(
                "parentPath",
                "a move cannot be combined with a status change in the same update",
            )
            .into());
        }

        if status_change.is_some() && !tx.get_children(&task.path).await?.is_empty() {
            return Err(ValidationError::single(
                "status",
                "the status of a task with children is derived from its children",
            )
            .into());
        }

        if let Some(new_parent) = moved_to {
            if new_parent == task.path || new_parent.starts_with(&format!("{}/", task.path)) {
                return Err(ValidationError::single(
                    "parentPath",
                    "a task cannot be moved under itself",
                )
                .into());
            }
            let mut cursor = Some(new_parent.to_string());
            let mut seen = HashSet::new();
            while let Some(path) = cursor {
                if path == task.path {
                    return Err(ValidationError::single(
                        "parentPath",
                        "a task cannot be moved under one of its descendants",
                    )
                    .into());
                }
                if !seen.insert(path.clone()) {
                    break;
                }
                let ancestor = tx
                    .get_task(&path)
                    .await?
                    .ok_or_else(|| TaskError::not_found(&path))?;
                cursor = ancestor.parent_path;
            }
        }

        if status_change == Some(TaskStatus::Blocked) {
            let meta = updates.status_metadata.as_ref();
            let has_reason = meta.and_then(|m| m.blocked_reason.as_ref()).is_some()
                || task.status_metadata.blocked_reason.is_some();
            let has_blockers = meta
                .and_then(|m| m.blocked_by.as_ref())
                .is_some_and(|b| !b.is_empty());
            if !has_reason && !has_blockers {
                let deps = effective_dependencies(task, updates);
                let snapshot = load_dependencies(deps, tx).await?;
                if incomplete_dependencies(deps, &snapshot).is_empty() {
                    return Err(ValidationError::single(
                        "status",
                        "BLOCKED requires an unmet dependency, blockedBy, or blockedReason",
                    )
                    .into());
                }
            }
        }

        Ok(())
    }
}

/// Validates and normalizes a new dependency list.
///
/// Rejects self-references, unknown paths and cycles; removes duplicates.
/// Keeps the blocked-by set in step with the new list and adjusts the status
/// when the list alone makes the current status inconsistent. A task with
/// children keeps its derived status.
pub struct StandardDependencyHandler;

impl StandardDependencyHandler {
    /// `true` if `start` (transitively) depends on `target`.
    async fn reaches(
        start: &str,
        target: &str,
        tx: &mut dyn TaskTransaction,
    ) -> Result<bool, TaskError> {
        let mut stack = vec![start.to_string()];
        let mut visited = HashSet::new();
        while let Some(path) = stack.pop() {
            if path == target {
                return Ok(true);
            }
            if !visited.insert(path.clone()) {
                continue;
            }
            if let Some(task) = tx.get_task(&path).await? {
                stack.extend(task.dependencies);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl DependencyHandler for StandardDependencyHandler {
    async fn handle_dependency_updates(
        &self,
        task: &Task,
        updates: &mut UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError> {
        let Some(requested) = updates.dependencies.take() else {
            return Ok(());
        };
        let deps = crate::task::task::dedup_paths(requested);

        let mut snapshot = Vec::with_capacity(deps.len());
        for dep in &deps {
            if dep == &task.path {
                return Err(
                    ValidationError::single("dependencies", "a task cannot depend on itself").into(),
                );
            }
            let dep_task = tx
                .get_task(dep)
                .await?
                .ok_or_else(|| TaskError::not_found(dep))?;
            if !task.dependencies.contains(dep) && Self::reaches(dep, &task.path, tx).await? {
                return Err(ValidationError::single(
                    "dependencies",
                    format!("adding {} would create a dependency cycle", dep),
                )
                .into());
            }
            snapshot.push(dep_task);
        }

        let unmet = incomplete_dependencies(&deps, &snapshot);
        let has_children = !tx.get_children(&task.path).await?.is_empty();
        let has_reason = updates
            .status_metadata
            .as_ref()
            .and_then(|m| m.blocked_reason.as_ref())
            .or(task.status_metadata.blocked_reason.as_ref())
            .is_some();

        match updates.status {
            // Derived from the children.
            _ if has_children => {}
            None if task.status == TaskStatus::Blocked => {
                if unmet.is_empty() && !has_reason {
                    tracing::info!("Dependencies of {} are met; unblocking", task.path);
                    updates.status = Some(TaskStatus::Pending);
                    updates.status_metadata_mut().blocked_by = Some(Vec::new());
                } else {
                    updates.status_metadata_mut().blocked_by = Some(unmet);
                }
            }
            None if task.status.is_active() && !unmet.is_empty() => {
                tracing::info!(
                    "New dependencies of {} are not completed; blocking",
                    task.path
                );
                updates.status = Some(TaskStatus::Blocked);
                updates.status_metadata_mut().blocked_by = Some(unmet);
            }
            _ => {}
        }

        updates.dependencies = Some(deps);
        Ok(())
    }
}

/// Updates dependents' blocked-by sets.
///
/// Completing a task removes it from every dependent's `blockedBy`; a
/// dependent left with no blocker and no reason returns to `Pending`.
/// Re-opening a completed task adds it to the `blockedBy` of every blocked
/// dependent and blocks active ones. A completed dependent blocked this way
/// is itself re-opened, so the walk continues through its dependents.
/// Dependents with children keep their derived status. Every dependent whose
/// status changes re-aggregates its parent.
///
/// A completion that the transition validator will override (the task's own
/// dependencies are unmet) propagates nothing.
pub struct DependentPropagator;

impl DependentPropagator {
    async fn unblock_dependents(
        task: &Task,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError> {
        for dependent in tx.get_dependents(&task.path).await? {
            if dependent.status != TaskStatus::Blocked {
                continue;
            }
            let blocked_by = dependent.status_metadata.blocked_by();
            if !blocked_by.iter().any(|p| p == &task.path) {
                continue;
            }
            let remaining: Vec<String> = blocked_by
                .iter()
                .filter(|p| *p != &task.path)
                .cloned()
                .collect();

            let mut change = UpdateTaskInput::default();
            if remaining.is_empty()
                && dependent.status_metadata.blocked_reason.is_none()
                && tx.get_children(&dependent.path).await?.is_empty()
            {
                tracing::info!("Unblocking {} after {} completed", dependent.path, task.path);
                change.status = Some(TaskStatus::Pending);
            }
            change.status_metadata_mut().blocked_by = Some(remaining);
            let updated = tx.update_task(&dependent.path, &change).await?;
            if change.status.is_some() {
                cascade_to_parent(&updated, tx).await?;
            }
        }
        Ok(())
    }

    async fn block_dependents(task: &Task, tx: &mut dyn TaskTransaction) -> Result<(), TaskError> {
        let mut reopened = vec![task.path.clone()];
        let mut seen = HashSet::new();
        while let Some(path) = reopened.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            for dependent in tx.get_dependents(&path).await? {
                let mut blocked_by = dependent.status_metadata.blocked_by().to_vec();
                let already_listed = blocked_by.contains(&path);
                if !already_listed {
                    blocked_by.push(path.clone());
                }

                let mut change = UpdateTaskInput::default();
                match dependent.status {
                    TaskStatus::Blocked if already_listed => continue,
                    TaskStatus::Blocked => {}
                    status if status.is_active() => {
                        if !tx.get_children(&dependent.path).await?.is_empty() {
                            continue;
                        }
                        tracing::info!("Blocking {} after {} was reopened", dependent.path, path);
                        change.status = Some(TaskStatus::Blocked);
                        if status == TaskStatus::Completed {
                            reopened.push(dependent.path.clone());
                        }
                    }
                    _ => continue,
                }
                change.status_metadata_mut().blocked_by = Some(blocked_by);
                let updated = tx.update_task(&dependent.path, &change).await?;
                if change.status.is_some() {
                    cascade_to_parent(&updated, tx).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatusPropagator for DependentPropagator {
    async fn handle_status_propagation(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<(), TaskError> {
        let Some(requested) = updates.status else {
            return Ok(());
        };

        if requested == TaskStatus::Completed {
            let deps = effective_dependencies(task, updates);
            let snapshot = load_dependencies(deps, tx).await?;
            if incomplete_dependencies(deps, &snapshot).is_empty() {
                Self::unblock_dependents(task, tx).await?;
            }
        } else if task.status == TaskStatus::Completed {
            Self::block_dependents(task, tx).await?;
        }

        Ok(())
    }
}

/// Forces `Blocked` when an active status is requested with unmet dependencies.
pub struct DependencyTransitionValidator;

#[async_trait]
impl TransitionValidator for DependencyTransitionValidator {
    async fn validate_status_transition(
        &self,
        task: &Task,
        updates: &UpdateTaskInput,
        tx: &mut dyn TaskTransaction,
    ) -> Result<StatusTransitionResult, TaskError> {
        let requested = updates.status.unwrap_or(task.status);
        let deps = effective_dependencies(task, updates);
        let snapshot = load_dependencies(deps, tx).await?;
        Ok(decide_status_transition(requested, deps, &snapshot))
    }
}

/// Cascade for `task`'s parent if `task` moves to `new_status`.
async fn parent_cascade(
    task: &Task,
    new_status: TaskStatus,
    tx: &mut dyn TaskTransaction,
) -> Result<Option<ParentStatusUpdate>, TaskError> {
    let Some(parent_path) = task.parent_path.as_deref() else {
        return Ok(None);
    };
    let Some(parent) = tx.get_task(parent_path).await? else {
        return Ok(None);
    };

    let mut children: Vec<(String, TaskStatus)> = tx
        .get_children(parent_path)
        .await?
        .into_iter()
        .filter(|child| child.path != task.path)
        .map(|child| (child.path, child.status))
        .collect();
    children.push((task.path.clone(), new_status));
    let statuses: Vec<TaskStatus> = children.iter().map(|(_, status)| *status).collect();

    Ok(
        aggregate_parent_status(parent.status, &statuses).map(|status| ParentStatusUpdate {
            blocked_reason: (status == TaskStatus::Blocked).then(|| {
                blocked_children_reason(
                    children
                        .iter()
                        .filter(|(_, s)| *s == TaskStatus::Blocked)
                        .map(|(path, _)| path.as_str()),
                )
            }),
            path: parent.path,
            status,
        }),
    )
}

/// Re-aggregate the parent of a task whose status was changed indirectly.
async fn cascade_to_parent(task: &Task, tx: &mut dyn TaskTransaction) -> Result<(), TaskError> {
    if let Some(cascade) = parent_cascade(task, task.status, tx).await? {
        tracing::info!("Parent {} moved to {} by {}", cascade.path, cascade.status, task.path);
        tx.update_task(&cascade.path, &cascade.to_update()).await?;
    }
    Ok(())
}

/// Aggregates the parent's status from its children. A parent derived to
/// `Blocked` carries a `blockedReason` naming its blocked children.
pub struct ParentAggregationValidator;

#[async_trait]
impl ParentChildValidator for ParentAggregationValidator {
    async fn validate_parent_child_status(
        &self,
        task: &Task,
        new_status: TaskStatus,
        tx: &mut dyn TaskTransaction,
    ) -> Result<Option<ParentStatusUpdate>, TaskError> {
        parent_cascade(task, new_status, tx).await
    }
}
