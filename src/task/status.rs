//! Pure status decisions: dependency overrides and parent aggregation.
//!
//! Nothing here touches storage; callers load the snapshots and persist the
//! outcome.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus, UpdateTaskInput};

/// Effective status for a requested transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransitionResult {
    pub status: TaskStatus,
    /// `true` when dependency state overrode the requested status.
    pub auto_transition: bool,
    /// Dependencies that are not yet completed, in dependency order.
    pub blocked_by: Vec<String>,
}

/// Status change to apply to a parent as a consequence of a child change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentStatusUpdate {
    pub path: String,
    pub status: TaskStatus,
    /// Set when `status` is `Blocked`: names the blocked children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl ParentStatusUpdate {
    /// The write applied to the parent.
    pub fn to_update(&self) -> UpdateTaskInput {
        let mut update = UpdateTaskInput::status(self.status);
        if let Some(reason) = &self.blocked_reason {
            update.status_metadata_mut().blocked_reason = Some(reason.clone());
        }
        update
    }
}

/// `blockedReason` recorded on a parent derived to `Blocked`.
pub fn blocked_children_reason<'a>(blocked: impl IntoIterator<Item = &'a str>) -> String {
    format!(
        "Blocked children: {}",
        blocked.into_iter().collect::<Vec<_>>().join(", ")
    )
}

/// Dependencies that are not `Completed` in `snapshot`. A dependency missing
/// from the snapshot counts as unmet.
pub fn incomplete_dependencies(dependencies: &[String], snapshot: &[Task]) -> Vec<String> {
    dependencies
        .iter()
        .filter(|dep| {
            !snapshot
                .iter()
                .any(|task| &task.path == *dep && task.status == TaskStatus::Completed)
        })
        .cloned()
        .collect()
}

/// Decide the effective status for `requested`.
///
/// An active status (`InProgress`, `Completed`) with unmet dependencies is
/// forced to `Blocked`; everything else is accepted verbatim.
pub fn decide_status_transition(
    requested: TaskStatus,
    dependencies: &[String],
    snapshot: &[Task],
) -> StatusTransitionResult {
    let blocked_by = incomplete_dependencies(dependencies, snapshot);
    if requested.is_active() && !blocked_by.is_empty() {
        StatusTransitionResult {
            status: TaskStatus::Blocked,
            auto_transition: true,
            blocked_by,
        }
    } else {
        StatusTransitionResult {
            status: requested,
            auto_transition: false,
            blocked_by,
        }
    }
}

/// Aggregate a parent's status from its children's statuses.
///
/// Rules, first match wins:
/// 1. every child completed -> `Completed`
/// 2. some child blocked and none in progress -> `Blocked`
/// 3. parent pending and some child started (in progress, blocked or
///    completed) -> `InProgress`
///
/// Returns `None` when no rule applies or the result equals `current`.
pub fn aggregate_parent_status(current: TaskStatus, children: &[TaskStatus]) -> Option<TaskStatus> {
    if children.is_empty() {
        return None;
    }

    let any = |status: TaskStatus| children.iter().any(|s| *s == status);
    let next = if children.iter().all(|s| *s == TaskStatus::Completed) {
        Some(TaskStatus::Completed)
    } else if any(TaskStatus::Blocked) && !any(TaskStatus::InProgress) {
        Some(TaskStatus::Blocked)
    } else if current == TaskStatus::Pending
        && (any(TaskStatus::InProgress) || any(TaskStatus::Blocked) || any(TaskStatus::Completed))
    {
        Some(TaskStatus::InProgress)
    } else {
        None
    };

    next.filter(|status| *status != current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CreateTaskInput;
    use TaskStatus::*;

    fn task(path: &str, status: TaskStatus) -> Task {
        let mut task = Task::from_input(CreateTaskInput::new(path, path), "2024-01-01T00:00:00Z");
        task.status = status;
        task
    }

    #[test]
    fn test_active_request_with_unmet_dependency_is_blocked() {
        let deps = vec!["proj/db".to_string()];
        let snapshot = vec![task("proj/db", Pending)];

        let result = decide_status_transition(InProgress, &deps, &snapshot);
        assert_eq!(result.status, Blocked);
        assert!(result.auto_transition);
        assert_eq!(result.blocked_by, vec!["proj/db".to_string()]);

        let result = decide_status_transition(Completed, &deps, &snapshot);
        assert_eq!(result.status, Blocked);
        assert!(result.auto_transition);
    }

    #[test]
    fn test_request_accepted_when_dependencies_met() {
        let deps = vec!["proj/db".to_string(), "proj/cache".to_string()];
        let snapshot = vec![task("proj/db", Completed), task("proj/cache", Completed)];

        let result = decide_status_transition(InProgress, &deps, &snapshot);
        assert_eq!(result.status, InProgress);
        assert!(!result.auto_transition);
        assert!(result.blocked_by.is_empty());
    }

    #[test]
    fn test_inactive_request_is_never_overridden() {
        let deps = vec!["proj/db".to_string()];
        let result = decide_status_transition(Cancelled, &deps, &[]);
        assert_eq!(result.status, Cancelled);
        assert!(!result.auto_transition);
        // Missing dependency snapshots count as unmet.
        assert_eq!(result.blocked_by, deps);
    }

    #[test]
    fn test_parent_completes_when_all_children_complete() {
        assert_eq!(
            aggregate_parent_status(Blocked, &[Completed, Completed, Completed]),
            Some(Completed)
        );
    }

    #[test]
    fn test_parent_blocked_without_progress() {
        assert_eq!(
            aggregate_parent_status(InProgress, &[Blocked, Pending]),
            Some(Blocked)
        );
        assert_eq!(aggregate_parent_status(InProgress, &[Blocked, InProgress]), None);
    }

    #[test]
    fn test_pending_parent_starts_with_first_active_child() {
        assert_eq!(
            aggregate_parent_status(Pending, &[InProgress, Pending]),
            Some(InProgress)
        );
        assert_eq!(
            aggregate_parent_status(Pending, &[Completed, Pending]),
            Some(InProgress)
        );
        assert_eq!(aggregate_parent_status(Pending, &[Pending, Cancelled]), None);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let children = [Completed, Blocked, Pending];
        let first = aggregate_parent_status(Pending, &children).unwrap();
        assert_eq!(aggregate_parent_status(first, &children), None);
        assert_eq!(aggregate_parent_status(Completed, &[Completed]), None);
        assert_eq!(aggregate_parent_status(Pending, &[]), None);
    }
}
