//! Core Task type, its status lifecycle and the partial-update payload.
//!
//! # Invariants
//! - `path` is unique across the store
//! - every entry of `dependencies` names an existing task
//! - `status == Completed` implies every dependency is `Completed`
//! - `status == Blocked` implies a non-empty `blocked_by` or a `blocked_reason`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    Task,
    Milestone,
}

impl TaskType {
    /// Parse a type name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TASK" => Some(Self::Task),
            "MILESTONE" => Some(Self::Milestone),
            _ => None,
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> InProgress -> Completed
///        \-> Blocked <-/
///        \-> Cancelled
/// ```
/// `Blocked` is entered either on request (with a reason) or automatically
/// when an active status is requested while dependencies are unmet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// `true` for statuses that require every dependency to be completed.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parse a status name as it appears on the wire.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "BLOCKED" => Some(Self::Blocked),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a verification step recorded on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Passed,
    Failed,
}

/// Structured status-support fields.
///
/// Every field is optional so that a partial value can be shallow-merged onto
/// the stored one: `Some` replaces, `None` preserves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_indicators: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_checks: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_attempts: Option<u32>,
    /// Unmet dependency paths justifying a `Blocked` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Vec<String>>,
    /// Non-dependency reason for a `Blocked` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl StatusMetadata {
    /// Shallow merge: every field set on `other` replaces the field on `self`.
    pub fn merge(&mut self, other: StatusMetadata) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            assignee,
            progress_indicators,
            completed_by,
            verification_status,
            completion_checks,
            error_type,
            error_details,
            recovery_attempts,
            blocked_by,
            blocked_reason
        );
    }

    pub fn blocked_by(&self) -> &[String] {
        self.blocked_by.as_deref().unwrap_or_default()
    }
}

/// A unit of work identified by its hierarchical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: TaskStatus,
    /// Defaults to the path prefix; may differ after a move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planning_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completion_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub troubleshooting_notes: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub status_metadata: StatusMetadata,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Build a fresh `Pending` task from a creation request.
    pub fn from_input(input: CreateTaskInput, now: &str) -> Self {
        let parent_path = input
            .parent_path
            .or_else(|| parent_of(&input.path).map(str::to_string));
        Self {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description.unwrap_or_default(),
            task_type: input.task_type.unwrap_or_default(),
            status: TaskStatus::Pending,
            parent_path,
            dependencies: dedup_paths(input.dependencies),
            notes: Vec::new(),
            reasoning: None,
            planning_notes: Vec::new(),
            progress_notes: Vec::new(),
            completion_notes: Vec::new(),
            troubleshooting_notes: Vec::new(),
            metadata: input.metadata.unwrap_or_default(),
            status_metadata: StatusMetadata::default(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            path: input.path,
        }
    }

    /// Apply a partial update in place. `None` fields are left untouched;
    /// `metadata` and `status_metadata` are replaced/merged as provided.
    pub fn apply(&mut self, updates: &UpdateTaskInput, now: &str) {
        let was_blocked = self.status == TaskStatus::Blocked;
        if let Some(name) = &updates.name {
            self.name = name.clone();
        }
        if let Some(description) = &updates.description {
            self.description = description.clone();
        }
        if let Some(task_type) = updates.task_type {
            self.task_type = task_type;
        }
        if let Some(status) = updates.status {
            self.status = status;
        }
        if let Some(parent_path) = &updates.parent_path {
            self.parent_path = Some(parent_path.clone());
        }
        if let Some(dependencies) = &updates.dependencies {
            self.dependencies = dependencies.clone();
        }
        if let Some(notes) = &updates.notes {
            self.notes = notes.clone();
        }
        if let Some(reasoning) = &updates.reasoning {
            self.reasoning = Some(reasoning.clone());
        }
        if let Some(notes) = &updates.planning_notes {
            self.planning_notes = notes.clone();
        }
        if let Some(notes) = &updates.progress_notes {
            self.progress_notes = notes.clone();
        }
        if let Some(notes) = &updates.completion_notes {
            self.completion_notes = notes.clone();
        }
        if let Some(notes) = &updates.troubleshooting_notes {
            self.troubleshooting_notes = notes.clone();
        }
        if let Some(metadata) = &updates.metadata {
            self.metadata = metadata.clone();
        }
        if let Some(status_metadata) = &updates.status_metadata {
            self.status_metadata.merge(status_metadata.clone());
        }
        if was_blocked && self.status != TaskStatus::Blocked {
            // A reason only ever justifies `Blocked`.
            self.status_metadata.blocked_reason = None;
        }
        self.updated_at = now.to_string();
    }
}

/// Parent path derived from a hierarchical path (`a/b/c` -> `a/b`).
pub fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/')
        .map(|idx| &path[..idx])
        .filter(|parent| !parent.is_empty())
}

/// Drop duplicate paths while keeping first-seen order.
pub fn dedup_paths(paths: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Request for the external creation path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl CreateTaskInput {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update applied through the transaction manager.
///
/// Bounds are checked by [`crate::task::validate_update_input`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_metadata: Option<StatusMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_notes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_notes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_notes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub troubleshooting_notes: Option<Vec<String>>,
}

impl UpdateTaskInput {
    /// An update that only sets the status (used for parent cascades).
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(dependencies.into_iter().map(Into::into).collect());
        self
    }

    /// Mutable access to the status metadata, creating it if absent.
    pub fn status_metadata_mut(&mut self) -> &mut StatusMetadata {
        self.status_metadata.get_or_insert_with(StatusMetadata::default)
    }
}
