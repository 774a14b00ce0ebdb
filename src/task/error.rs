//! Error types for task operations.
//!
//! Two wrapping layers exist inside an atomic unit: a failed per-task write
//! becomes [`TaskError::TaskOperation`], and anything escaping the unit is
//! wrapped again as [`TaskError::Transaction`]. Both keep the cause reachable
//! through [`std::error::Error::source`].

use thiserror::Error;

use super::task::UpdateTaskInput;
use super::validation::ValidationError;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    Join(String),

    #[error("Store is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

/// Errors surfaced by the task core.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Task not found at path: {path}")]
    NotFound { path: String },

    #[error("{operation}: failed to update task {path}")]
    TaskOperation {
        operation: &'static str,
        path: String,
        updates: Box<UpdateTaskInput>,
        #[source]
        source: StorageError,
    },

    #[error("Transaction failed for {path} in {operation}: {message}")]
    Transaction {
        path: String,
        operation: &'static str,
        message: String,
        #[source]
        source: Box<TaskError>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TaskError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Wrap an error raised inside an atomic unit.
    pub fn transaction(path: impl Into<String>, operation: &'static str, source: TaskError) -> Self {
        Self::Transaction {
            path: path.into(),
            operation,
            message: source.to_string(),
            source: Box::new(source),
        }
    }

    /// Innermost task error, looking through transaction wrapping.
    pub fn root(&self) -> &TaskError {
        match self {
            TaskError::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    /// `true` when the failure was a rejected input or business rule.
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), TaskError::Validation(_))
    }

    /// `true` when a referenced task does not exist, at any wrapping depth.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            TaskError::NotFound { .. } => true,
            TaskError::TaskOperation { source, .. } | TaskError::Storage(source) => {
                matches!(source, StorageError::NotFound(_))
            }
            _ => false,
        }
    }
}
