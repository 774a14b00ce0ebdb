//! Task module - the task entity, update payloads, validation and the pure
//! status rules.
//!
//! This module is designed to stay free of IO:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented on the types that carry them
//! - Status decisions are pure functions over snapshots

mod error;
pub mod status;
#[allow(clippy::module_inception)]
pub mod task;
pub mod validation;

pub use error::{StorageError, TaskError};
pub use status::{
    aggregate_parent_status, blocked_children_reason, decide_status_transition,
    incomplete_dependencies, ParentStatusUpdate, StatusTransitionResult,
};
pub use task::{
    parent_of, CreateTaskInput, StatusMetadata, Task, TaskStatus, TaskType, UpdateTaskInput,
    VerificationStatus,
};
pub use validation::{validate_create_input, validate_update_input, FieldIssue, ValidationError};
