//! Bounds checking for update payloads.
//!
//! Runs strictly upstream of the transaction manager: a payload that fails
//! here never reaches storage.

use serde::Serialize;
use thiserror::Error;

use super::task::{CreateTaskInput, UpdateTaskInput};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_REASONING_LEN: usize = 2000;
pub const MAX_NOTES: usize = 100;
pub const MAX_NOTE_LEN: usize = 1000;
pub const MAX_DEPENDENCIES: usize = 50;
pub const MAX_CATEGORY_NOTES: usize = 25;
pub const MAX_CATEGORY_NOTE_LEN: usize = 2000;

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

/// One or more field-level problems with an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("Validation failed: {}", format_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

fn format_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![FieldIssue {
                field: field.into(),
                message: message.into(),
            }],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

#[derive(Default)]
struct Issues(Vec<FieldIssue>);

impl Issues {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    fn text(&mut self, field: &str, value: Option<&str>, max: usize) {
        if let Some(value) = value {
            let len = value.chars().count();
            if len > max {
                self.push(field, format!("must be at most {} characters (got {})", max, len));
            }
        }
    }

    fn list(&mut self, field: &str, values: Option<&[String]>, max_items: usize, max_len: usize) {
        let Some(values) = values else {
            return;
        };
        if values.len() > max_items {
            self.push(
                field,
                format!("must have at most {} entries (got {})", max_items, values.len()),
            );
        }
        for (i, value) in values.iter().enumerate() {
            if value.chars().count() > max_len {
                self.push(
                    format!("{}[{}]", field, i),
                    format!("must be at most {} characters", max_len),
                );
            }
        }
    }

    fn paths(&mut self, field: &str, values: &[String]) {
        for (i, value) in values.iter().enumerate() {
            if let Err(message) = check_path(value) {
                self.push(format!("{}[{}]", field, i), message);
            }
        }
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues: self.0 })
        }
    }
}

fn check_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("path must not be empty");
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err("path must not start or end with '/'");
    }
    if path.split('/').any(|segment| segment.trim().is_empty()) {
        return Err("path must not contain empty segments");
    }
    Ok(())
}

/// Check an update payload against the input contract.
pub fn validate_update_input(input: &UpdateTaskInput) -> Result<(), ValidationError> {
    let mut issues = Issues::default();

    if let Some(name) = &input.name {
        if name.trim().is_empty() {
            issues.push("name", "must not be empty");
        }
    }
    issues.text("name", input.name.as_deref(), MAX_NAME_LEN);
    issues.text("description", input.description.as_deref(), MAX_DESCRIPTION_LEN);
    issues.text("reasoning", input.reasoning.as_deref(), MAX_REASONING_LEN);
    issues.list("notes", input.notes.as_deref(), MAX_NOTES, MAX_NOTE_LEN);

    if let Some(dependencies) = &input.dependencies {
        if dependencies.len() > MAX_DEPENDENCIES {
            issues.push(
                "dependencies",
                format!(
                    "must have at most {} entries (got {})",
                    MAX_DEPENDENCIES,
                    dependencies.len()
                ),
            );
        }
        issues.paths("dependencies", dependencies);
    }
    if let Some(parent_path) = &input.parent_path {
        if let Err(message) = check_path(parent_path) {
            issues.push("parentPath", message);
        }
    }

    for (field, notes) in [
        ("planningNotes", &input.planning_notes),
        ("progressNotes", &input.progress_notes),
        ("completionNotes", &input.completion_notes),
        ("troubleshootingNotes", &input.troubleshooting_notes),
    ] {
        issues.list(field, notes.as_deref(), MAX_CATEGORY_NOTES, MAX_CATEGORY_NOTE_LEN);
    }

    if let Some(meta) = &input.status_metadata {
        if let Some(blocked_by) = &meta.blocked_by {
            issues.paths("statusMetadata.blockedBy", blocked_by);
        }
    }

    issues.finish()
}

/// Check a creation request.
pub fn validate_create_input(input: &CreateTaskInput) -> Result<(), ValidationError> {
    let mut issues = Issues::default();

    if let Err(message) = check_path(&input.path) {
        issues.push("path", message);
    }
    if input.name.trim().is_empty() {
        issues.push("name", "must not be empty");
    }
    issues.text("name", Some(input.name.as_str()), MAX_NAME_LEN);
    issues.text("description", input.description.as_deref(), MAX_DESCRIPTION_LEN);
    if input.dependencies.len() > MAX_DEPENDENCIES {
        issues.push(
            "dependencies",
            format!("must have at most {} entries", MAX_DEPENDENCIES),
        );
    }
    issues.paths("dependencies", &input.dependencies);
    if input.dependencies.iter().any(|dep| dep == &input.path) {
        issues.push("dependencies", "a task cannot depend on itself");
    }

    issues.finish()
}
