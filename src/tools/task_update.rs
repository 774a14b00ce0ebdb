//! `update_task` tool: merge caller-supplied fields onto an existing task and
//! apply the result through the task manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::Tool;
use crate::manager::TaskManager;
use crate::task::{
    StatusMetadata, Task, TaskError, TaskStatus, TaskType, UpdateTaskInput, ValidationError,
};

/// Arguments of the `update_task` tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskArgs {
    pub path: String,
    #[serde(default)]
    pub updates: TaskUpdates,
}

/// Fields a caller may change. Names follow the tool schema.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdates {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Case-insensitive task type.
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    /// Case-insensitive status name.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub status_metadata: Option<StatusMetadata>,
}

/// Build the full update for `existing`.
///
/// Unset fields keep their current values, `metadata` and `statusMetadata`
/// are shallow-merged, and the dependency list is always re-submitted so
/// that it is re-checked against the current graph.
pub fn merge_updates(existing: &Task, updates: TaskUpdates) -> Result<UpdateTaskInput, TaskError> {
    let task_type = match updates.task_type {
        Some(raw) => TaskType::parse(&raw).ok_or_else(|| {
            ValidationError::single("type", format!("unknown task type '{}'", raw))
        })?,
        None => existing.task_type,
    };
    let status = match updates.status {
        Some(raw) => Some(TaskStatus::parse(&raw).ok_or_else(|| {
            ValidationError::single("status", format!("unknown status '{}'", raw))
        })?),
        None => None,
    };

    let metadata = updates.metadata.map(|incoming| {
        let mut merged = existing.metadata.clone();
        merged.extend(incoming);
        merged
    });
    let status_metadata = updates.status_metadata.map(|incoming| {
        let mut merged = existing.status_metadata.clone();
        merged.merge(incoming);
        merged
    });

    Ok(UpdateTaskInput {
        name: Some(updates.title.unwrap_or_else(|| existing.name.clone())),
        description: Some(
            updates
                .description
                .unwrap_or_else(|| existing.description.clone()),
        ),
        task_type: Some(task_type),
        status,
        parent_path: updates.parent_path,
        dependencies: Some(
            updates
                .dependencies
                .unwrap_or_else(|| existing.dependencies.clone()),
        ),
        metadata,
        status_metadata,
        ..Default::default()
    })
}

/// Load the task at `args.path`, merge the updates and apply them.
pub async fn update_task(manager: &TaskManager, args: UpdateTaskArgs) -> Result<Task, TaskError> {
    let existing = manager
        .get_task(&args.path)
        .await?
        .ok_or_else(|| TaskError::not_found(&args.path))?;
    let updates = merge_updates(&existing, args.updates)?;
    manager.update_task(&args.path, updates).await
}

pub struct UpdateTask {
    manager: Arc<TaskManager>,
}

impl UpdateTask {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for UpdateTask {
    fn name(&self) -> &str {
        "update_task"
    }

    fn description(&self) -> &str {
        "Update an existing task. Only the supplied fields change; metadata and statusMetadata \
         are merged. Requesting IN_PROGRESS or COMPLETED while dependencies are unfinished \
         results in BLOCKED, and parent statuses follow their children."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the task to update, e.g. 'project/backend/api'"
                },
                "updates": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                        "type": { "type": "string", "enum": ["TASK", "MILESTONE"] },
                        "status": {
                            "type": "string",
                            "enum": ["PENDING", "IN_PROGRESS", "COMPLETED", "BLOCKED", "CANCELLED"]
                        },
                        "parentPath": { "type": "string" },
                        "dependencies": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Full replacement list of dependency paths"
                        },
                        "metadata": { "type": "object" },
                        "statusMetadata": {
                            "type": "object",
                            "properties": {
                                "assignee": { "type": "string" },
                                "progressIndicators": { "type": "array", "items": { "type": "string" } },
                                "completedBy": { "type": "string" },
                                "verificationStatus": { "type": "string", "enum": ["passed", "failed"] },
                                "completionChecks": { "type": "array", "items": { "type": "string" } },
                                "errorType": { "type": "string" },
                                "errorDetails": { "type": "string" },
                                "recoveryAttempts": { "type": "integer", "minimum": 0 },
                                "blockedBy": { "type": "array", "items": { "type": "string" } },
                                "blockedReason": { "type": "string" }
                            }
                        }
                    }
                }
            },
            "required": ["path", "updates"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let args: UpdateTaskArgs = serde_json::from_value(args)
            .map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;

        let task = update_task(&self.manager, args).await?;
        Ok(serde_json::to_string_pretty(&task)?)
    }
}
