//! API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether tasks survive a restart
    pub persistent: bool,

    /// Last transaction id handed out
    pub transaction_id: u64,
}

/// Query for listing tasks.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    /// Only return direct children of this path.
    pub parent: Option<String>,
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub tool: String,
    pub result: String,
}

/// Uniform error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
