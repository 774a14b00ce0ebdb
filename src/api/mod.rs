//! HTTP API for tasklink.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/tasks` - List tasks (`?parent=` for direct children)
//! - `POST /api/tasks` - Create a task
//! - `GET /api/task/{path}` - Get one task by its hierarchical path
//! - `POST /api/tasks/update` - Apply an `update_task` call
//! - `GET /api/metrics` - Storage metrics
//! - `GET /api/events` - Stream database events via SSE
//! - `GET /api/tools` - List tool schemas
//! - `POST /api/tools/{name}` - Execute a tool

mod events;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
