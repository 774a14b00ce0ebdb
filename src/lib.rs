//! # tasklink
//!
//! Transactional status propagation for hierarchical, dependency-linked tasks.
//!
//! A status change touches more than one task: dependents waiting on it, the
//! parent whose status is derived from its children, and the task itself when
//! its own dependencies force it to `BLOCKED`. Every such change runs as one
//! atomic unit so that no reader ever observes half of a cascade.
//!
//! ## Architecture
//!
//! ```text
//!   update_task tool / HTTP API
//!              │
//!              ▼
//!        TaskManager ──────────────▶ TaskCache
//!              │                         ▲
//!              ▼                         │ after commit
//!   TaskTransactionManager ──────────▶ EventBus
//!              │
//!              ▼
//!   TaskStore::begin() ─▶ TaskTransaction (memory | SQLite)
//! ```
//!
//! ## Modules
//! - `task`: task model, input validation and pure status decisions
//! - `store`: storage backends and their transactions
//! - `operations`: pluggable cascade strategies
//! - `transaction`: the atomic update pipeline
//! - `manager`: cache-through reads and the update entry point
//! - `tools`: the `update_task` tool
//! - `api`: HTTP routes and the event stream

pub mod api;
pub mod cache;
pub mod config;
pub mod events;
pub mod manager;
pub mod operations;
pub mod store;
pub mod task;
pub mod tools;
pub mod transaction;

pub use config::Config;
pub use events::{DatabaseEvent, EventBus};
pub use manager::TaskManager;
pub use operations::StatusOperations;
pub use store::{create_task_store, SharedTaskStore, TaskStore, TaskStoreType};
pub use transaction::TaskTransactionManager;
