//! Database event notifications.
//!
//! Subscribers receive a [`DatabaseEvent`] for every committed write, every
//! read-only query and every failure. Write events carry a transaction id
//! drawn from a process-wide atomic counter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::store::now_string;

/// Description of a committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOperation {
    pub description: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseEvent {
    #[serde(rename_all = "camelCase")]
    WriteOperation {
        timestamp: String,
        transaction_id: u64,
        operation: WriteOperation,
    },
    #[serde(rename_all = "camelCase")]
    ReadOperation { timestamp: String, query: String },
    #[serde(rename_all = "camelCase")]
    Error {
        timestamp: String,
        operation: String,
        error: String,
        target: String,
    },
}

impl DatabaseEvent {
    /// Event name for SSE framing.
    pub fn event_name(&self) -> &'static str {
        match self {
            DatabaseEvent::WriteOperation { .. } => "write",
            DatabaseEvent::ReadOperation { .. } => "read",
            DatabaseEvent::Error { .. } => "error",
        }
    }
}

/// Broadcast hub for database events.
pub struct EventBus {
    tx: broadcast::Sender<DatabaseEvent>,
    transaction_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            transaction_counter: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.tx.subscribe()
    }

    /// Last transaction id handed out (0 before the first write).
    pub fn current_transaction_id(&self) -> u64 {
        self.transaction_counter.load(Ordering::SeqCst)
    }

    /// Publish a write event with the next transaction id and return that id.
    pub fn publish_write(&self, operation: WriteOperation) -> u64 {
        let transaction_id = self.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(DatabaseEvent::WriteOperation {
            timestamp: now_string(),
            transaction_id,
            operation,
        });
        transaction_id
    }

    pub fn publish_read(&self, query: impl Into<String>) {
        self.send(DatabaseEvent::ReadOperation {
            timestamp: now_string(),
            query: query.into(),
        });
    }

    pub fn publish_error(
        &self,
        operation: impl Into<String>,
        error: impl std::fmt::Display,
        target: impl Into<String>,
    ) {
        self.send(DatabaseEvent::Error {
            timestamp: now_string(),
            operation: operation.into(),
            error: error.to_string(),
            target: target.into(),
        });
    }

    fn send(&self, event: DatabaseEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_event_carries_transaction_id() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let id = bus.publish_write(WriteOperation {
            description: "update_task".to_string(),
            path: "proj/api".to_string(),
            status: Some("BLOCKED".to_string()),
        });
        assert_eq!(id, 1);
        assert_eq!(bus.current_transaction_id(), 1);

        match rx.recv().await.expect("event") {
            DatabaseEvent::WriteOperation {
                transaction_id,
                operation,
                ..
            } => {
                assert_eq!(transaction_id, 1);
                assert_eq!(operation.path, "proj/api");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_distinct() {
        let bus = Arc::new(EventBus::new(256));
        let mut handles = Vec::new();
        for i in 0..64 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                bus.publish_write(WriteOperation {
                    description: "update_task".to_string(),
                    path: format!("p/{}", i),
                    status: None,
                })
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.expect("join"));
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(ids.iter().max(), Some(&64));
    }

    #[test]
    fn test_event_wire_format() {
        let event = DatabaseEvent::Error {
            timestamp: "t".to_string(),
            operation: "executeUpdate".to_string(),
            error: "boom".to_string(),
            target: "proj/api".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["target"], "proj/api");
        assert_eq!(event.event_name(), "error");
    }
}
