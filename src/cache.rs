//! In-memory projection of committed tasks.
//!
//! Last writer wins per path. Entries are only written after their backing
//! mutation has been committed. Read-through fills carry the write generation
//! observed before the store read and are dropped if a write landed since.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::task::Task;

#[derive(Default)]
struct Entries {
    tasks: HashMap<String, Task>,
    generation: u64,
}

#[derive(Default)]
pub struct TaskCache {
    entries: RwLock<Entries>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Task> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .get(path)
            .cloned()
    }

    /// Current write generation; pass it to [`TaskCache::fill`].
    pub fn generation(&self) -> u64 {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Record a committed write.
    pub fn insert(&self, task: &Task) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.generation += 1;
        entries.tasks.insert(task.path.clone(), task.clone());
    }

    /// Populate from a store read started at `generation`.
    ///
    /// Returns `false` when a write or invalidation happened in the meantime;
    /// the snapshot may predate it and is not cached.
    pub fn fill(&self, task: &Task, generation: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.generation != generation {
            return false;
        }
        entries.tasks.insert(task.path.clone(), task.clone());
        true
    }

    pub fn invalidate(&self, path: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.generation += 1;
        entries.tasks.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
