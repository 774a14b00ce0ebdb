//! SQLite-based task store.
//!
//! Tasks are stored as JSON documents keyed by path, with `parent_path` and
//! `status` lifted into columns and a `task_dependencies` table indexing the
//! dependency edges for dependent lookups.
//!
//! A transaction owns the connection guard for its lifetime and runs inside
//! `BEGIN IMMEDIATE`, so writers are serialized by both the guard and SQLite.
//! The guard rolls back whatever is still open before it releases the lock,
//! including when the owning future is cancelled mid-statement.

use super::{check_new_task, now_string, StorageMetrics, TaskStore, TaskTransaction};
use crate::task::{CreateTaskInput, StorageError, Task, UpdateTaskInput};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    path TEXT PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    parent_path TEXT,
    status TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_path);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_path TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (task_path, depends_on),
    FOREIGN KEY (task_path) REFERENCES tasks(path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON task_dependencies(depends_on);
"#;

const DB_FILE: &str = "tasks.db";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    closed: AtomicBool,
}

impl SqliteTaskStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        let db_path = data_dir.join(DB_FILE);

        tokio::fs::create_dir_all(&data_dir).await?;

        let open_path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&open_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StorageError>(conn)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))??;

        tracing::info!("Opened SQLite task store at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, StorageError> + Send + 'static,
    {
        self.ensure_open()?;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            rollback_if_open(&conn)?;
            f(&*conn)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }
}

/// Roll back a transaction left open on the connection by an abandoned unit.
fn rollback_if_open(conn: &Connection) -> Result<(), StorageError> {
    if !conn.is_autocommit() {
        tracing::warn!("Rolling back transaction left open on the connection");
        conn.execute_batch("ROLLBACK")?;
    }
    Ok(())
}

fn parse_task(data: &str) -> Result<Task, StorageError> {
    Ok(serde_json::from_str(data)?)
}

fn load_task(conn: &Connection, path: &str) -> Result<Option<Task>, StorageError> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM tasks WHERE path = ?1", params![path], |row| {
            row.get(0)
        })
        .optional()?;
    data.as_deref().map(parse_task).transpose()
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    param: Option<&str>,
) -> Result<Vec<Task>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match param {
        Some(param) => stmt
            .query_map(params![param], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?,
    };
    rows.iter().map(|data| parse_task(data)).collect()
}

fn load_children(conn: &Connection, parent_path: &str) -> Result<Vec<Task>, StorageError> {
    query_tasks(
        conn,
        "SELECT data FROM tasks WHERE parent_path = ?1 ORDER BY path",
        Some(parent_path),
    )
}

fn load_dependents(conn: &Connection, path: &str) -> Result<Vec<Task>, StorageError> {
    query_tasks(
        conn,
        "SELECT t.data FROM tasks t
         JOIN task_dependencies d ON d.task_path = t.path
         WHERE d.depends_on = ?1
         ORDER BY t.path",
        Some(path),
    )
}

fn write_task(conn: &Connection, task: &Task) -> Result<(), StorageError> {
    let data = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO tasks (path, id, parent_path, status, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(path) DO UPDATE SET
            parent_path = excluded.parent_path,
            status = excluded.status,
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![
            task.path,
            task.id.to_string(),
            task.parent_path,
            task.status.as_str(),
            data,
            task.created_at,
            task.updated_at,
        ],
    )?;

    conn.execute(
        "DELETE FROM task_dependencies WHERE task_path = ?1",
        params![task.path],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO task_dependencies (task_path, depends_on, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, dep) in task.dependencies.iter().enumerate() {
        stmt.execute(params![task.path, dep, position as i64])?;
    }
    Ok(())
}

fn task_exists(conn: &Connection, path: &str) -> bool {
    conn.query_row("SELECT 1 FROM tasks WHERE path = ?1", params![path], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
        .unwrap_or(false)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, StorageError> {
        self.ensure_open()?;
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let mut tx = SqliteTransaction {
            conn: Some(TxConnection(guard)),
            touched: Vec::new(),
        };
        tx.run(|conn| {
            rollback_if_open(conn)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        })
        .await?;
        Ok(Box::new(tx))
    }

    async fn get_task(&self, path: &str) -> Result<Option<Task>, StorageError> {
        let path = path.to_string();
        self.with_conn(move |conn| load_task(conn, &path)).await
    }

    async fn get_children(&self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
        let parent_path = parent_path.to_string();
        self.with_conn(move |conn| load_children(conn, &parent_path))
            .await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.with_conn(|conn| query_tasks(conn, "SELECT data FROM tasks ORDER BY path", None))
            .await
    }

    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, StorageError> {
        self.with_conn(move |conn| {
            check_new_task(&input, |path| task_exists(conn, path))?;
            let task = Task::from_input(input, &now_string());
            write_task(conn, &task)?;
            Ok(task)
        })
        .await
    }

    async fn get_metrics(&self) -> Result<StorageMetrics, StorageError> {
        let wal_path = PathBuf::from(format!("{}-wal", self.db_path.display()));
        self.with_conn(move |conn| {
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let wal_size = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
            let page_size = page_size.max(0) as u64;
            let page_count = page_count.max(0) as u64;
            Ok(StorageMetrics {
                total_size: page_size * page_count,
                page_size,
                page_count,
                wal_size,
            })
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await?;
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("Closed SQLite task store at {}", self.db_path.display());
        Ok(())
    }
}

/// Connection lock held by a transaction.
///
/// Dropping it while a transaction is open rolls that transaction back before
/// the lock is released. When a caller is cancelled while a statement runs on
/// the blocking pool, this is the only owner left.
struct TxConnection(OwnedMutexGuard<Connection>);

impl Deref for TxConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl Drop for TxConnection {
    fn drop(&mut self) {
        if let Err(e) = rollback_if_open(&self.0) {
            tracing::error!("Failed to roll back abandoned transaction: {}", e);
        }
    }
}

pub struct SqliteTransaction {
    conn: Option<TxConnection>,
    touched: Vec<String>,
}

impl SqliteTransaction {
    /// Move the guard onto the blocking pool, run `f`, and take it back.
    async fn run<R, F>(&mut self, f: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, StorageError> + Send + 'static,
    {
        let conn = self.conn.take().ok_or(StorageError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&*conn);
            (conn, result)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?;
        self.conn = Some(conn);
        result
    }

    async fn finish(&mut self, statement: &'static str) -> Result<(), StorageError> {
        let result = self
            .run(move |conn| {
                conn.execute_batch(statement)?;
                Ok(())
            })
            .await;
        // Release now; a unit still open after a failed statement is left to `Drop`.
        if self.conn.as_ref().is_some_and(|conn| conn.is_autocommit()) {
            self.conn.take();
        }
        result
    }
}

#[async_trait]
impl TaskTransaction for SqliteTransaction {
    async fn get_task(&mut self, path: &str) -> Result<Option<Task>, StorageError> {
        let path = path.to_string();
        self.run(move |conn| load_task(conn, &path)).await
    }

    async fn get_children(&mut self, parent_path: &str) -> Result<Vec<Task>, StorageError> {
        let parent_path = parent_path.to_string();
        self.run(move |conn| load_children(conn, &parent_path)).await
    }

    async fn get_dependents(&mut self, path: &str) -> Result<Vec<Task>, StorageError> {
        let path = path.to_string();
        self.run(move |conn| load_dependents(conn, &path)).await
    }

    async fn update_task(
        &mut self,
        path: &str,
        updates: &UpdateTaskInput,
    ) -> Result<Task, StorageError> {
        let owned_path = path.to_string();
        let updates = updates.clone();
        let task = self
            .run(move |conn| {
                let mut task = load_task(conn, &owned_path)?
                    .ok_or_else(|| StorageError::NotFound(owned_path.clone()))?;
                task.apply(&updates, &now_string());
                write_task(conn, &task)?;
                Ok(task)
            })
            .await?;
        if !self.touched.iter().any(|p| p == path) {
            self.touched.push(path.to_string());
        }
        Ok(task)
    }

    fn touched_paths(&self) -> Vec<String> {
        self.touched.clone()
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_autocommit() {
            return;
        }
        tracing::debug!("Rolling back dropped SQLite transaction");
        // ROLLBACK blocks; run it on the blocking pool when a runtime is around.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(conn));
            }
            Err(_) => drop(conn),
        }
    }
}
