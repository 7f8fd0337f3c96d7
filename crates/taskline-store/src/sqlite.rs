//! SQLite-backed work queue that survives restarts.
//!
//! The connection sits behind a mutex and every call runs on tokio's
//! blocking pool. A step commit is one transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use taskline_core::{
    Clock, CommitBatch, Result, StepCatalog, StepDescriptor, SystemClock, TasklineError,
    WorkItem, WorkItemReader, WorkItemWriter, WorkStatus,
};

use crate::settle::settle;

const ITEM_COLUMNS: &str = "id, step, payload, status, error, attempts, updated_at";

pub struct SqliteWorkStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteWorkStore {
    /// Open or create the queue database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(storage)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a step to the catalog, or return the existing one.
    pub async fn add_step(&self, name: &str) -> Result<StepDescriptor> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO steps (name, label) VALUES (?1, ?1)",
                params![name],
            )
            .map_err(storage)?;
            conn.query_row(
                "SELECT id, name, label FROM steps WHERE name = ?1",
                params![name],
                |row| {
                    Ok(StepDescriptor {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        label: row.get(2)?,
                    })
                },
            )
            .map_err(storage)
        })
        .await
    }

    /// Queue a new Ready item on `step`. Returns its id.
    pub async fn enqueue(&self, step: &str, payload: serde_json::Value) -> Result<String> {
        let step = step.to_string();
        let now = timestamp(self.clock.now());
        self.call(move |conn| {
            let known: Option<u32> = conn
                .query_row("SELECT id FROM steps WHERE name = ?1", params![step], |r| r.get(0))
                .optional()
                .map_err(storage)?;
            if known.is_none() {
                return Err(TasklineError::StepNotFound(step));
            }
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO work_items (id, step, payload, status, attempts, updated_at)
                 VALUES (?1, ?2, ?3, 'ready', 0, ?4)",
                params![id, step, payload.to_string(), now],
            )
            .map_err(storage)?;
            Ok(id)
        })
        .await
    }

    pub async fn item(&self, id: &str) -> Result<Option<WorkItem>> {
        let id = id.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1");
            let raw = conn
                .query_row(&sql, params![id], RawItem::from_row)
                .optional()
                .map_err(storage)?;
            raw.map(RawItem::into_item).transpose()
        })
        .await
    }

    /// Item counts per (step, status).
    pub async fn counts(&self) -> Result<Vec<(String, WorkStatus, u64)>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT step, status, COUNT(*) FROM work_items
                     GROUP BY step, status ORDER BY step, status",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })
                .map_err(storage)?;
            let mut counts = Vec::new();
            for row in rows {
                let (step, status, count) = row.map_err(storage)?;
                let status = status.parse().map_err(TasklineError::storage)?;
                counts.push((step, status, count.max(0) as u64));
            }
            Ok(counts)
        })
        .await
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| TasklineError::storage(format!("blocking task failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL
        );

        -- One row per work-item; `step` is the step it is queued for
        CREATE TABLE IF NOT EXISTS work_items (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            step TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready',
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_work_items_step_status
            ON work_items (step, status, updated_at);
        ",
    )
    .map_err(|e| TasklineError::storage(format!("migration: {e}")))
}

/// Fixed-width UTC text, so string order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn storage(e: rusqlite::Error) -> TasklineError {
    TasklineError::storage(e.to_string())
}

struct RawItem {
    id: String,
    step: String,
    payload: String,
    status: String,
    error: Option<String>,
    attempts: u32,
    updated_at: String,
}

impl RawItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            step: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            error: row.get(4)?,
            attempts: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_item(self) -> Result<WorkItem> {
        let payload = serde_json::from_str(&self.payload).map_err(|e| {
            TasklineError::storage(format!("work-item '{}' has a bad payload: {e}", self.id))
        })?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| {
                TasklineError::storage(format!("work-item '{}' has a bad timestamp: {e}", self.id))
            })?
            .with_timezone(&Utc);
        Ok(WorkItem {
            status: self.status.parse().map_err(TasklineError::storage)?,
            id: self.id,
            step: self.step,
            payload,
            error: self.error,
            attempts: self.attempts,
            updated_at,
        })
    }
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> std::result::Result<Vec<RawItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RawItem::from_row)?;
    rows.collect()
}

#[async_trait]
impl StepCatalog for SqliteWorkStore {
    async fn step_catalog(&self) -> Result<HashMap<String, StepDescriptor>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, label FROM steps")
                .map_err(storage)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StepDescriptor {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        label: row.get(2)?,
                    })
                })
                .map_err(storage)?;
            let mut catalog = HashMap::new();
            for step in rows {
                let step = step.map_err(storage)?;
                catalog.insert(step.name.clone(), step);
            }
            Ok(catalog)
        })
        .await
    }
}

#[async_trait]
impl WorkItemReader for SqliteWorkStore {
    async fn fetch_processable(&self, step: &StepDescriptor, limit: usize) -> Result<Vec<WorkItem>> {
        let name = step.name.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE step = ?1 AND status = 'ready'
                 ORDER BY seq LIMIT ?2"
            );
            let raw = query_items(conn, &sql, params![name, limit]).map_err(|e| {
                TasklineError::Fetch {
                    step: name.clone(),
                    message: e.to_string(),
                }
            })?;
            raw.into_iter().map(RawItem::into_item).collect()
        })
        .await
    }

    async fn fetch_retryable(
        &self,
        step: &StepDescriptor,
        limit: usize,
        since: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<WorkItem>> {
        let name = step.name.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let since = timestamp(since);
        self.call(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE step = ?1 AND status = 'error' AND updated_at < ?2 AND attempts < ?3
                 ORDER BY updated_at, seq LIMIT ?4"
            );
            let raw = query_items(conn, &sql, params![name, since, max_attempts, limit])
                .map_err(|e| TasklineError::Fetch {
                    step: name.clone(),
                    message: e.to_string(),
                })?;
            raw.into_iter().map(RawItem::into_item).collect()
        })
        .await
    }
}

#[async_trait]
impl WorkItemWriter for SqliteWorkStore {
    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let now = self.clock.now();
        self.call(move |conn| {
            let step = batch.step.name.clone();
            let failed = |message: String| TasklineError::Commit {
                step: step.clone(),
                message,
            };

            let tx = conn.transaction().map_err(|e| failed(e.to_string()))?;
            for item in &batch.items {
                let row = settle(&batch, item, now);
                let changed = tx
                    .execute(
                        "UPDATE work_items
                         SET step = ?2, payload = ?3, status = ?4, error = ?5,
                             attempts = ?6, updated_at = ?7
                         WHERE id = ?1",
                        params![
                            row.id,
                            row.step,
                            row.payload.to_string(),
                            row.status.as_str(),
                            row.error,
                            row.attempts,
                            timestamp(row.updated_at),
                        ],
                    )
                    .map_err(|e| failed(e.to_string()))?;
                if changed == 0 {
                    // Dropping the transaction rolls the batch back
                    return Err(failed(format!("unknown work-item '{}'", item.id)));
                }
            }
            tx.commit().map_err(|e| failed(e.to_string()))?;

            tracing::debug!(
                "💾 Committed {} item(s) of step '{}' ({} failed)",
                batch.items.len(),
                batch.step.name,
                batch.error_count()
            );
            Ok(())
        })
        .await
    }
}
