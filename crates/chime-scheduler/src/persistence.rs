//! SQLite-backed reminder store — events and tasks as the scanner sees them.
//!
//! Every instant is written in the canonical `…mmmZ` form produced by the
//! normalizer, so string comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chime_core::error::{ChimeError, Result};
use chime_core::time::{self, Instant, format_instant};
use chime_core::traits::ItemSource;
use chime_core::types::{ItemDetails, ItemKey, ItemKind, OwnerId, ReminderItem};
use rusqlite::{Connection, OptionalExtension, params};

const EVENT_COLUMNS: &str =
    "id, owner_id, title, description, start_instant, end_instant, color, lead_minutes";
const TASK_COLUMNS: &str =
    "id, owner_id, title, description, due_instant, is_completed, color, lead_minutes";

/// Fields for a new event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub owner_id: OwnerId,
    pub title: String,
    pub description: Option<String>,
    pub start_instant: Instant,
    pub end_instant: Instant,
    pub color: Option<String>,
    /// User-supplied lead time; overrides estimation.
    pub lead_minutes: Option<u32>,
}

/// Fields for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: OwnerId,
    pub title: String,
    pub description: Option<String>,
    pub due_instant: Option<Instant>,
    pub is_completed: bool,
    pub color: Option<String>,
}

/// Partial event update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_instant: Option<Instant>,
    pub end_instant: Option<Instant>,
    pub color: Option<String>,
    pub lead_minutes: Option<u32>,
}

/// Partial task update; `due_instant: Some(None)` clears the due date.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_instant: Option<Option<Instant>>,
    pub is_completed: Option<bool>,
    pub color: Option<String>,
}

/// Result of an update, with what the tracker needs to know.
#[derive(Debug, Clone)]
pub struct ItemChange {
    pub item: ReminderItem,
    /// The due instant moved.
    pub rescheduled: bool,
    /// The item stopped being eligible (task completed).
    pub deactivated: bool,
}

/// SQLite-backed store; cheap to clone, all clones share one connection.
#[derive(Clone)]
pub struct ReminderDb {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> ChimeError {
    ChimeError::Database(e.to_string())
}

fn table(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Event => "events",
        ItemKind::Task => "tasks",
    }
}

fn clean_text(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn require_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ChimeError::Validation("title must not be empty".into()));
    }
    Ok(title.to_string())
}

fn check_event_span(start: &Instant, end: &Instant) -> Result<()> {
    if end < start {
        return Err(ChimeError::Validation(format!(
            "end_time {} is before start_time {}",
            format_instant(end),
            format_instant(start)
        )));
    }
    Ok(())
}

struct EventRow {
    id: i64,
    owner_id: OwnerId,
    title: String,
    description: Option<String>,
    start_instant: String,
    end_instant: String,
    color: String,
    lead_minutes: Option<u32>,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            start_instant: row.get(4)?,
            end_instant: row.get(5)?,
            color: row.get(6)?,
            lead_minutes: row.get(7)?,
        })
    }

    fn into_item(self, now: Instant) -> Result<ReminderItem> {
        let start = time::normalize(&self.start_instant)
            .map_err(|e| ChimeError::ItemFetch(format!("event #{}: {e}", self.id)))?;
        let end = time::normalize(&self.end_instant)
            .map_err(|e| ChimeError::ItemFetch(format!("event #{}: {e}", self.id)))?;
        Ok(ReminderItem {
            id: self.id,
            kind: ItemKind::Event,
            owner_id: self.owner_id,
            title: self.title,
            description: self.description,
            due_instant: Some(start),
            lead_minutes: self.lead_minutes,
            active: start >= now,
            details: ItemDetails::Event {
                end_instant: Some(end),
                color: self.color,
            },
        })
    }
}

struct TaskRow {
    id: i64,
    owner_id: OwnerId,
    title: String,
    description: Option<String>,
    due_instant: Option<String>,
    is_completed: bool,
    color: String,
    lead_minutes: Option<u32>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            due_instant: row.get(4)?,
            is_completed: row.get(5)?,
            color: row.get(6)?,
            lead_minutes: row.get(7)?,
        })
    }

    fn into_item(self) -> Result<ReminderItem> {
        let due = time::normalize_optional(self.due_instant.as_deref())
            .map_err(|e| ChimeError::ItemFetch(format!("task #{}: {e}", self.id)))?;
        Ok(ReminderItem {
            id: self.id,
            kind: ItemKind::Task,
            owner_id: self.owner_id,
            title: self.title,
            description: self.description,
            due_instant: due,
            lead_minutes: self.lead_minutes,
            active: !self.is_completed,
            details: ItemDetails::Task {
                is_completed: self.is_completed,
                color: self.color,
            },
        })
    }
}

impl ReminderDb {
    /// Open or create the reminder database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        // WAL for concurrent readers; harmless to fail on :memory:
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::with_connection(conn)
    }

    /// Fresh in-memory database (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ChimeError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                start_instant TEXT NOT NULL,     -- canonical UTC, due instant
                end_instant TEXT NOT NULL,
                color TEXT NOT NULL DEFAULT 'blue',
                lead_minutes INTEGER,            -- user override or estimate
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_instant);
            CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                due_instant TEXT,                -- NULL: never reminds
                is_completed INTEGER NOT NULL DEFAULT 0,
                color TEXT NOT NULL DEFAULT 'green',
                lead_minutes INTEGER,            -- written once by the estimator
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due_instant);
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);
         ",
            )
            .map_err(|e| ChimeError::Database(format!("Migration: {e}")))
    }

    // ─── Events ───────────────────────────────────────────────

    pub fn insert_event(&self, new: &NewEvent) -> Result<ReminderItem> {
        let title = require_title(&new.title)?;
        check_event_span(&new.start_instant, &new.end_instant)?;
        let color = clean_text(new.color.clone())
            .unwrap_or_else(|| ItemKind::Event.default_color().into());
        let stamp = format_instant(&time::now());

        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO events
                 (owner_id, title, description, start_instant, end_instant, color,
                  lead_minutes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.owner_id,
                    title,
                    clean_text(new.description.clone()),
                    format_instant(&new.start_instant),
                    format_instant(&new.end_instant),
                    color,
                    new.lead_minutes,
                    stamp,
                ],
            )
            .map_err(db_err)?;
            conn.last_insert_rowid()
        };
        tracing::debug!("📅 Event #{id} stored for owner {}", new.owner_id);
        self.require_item(ItemKey::event(id))
    }

    pub fn update_event(
        &self,
        id: i64,
        owner_id: OwnerId,
        patch: &EventPatch,
    ) -> Result<ItemChange> {
        let key = ItemKey::event(id);
        let current = self.owned_item(key, owner_id)?;
        let (old_start, old_end, old_color) = match (&current.due_instant, &current.details) {
            (Some(start), ItemDetails::Event { end_instant, color }) => {
                (*start, end_instant.unwrap_or(*start), color.clone())
            }
            _ => return Err(ChimeError::Database(format!("{key} has no start instant"))),
        };

        let title = match &patch.title {
            Some(t) => require_title(t)?,
            None => current.title.clone(),
        };
        let start = patch.start_instant.unwrap_or(old_start);
        let end = patch.end_instant.unwrap_or(old_end);
        check_event_span(&start, &end)?;
        let description = match &patch.description {
            Some(d) => clean_text(Some(d.clone())),
            None => current.description.clone(),
        };
        let color = clean_text(patch.color.clone()).unwrap_or(old_color);
        let lead = patch.lead_minutes.or(current.lead_minutes);

        self.lock()?
            .execute(
                "UPDATE events SET title = ?1, description = ?2, start_instant = ?3,
                 end_instant = ?4, color = ?5, lead_minutes = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    title,
                    description,
                    format_instant(&start),
                    format_instant(&end),
                    color,
                    lead,
                    format_instant(&time::now()),
                    id,
                ],
            )
            .map_err(db_err)?;

        Ok(ItemChange {
            item: self.require_item(key)?,
            rescheduled: start != old_start,
            deactivated: false,
        })
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub fn insert_task(&self, new: &NewTask) -> Result<ReminderItem> {
        let title = require_title(&new.title)?;
        let color = clean_text(new.color.clone())
            .unwrap_or_else(|| ItemKind::Task.default_color().into());
        let stamp = format_instant(&time::now());

        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO tasks
                 (owner_id, title, description, due_instant, is_completed, color,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    new.owner_id,
                    title,
                    clean_text(new.description.clone()),
                    new.due_instant.as_ref().map(format_instant),
                    new.is_completed,
                    color,
                    stamp,
                ],
            )
            .map_err(db_err)?;
            conn.last_insert_rowid()
        };
        tracing::debug!("📝 Task #{id} stored for owner {}", new.owner_id);
        self.require_item(ItemKey::task(id))
    }

    pub fn update_task(&self, id: i64, owner_id: OwnerId, patch: &TaskPatch) -> Result<ItemChange> {
        let key = ItemKey::task(id);
        let current = self.owned_item(key, owner_id)?;
        let (was_completed, old_color) = match &current.details {
            ItemDetails::Task { is_completed, color } => (*is_completed, color.clone()),
            ItemDetails::Event { .. } => {
                return Err(ChimeError::Database(format!("{key} decoded as an event")));
            }
        };

        let title = match &patch.title {
            Some(t) => require_title(t)?,
            None => current.title.clone(),
        };
        let description = match &patch.description {
            Some(d) => clean_text(Some(d.clone())),
            None => current.description.clone(),
        };
        let due = patch.due_instant.unwrap_or(current.due_instant);
        let completed = patch.is_completed.unwrap_or(was_completed);
        let color = clean_text(patch.color.clone()).unwrap_or(old_color);

        self.lock()?
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, due_instant = ?3, is_completed = ?4,
                 color = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    title,
                    description,
                    due.as_ref().map(format_instant),
                    completed,
                    color,
                    format_instant(&time::now()),
                    id,
                ],
            )
            .map_err(db_err)?;

        Ok(ItemChange {
            item: self.require_item(key)?,
            rescheduled: due != current.due_instant,
            deactivated: completed && !was_completed,
        })
    }

    // ─── Shared ───────────────────────────────────────────────

    /// Delete an item owned by `owner_id`.
    pub fn delete_item(&self, key: ItemKey, owner_id: OwnerId) -> Result<()> {
        let deleted = self
            .lock()?
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1 AND owner_id = ?2", table(key.kind)),
                params![key.id, owner_id],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(ChimeError::NotFound(key.to_string()));
        }
        Ok(())
    }

    pub fn get_item(&self, key: ItemKey) -> Result<Option<ReminderItem>> {
        let now = time::now();
        let conn = self.lock()?;
        match key.kind {
            ItemKind::Event => conn
                .query_row(
                    &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                    params![key.id],
                    EventRow::from_row,
                )
                .optional()
                .map_err(db_err)?
                .map(|row| row.into_item(now))
                .transpose(),
            ItemKind::Task => conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![key.id],
                    TaskRow::from_row,
                )
                .optional()
                .map_err(db_err)?
                .map(TaskRow::into_item)
                .transpose(),
        }
    }

    fn require_item(&self, key: ItemKey) -> Result<ReminderItem> {
        self.get_item(key)?
            .ok_or_else(|| ChimeError::NotFound(key.to_string()))
    }

    /// Fetch an item, treating someone else's item as missing.
    fn owned_item(&self, key: ItemKey, owner_id: OwnerId) -> Result<ReminderItem> {
        match self.get_item(key)? {
            Some(item) if item.owner_id == owner_id => Ok(item),
            _ => Err(ChimeError::NotFound(key.to_string())),
        }
    }

    /// All items of one owner, events first, each ordered by due instant.
    pub fn list_items_for_owner(&self, owner_id: OwnerId) -> Result<Vec<ReminderItem>> {
        let now = time::now();
        let conn = self.lock()?;
        let mut items = Vec::new();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE owner_id = ?1 ORDER BY start_instant"
            ))
            .map_err(db_err)?;
        for row in stmt.query_map(params![owner_id], EventRow::from_row).map_err(db_err)? {
            items.push(row.map_err(db_err)?.into_item(now)?);
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY due_instant"
            ))
            .map_err(db_err)?;
        for row in stmt.query_map(params![owner_id], TaskRow::from_row).map_err(db_err)? {
            items.push(row.map_err(db_err)?.into_item()?);
        }

        Ok(items)
    }

    /// Scanner query: upcoming events and open tasks with a due instant
    /// no older than `now - lookback`. Undecodable rows come back as `Err`.
    pub fn list_active(
        &self,
        now: Instant,
        lookback: chrono::Duration,
    ) -> Result<Vec<Result<ReminderItem>>> {
        let now_s = format_instant(&now);
        let cutoff = format_instant(&(now - lookback));
        let conn = self.lock()?;
        let mut out = Vec::new();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE start_instant >= ?1 AND start_instant >= ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now_s, cutoff], EventRow::from_row)
            .map_err(db_err)?;
        for row in rows {
            out.push(
                row.map_err(|e| ChimeError::ItemFetch(format!("event row: {e}")))
                    .and_then(|r| r.into_item(now)),
            );
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE is_completed = 0 AND due_instant IS NOT NULL AND due_instant >= ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![cutoff], TaskRow::from_row)
            .map_err(db_err)?;
        for row in rows {
            out.push(
                row.map_err(|e| ChimeError::ItemFetch(format!("task row: {e}")))
                    .and_then(TaskRow::into_item),
            );
        }

        Ok(out)
    }

    /// Write a lead time only if none is stored yet. Returns whether it was written.
    pub fn set_lead_minutes_if_absent(&self, key: ItemKey, minutes: u32) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                &format!(
                    "UPDATE {} SET lead_minutes = ?1, updated_at = ?2
                     WHERE id = ?3 AND lead_minutes IS NULL",
                    table(key.kind)
                ),
                params![minutes, format_instant(&time::now()), key.id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Due instant of an item still eligible to fire at `now`.
    pub fn current_due_instant(&self, key: ItemKey, now: Instant) -> Result<Option<Instant>> {
        Ok(self
            .get_item(key)?
            .filter(|item| match item.kind {
                ItemKind::Event => item.due_instant.is_some_and(|due| due >= now),
                ItemKind::Task => item.active,
            })
            .and_then(|item| item.due_instant))
    }

    /// Raw write used by tests to simulate rows written by older/foreign code.
    #[cfg(test)]
    fn execute_raw(&self, sql: &str) -> Result<usize> {
        self.lock()?.execute(sql, []).map_err(db_err)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChimeError::ItemFetch(format!("store task failed: {e}")))?
}

#[async_trait]
impl ItemSource for ReminderDb {
    async fn list_active_items(
        &self,
        now: Instant,
        lookback: chrono::Duration,
    ) -> Result<Vec<Result<ReminderItem>>> {
        let db = self.clone();
        blocking(move || db.list_active(now, lookback)).await
    }

    async fn persist_lead_minutes(&self, key: ItemKey, minutes: u32) -> Result<()> {
        let db = self.clone();
        let written = blocking(move || db.set_lead_minutes_if_absent(key, minutes)).await?;
        if !written {
            tracing::debug!("{key} already has a lead time, keeping it");
        }
        Ok(())
    }

    async fn due_instant(&self, key: ItemKey, now: Instant) -> Result<Option<Instant>> {
        let db = self.clone();
        blocking(move || db.current_due_instant(key, now)).await
    }
}
