//! SQLite-backed local store.
//!
//! Persists activities and sessions, including their sync bookkeeping, in a
//! single database file.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};

use cadence_common::{EntityId, Error, RecordId, RecordType, Result};

use crate::local::{LocalStore, MutationCallback, MutationKind, Subscribers, SubscriptionId, WriteOrigin};
use crate::model::{Activity, LocalEntity, Session, SyncMeta};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    color TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    remote_ref TEXT,
    change_tag TEXT,
    dirty INTEGER NOT NULL,
    last_modified_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    activity_id TEXT NOT NULL,
    date TEXT NOT NULL,
    value REAL NOT NULL,
    completed INTEGER NOT NULL,
    remote_ref TEXT,
    change_tag TEXT,
    dirty INTEGER NOT NULL,
    last_modified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activities_dirty ON activities(dirty);
CREATE INDEX IF NOT EXISTS idx_activities_remote_ref ON activities(remote_ref);
CREATE INDEX IF NOT EXISTS idx_sessions_dirty ON sessions(dirty);
CREATE INDEX IF NOT EXISTS idx_sessions_remote_ref ON sessions(remote_ref);
"#;

const ACTIVITY_COLUMNS: &str =
    "id, name, kind, color, is_active, created_at, remote_ref, change_tag, dirty, last_modified_at";
const SESSION_COLUMNS: &str =
    "id, activity_id, date, value, completed, remote_ref, change_tag, dirty, last_modified_at";

fn db_err(err: rusqlite::Error) -> Error {
    Error::Database(err.to_string())
}

/// Fixed-width form so text ordering matches time ordering.
fn fmt_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("Invalid timestamp '{}': {}", value, e)))
}

/// Columns shared by both tables, read as raw text before validation.
struct RawSync {
    remote_ref: Option<String>,
    change_tag: Option<String>,
    dirty: bool,
    last_modified_at: String,
}

impl RawSync {
    fn parse(self) -> Result<SyncMeta> {
        Ok(SyncMeta {
            remote_ref: self.remote_ref.as_deref().map(RecordId::parse).transpose()?,
            change_tag: self.change_tag,
            dirty: self.dirty,
            last_modified_at: parse_time(&self.last_modified_at)?,
        })
    }
}

struct RawActivity {
    id: String,
    name: String,
    kind: String,
    color: String,
    is_active: bool,
    created_at: String,
    sync: RawSync,
}

impl RawActivity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            color: row.get(3)?,
            is_active: row.get(4)?,
            created_at: row.get(5)?,
            sync: RawSync {
                remote_ref: row.get(6)?,
                change_tag: row.get(7)?,
                dirty: row.get(8)?,
                last_modified_at: row.get(9)?,
            },
        })
    }

    fn parse(self) -> Result<LocalEntity> {
        Ok(LocalEntity::Activity(Activity {
            id: self.id.parse()?,
            name: self.name,
            kind: self.kind.parse()?,
            color: self.color,
            is_active: self.is_active,
            created_at: parse_time(&self.created_at)?,
            sync: self.sync.parse()?,
        }))
    }
}

struct RawSession {
    id: String,
    activity_id: String,
    date: String,
    value: f64,
    completed: bool,
    sync: RawSync,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            activity_id: row.get(1)?,
            date: row.get(2)?,
            value: row.get(3)?,
            completed: row.get(4)?,
            sync: RawSync {
                remote_ref: row.get(5)?,
                change_tag: row.get(6)?,
                dirty: row.get(7)?,
                last_modified_at: row.get(8)?,
            },
        })
    }

    fn parse(self) -> Result<LocalEntity> {
        Ok(LocalEntity::Session(Session {
            id: self.id.parse()?,
            activity_id: self.activity_id.parse()?,
            date: parse_time(&self.date)?,
            value: self.value,
            completed: self.completed,
            sync: self.sync.parse()?,
        }))
    }
}

/// Local store backed by SQLite.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
    subscribers: Subscribers,
}

impl SqliteLocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
            subscribers: Subscribers::new(),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            subscribers: Subscribers::new(),
        })
    }

    fn query_activities(&self, filter: &str, param: Option<&str>) -> Result<Vec<LocalEntity>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM activities {}", ACTIVITY_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = match param {
            Some(p) => stmt.query_map([p], RawActivity::from_row),
            None => stmt.query_map([], RawActivity::from_row),
        }
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
        rows.into_iter().map(RawActivity::parse).collect()
    }

    fn query_sessions(&self, filter: &str, param: Option<&str>) -> Result<Vec<LocalEntity>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sessions {}", SESSION_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = match param {
            Some(p) => stmt.query_map([p], RawSession::from_row),
            None => stmt.query_map([], RawSession::from_row),
        }
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
        rows.into_iter().map(RawSession::parse).collect()
    }

    fn query(&self, kind: RecordType, filter: &str, param: Option<&str>) -> Result<Vec<LocalEntity>> {
        match kind {
            RecordType::Activity => self.query_activities(filter, param),
            RecordType::Session => self.query_sessions(filter, param),
        }
    }

    fn write(conn: &Connection, entity: &LocalEntity) -> rusqlite::Result<usize> {
        let sync = entity.sync();
        let remote_ref = sync.remote_ref.as_ref().map(|r| r.to_string());
        let modified = fmt_time(&sync.last_modified_at);
        match entity {
            LocalEntity::Activity(a) => conn.execute(
                r#"
                INSERT OR REPLACE INTO activities
                (id, name, kind, color, is_active, created_at, remote_ref, change_tag, dirty, last_modified_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    a.id.to_string(),
                    a.name,
                    a.kind.as_str(),
                    a.color,
                    a.is_active,
                    fmt_time(&a.created_at),
                    remote_ref,
                    sync.change_tag,
                    sync.dirty,
                    modified,
                ],
            ),
            LocalEntity::Session(s) => conn.execute(
                r#"
                INSERT OR REPLACE INTO sessions
                (id, activity_id, date, value, completed, remote_ref, change_tag, dirty, last_modified_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    s.id.to_string(),
                    s.activity_id.to_string(),
                    fmt_time(&s.date),
                    s.value,
                    s.completed,
                    remote_ref,
                    sync.change_tag,
                    sync.dirty,
                    modified,
                ],
            ),
        }
    }
}

impl LocalStore for SqliteLocalStore {
    fn fetch_dirty(&self, kind: RecordType) -> Result<Vec<LocalEntity>> {
        self.query(kind, "WHERE dirty = 1 ORDER BY last_modified_at", None)
    }

    fn all(&self, kind: RecordType) -> Result<Vec<LocalEntity>> {
        self.query(kind, "ORDER BY id", None)
    }

    fn get(&self, id: &EntityId) -> Result<Option<LocalEntity>> {
        let key = id.to_string();
        for kind in RecordType::ALL {
            if let Some(entity) = self.query(kind, "WHERE id = ?1", Some(&key))?.pop() {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    fn find_by_remote_ref(&self, record_id: &RecordId) -> Result<Option<LocalEntity>> {
        let key = record_id.to_string();
        for kind in RecordType::ALL {
            if let Some(entity) = self.query(kind, "WHERE remote_ref = ?1", Some(&key))?.pop() {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    fn upsert(&self, entity: &LocalEntity, origin: WriteOrigin) -> Result<()> {
        let change = {
            let conn = self.conn.lock();
            let table = match entity.kind() {
                RecordType::Activity => "activities",
                RecordType::Session => "sessions",
            };
            let exists = conn
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE id = ?1", table),
                    [entity.id().to_string()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            Self::write(&conn, entity).map_err(db_err)?;
            if exists {
                MutationKind::Updated
            } else {
                MutationKind::Inserted
            }
        };
        debug!("Stored {} {} ({:?})", entity.kind(), entity.id(), change);
        self.subscribers
            .notify_one(origin, entity.kind(), entity.id(), change);
        Ok(())
    }

    fn hard_delete(&self, id: &EntityId, origin: WriteOrigin) -> Result<bool> {
        let removed = {
            let conn = self.conn.lock();
            let key = id.to_string();
            let mut removed = None;
            for (kind, table) in [(RecordType::Activity, "activities"), (RecordType::Session, "sessions")] {
                let count = conn
                    .execute(&format!("DELETE FROM {} WHERE id = ?1", table), [&key])
                    .map_err(db_err)?;
                if count > 0 {
                    removed = Some(kind);
                    break;
                }
            }
            removed
        };
        match removed {
            Some(kind) => {
                self.subscribers
                    .notify_one(origin, kind, *id, MutationKind::Deleted);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe_to_mutations(&self, callback: MutationCallback) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id)
    }
}
