//! Local domain entities and their sync bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use cadence_common::{EntityId, Error, RecordId, RecordType, Result};

/// How an activity is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Sessions record a count of repetitions.
    Count,
    /// Sessions record a duration in seconds.
    Duration,
    /// Sessions are a simple done/not-done check.
    Check,
}

impl ActivityKind {
    /// Stable string form used in records and the SQLite schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Count => "count",
            ActivityKind::Duration => "duration",
            ActivityKind::Check => "check",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(ActivityKind::Count),
            "duration" => Ok(ActivityKind::Duration),
            "check" => Ok(ActivityKind::Check),
            other => Err(Error::InvalidInput(format!("Unknown activity kind: {}", other))),
        }
    }
}

/// Sync bookkeeping carried by every local entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Remote identifier, set once the record exists on the remote store.
    pub remote_ref: Option<RecordId>,
    /// Server revision of the record as last observed by this device.
    pub change_tag: Option<String>,
    /// Local changes not yet confirmed by the remote store.
    pub dirty: bool,
    /// Time of the last local mutation.
    pub last_modified_at: DateTime<Utc>,
}

impl SyncMeta {
    /// Bookkeeping for an entity that has never been uploaded.
    pub fn new_local() -> Self {
        Self {
            remote_ref: None,
            change_tag: None,
            dirty: true,
            last_modified_at: Utc::now(),
        }
    }
}

/// A tracked habit. Parent of sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: EntityId,
    pub name: String,
    pub kind: ActivityKind,
    pub color: String,
    /// Soft-delete flag. Inactive activities still sync as a field update.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub sync: SyncMeta,
}

impl Activity {
    /// Create a new, not yet uploaded activity.
    pub fn new(name: impl Into<String>, kind: ActivityKind, color: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            kind,
            color: color.into(),
            is_active: true,
            created_at: Utc::now(),
            sync: SyncMeta::new_local(),
        }
    }
}

/// One logged occurrence of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: EntityId,
    /// Local id of the parent activity. Non-owning.
    pub activity_id: EntityId,
    pub date: DateTime<Utc>,
    /// Count or seconds, depending on the activity kind.
    pub value: f64,
    pub completed: bool,
    pub sync: SyncMeta,
}

impl Session {
    /// Create a new, not yet uploaded session for an activity.
    pub fn new(activity_id: EntityId, date: DateTime<Utc>, value: f64, completed: bool) -> Self {
        Self {
            id: EntityId::new(),
            activity_id,
            date,
            value,
            completed,
            sync: SyncMeta::new_local(),
        }
    }
}

/// Any entity held by a local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalEntity {
    Activity(Activity),
    Session(Session),
}

impl LocalEntity {
    /// Stable local identifier.
    pub fn id(&self) -> EntityId {
        match self {
            LocalEntity::Activity(a) => a.id,
            LocalEntity::Session(s) => s.id,
        }
    }

    /// Record type this entity syncs as.
    pub fn kind(&self) -> RecordType {
        match self {
            LocalEntity::Activity(_) => RecordType::Activity,
            LocalEntity::Session(_) => RecordType::Session,
        }
    }

    /// Local id of the parent entity, for dependents.
    pub fn parent_id(&self) -> Option<EntityId> {
        match self {
            LocalEntity::Activity(_) => None,
            LocalEntity::Session(s) => Some(s.activity_id),
        }
    }

    pub fn sync(&self) -> &SyncMeta {
        match self {
            LocalEntity::Activity(a) => &a.sync,
            LocalEntity::Session(s) => &s.sync,
        }
    }

    pub fn sync_mut(&mut self) -> &mut SyncMeta {
        match self {
            LocalEntity::Activity(a) => &mut a.sync,
            LocalEntity::Session(s) => &mut s.sync,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.sync().dirty
    }

    pub fn remote_ref(&self) -> Option<&RecordId> {
        self.sync().remote_ref.as_ref()
    }
}

impl From<Activity> for LocalEntity {
    fn from(activity: Activity) -> Self {
        LocalEntity::Activity(activity)
    }
}

impl From<Session> for LocalEntity {
    fn from(session: Session) -> Self {
        LocalEntity::Session(session)
    }
}
