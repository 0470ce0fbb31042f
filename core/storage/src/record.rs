//! Remote record representation and the entity/record field mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use cadence_common::{EntityId, Error, RecordId, RecordType, Result};

use crate::model::{Activity, ActivityKind, LocalEntity, Session, SyncMeta};

/// Field names shared by every record type.
pub mod fields {
    /// Local identifier of the entity the record mirrors.
    pub const ENTITY_ID: &str = "entityId";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const COLOR: &str = "color";
    pub const IS_ACTIVE: &str = "isActive";
    pub const CREATED_AT: &str = "createdAt";
    /// Local id of a session's parent activity.
    pub const ACTIVITY_ID: &str = "activityId";
    /// Record name of a session's parent activity.
    pub const ACTIVITY: &str = "activity";
    pub const DATE: &str = "date";
    pub const VALUE: &str = "value";
    pub const COMPLETED: &str = "completed";
}

/// A typed value stored in a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    /// Name of another record in the same zone.
    Reference(String),
}

/// A record as exchanged with the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_type: RecordType,
    pub record_id: RecordId,
    pub fields: BTreeMap<String, FieldValue>,
    /// Server revision. `None` for records that were never saved.
    pub change_tag: Option<String>,
    /// Server modification time, set by the remote store on save.
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    /// Create an empty record.
    pub fn new(record_type: RecordType, record_id: RecordId) -> Self {
        Self {
            record_type,
            record_id,
            fields: BTreeMap::new(),
            change_tag: None,
            modified_at: None,
        }
    }

    /// Set a field, builder style.
    pub fn with_field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    fn field(&self, key: &str) -> Result<&FieldValue> {
        self.fields.get(key).ok_or_else(|| {
            Error::InvalidRecord(format!("{} is missing field '{}'", self.record_id, key))
        })
    }

    fn mismatch(&self, key: &str, expected: &str) -> Error {
        Error::InvalidRecord(format!(
            "{} field '{}' is not a {}",
            self.record_id, key, expected
        ))
    }

    pub fn string(&self, key: &str) -> Result<&str> {
        match self.field(key)? {
            FieldValue::String(s) => Ok(s),
            _ => Err(self.mismatch(key, "string")),
        }
    }

    pub fn double(&self, key: &str) -> Result<f64> {
        match self.field(key)? {
            FieldValue::Double(v) => Ok(*v),
            FieldValue::Int(v) => Ok(*v as f64),
            _ => Err(self.mismatch(key, "number")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        match self.field(key)? {
            FieldValue::Bool(b) => Ok(*b),
            FieldValue::Int(v) => Ok(*v != 0),
            _ => Err(self.mismatch(key, "bool")),
        }
    }

    pub fn date(&self, key: &str) -> Result<DateTime<Utc>> {
        match self.field(key)? {
            FieldValue::Date(d) => Ok(*d),
            _ => Err(self.mismatch(key, "date")),
        }
    }

    /// Domain identifier of the entity this record mirrors.
    ///
    /// # Errors
    /// - `InvalidRecord` when the field is missing or not a valid id
    pub fn entity_id(&self) -> Result<EntityId> {
        self.id_field(fields::ENTITY_ID)
    }

    fn id_field(&self, key: &str) -> Result<EntityId> {
        let raw = self.string(key)?;
        raw.parse::<EntityId>().map_err(|_| {
            Error::InvalidRecord(format!(
                "Record {} has invalid {} '{}'",
                self.record_id, key, raw
            ))
        })
    }

    /// Set a string field in place.
    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.fields
            .insert(key.to_string(), FieldValue::String(value.into()));
    }
}

impl LocalEntity {
    /// Build the record to upload for this entity.
    ///
    /// `parent_ref` is the parent activity's record id and is only used for
    /// sessions. The record carries the last observed change tag so the
    /// remote store can detect concurrent writes.
    pub fn to_record(&self, record_id: RecordId, parent_ref: Option<&RecordId>) -> RemoteRecord {
        let mut record = RemoteRecord::new(self.kind(), record_id)
            .with_field(fields::ENTITY_ID, FieldValue::String(self.id().to_string()));
        record.change_tag = self.sync().change_tag.clone();

        match self {
            LocalEntity::Activity(a) => record
                .with_field(fields::NAME, FieldValue::String(a.name.clone()))
                .with_field(fields::KIND, FieldValue::String(a.kind.as_str().to_string()))
                .with_field(fields::COLOR, FieldValue::String(a.color.clone()))
                .with_field(fields::IS_ACTIVE, FieldValue::Bool(a.is_active))
                .with_field(fields::CREATED_AT, FieldValue::Date(a.created_at)),
            LocalEntity::Session(s) => {
                let record = record
                    .with_field(
                        fields::ACTIVITY_ID,
                        FieldValue::String(s.activity_id.to_string()),
                    )
                    .with_field(fields::DATE, FieldValue::Date(s.date))
                    .with_field(fields::VALUE, FieldValue::Double(s.value))
                    .with_field(fields::COMPLETED, FieldValue::Bool(s.completed));
                match parent_ref {
                    Some(parent) => record
                        .with_field(fields::ACTIVITY, FieldValue::Reference(parent.name.clone())),
                    None => record,
                }
            }
        }
    }

    /// Materialize a clean local entity from a remote record.
    ///
    /// The result has `remote_ref` set to the record id and is not dirty.
    /// Records without a server modification time get the current time.
    ///
    /// # Errors
    /// - `InvalidRecord` when a required field is missing, has the wrong
    ///   type or holds an unparseable value
    pub fn from_record(record: &RemoteRecord) -> Result<Self> {
        let id = record.entity_id()?;
        let sync = SyncMeta {
            remote_ref: Some(record.record_id.clone()),
            change_tag: record.change_tag.clone(),
            dirty: false,
            last_modified_at: record.modified_at.unwrap_or_else(Utc::now),
        };

        let entity = match record.record_type {
            RecordType::Activity => LocalEntity::Activity(Activity {
                id,
                name: record.string(fields::NAME)?.to_string(),
                kind: record.string(fields::KIND)?.parse::<ActivityKind>().map_err(|_| {
                    Error::InvalidRecord(format!(
                        "Record {} has unknown activity kind",
                        record.record_id
                    ))
                })?,
                color: record.string(fields::COLOR)?.to_string(),
                is_active: record.bool(fields::IS_ACTIVE)?,
                created_at: record.date(fields::CREATED_AT)?,
                sync,
            }),
            RecordType::Session => LocalEntity::Session(Session {
                id,
                activity_id: record.id_field(fields::ACTIVITY_ID)?,
                date: record.date(fields::DATE)?,
                value: record.double(fields::VALUE)?,
                completed: record.bool(fields::COMPLETED)?,
                sync,
            }),
        };
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::ZoneId;

    fn zone() -> ZoneId {
        ZoneId::new("test").unwrap()
    }

    #[test]
    fn test_session_record_carries_parent_reference() {
        let activity = Activity::new("Run", ActivityKind::Duration, "#ff0000");
        let parent_ref = RecordId::new(zone(), "Activity-1").unwrap();
        let session = LocalEntity::from(Session::new(activity.id, Utc::now(), 1800.0, true));

        let record = session.to_record(RecordId::new(zone(), "Session-1").unwrap(), Some(&parent_ref));

        assert_eq!(record.record_type, RecordType::Session);
        assert_eq!(
            record.fields.get(fields::ACTIVITY),
            Some(&FieldValue::Reference("Activity-1".to_string()))
        );
        assert_eq!(record.string(fields::ACTIVITY_ID).unwrap(), activity.id.to_string());
    }

    #[test]
    fn test_from_record_is_clean_and_referenced() {
        let activity = Activity::new("Meditate", ActivityKind::Check, "#00ff00");
        let record_id = RecordId::new(zone(), "Activity-9").unwrap();
        let mut record = LocalEntity::from(activity.clone()).to_record(record_id.clone(), None);
        record.change_tag = Some("4".to_string());

        let entity = LocalEntity::from_record(&record).unwrap();

        assert_eq!(entity.id(), activity.id);
        assert!(!entity.is_dirty());
        assert_eq!(entity.remote_ref(), Some(&record_id));
        assert_eq!(entity.sync().change_tag.as_deref(), Some("4"));
        match entity {
            LocalEntity::Activity(a) => {
                assert_eq!(a.name, "Meditate");
                assert_eq!(a.kind, ActivityKind::Check);
            }
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_from_record_missing_field() {
        let record = RemoteRecord::new(RecordType::Activity, RecordId::new(zone(), "a").unwrap())
            .with_field(fields::ENTITY_ID, FieldValue::String(EntityId::new().to_string()));

        let err = LocalEntity::from_record(&record).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
    }

    #[test]
    fn test_unparseable_values_are_invalid_records() {
        let activity = LocalEntity::from(Activity::new("Draw", ActivityKind::Count, "#0000ff"));
        let record_id = RecordId::new(zone(), "Activity-3").unwrap();

        let mut bad_id = activity.to_record(record_id.clone(), None);
        bad_id.set_string(fields::ENTITY_ID, "not-a-uuid");
        assert!(matches!(bad_id.entity_id(), Err(Error::InvalidRecord(_))));
        assert!(matches!(
            LocalEntity::from_record(&bad_id),
            Err(Error::InvalidRecord(_))
        ));

        let mut bad_kind = activity.to_record(record_id, None);
        bad_kind.set_string(fields::KIND, "weekly");
        assert!(matches!(
            LocalEntity::from_record(&bad_kind),
            Err(Error::InvalidRecord(_))
        ));

        let session = LocalEntity::from(Session::new(activity.id(), Utc::now(), 1.0, true));
        let mut bad_parent = session.to_record(RecordId::new(zone(), "Session-3").unwrap(), None);
        bad_parent.set_string(fields::ACTIVITY_ID, "nope");
        assert!(matches!(
            LocalEntity::from_record(&bad_parent),
            Err(Error::InvalidRecord(_))
        ));
    }
}
