//! Common types used throughout Cadence.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable local identifier of an entity.
///
/// Assigned once when the entity is created and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid entity id '{}': {}", s, e)))
    }
}

/// Zone used when no other is configured.
pub const DEFAULT_ZONE: &str = "CadenceZone";

/// Name of an isolated record namespace on the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Create a new ZoneId.
    ///
    /// # Preconditions
    /// - `name` must be non-empty
    /// - `name` must not contain '/'
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains a separator
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ZoneId cannot be empty".to_string(),
            ));
        }
        if name.contains('/') {
            return Err(crate::Error::InvalidInput(format!(
                "ZoneId cannot contain '/': {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self(DEFAULT_ZONE.to_string())
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of records exchanged with the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// Parent entity.
    Activity,
    /// Child entity, references an Activity.
    Session,
}

impl RecordType {
    /// All record types, parents before dependents.
    pub const ALL: [RecordType; 2] = [RecordType::Activity, RecordType::Session];

    /// Remote type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Activity => "Activity",
            RecordType::Session => "Session",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Activity" => Ok(RecordType::Activity),
            "Session" => Ok(RecordType::Session),
            other => Err(crate::Error::InvalidRecord(format!(
                "Unknown record type: {}",
                other
            ))),
        }
    }
}

/// Zone-scoped identifier of a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Zone the record lives in.
    pub zone: ZoneId,
    /// Record name, unique within the zone.
    pub name: String,
}

impl RecordId {
    /// Create a record id.
    ///
    /// # Errors
    /// - Returns error if `name` is empty
    pub fn new(zone: ZoneId, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record name cannot be empty".to_string(),
            ));
        }
        Ok(Self { zone, name })
    }

    /// Derive the record name used for a local entity's first upload.
    ///
    /// The name is a function of the entity id, so a save whose response was
    /// lost is re-sent under the same name rather than creating a duplicate.
    pub fn for_entity(zone: ZoneId, record_type: RecordType, id: &EntityId) -> Self {
        Self {
            zone,
            name: format!("{}-{}", record_type, id),
        }
    }

    /// Parse the `zone/name` form produced by `Display`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (zone, name) = s.split_once('/').ok_or_else(|| {
            crate::Error::InvalidInput(format!("Record id must be 'zone/name': {}", s))
        })?;
        Self::new(ZoneId::new(zone)?, name)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// Opaque, zone-scoped change cursor handed out by the remote store.
///
/// The engine stores and replays tokens but never interprets their contents.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode for text-based persistence.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decode a token persisted with `to_base64`.
    pub fn from_base64(encoded: &str) -> crate::Result<Self> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|e| crate::Error::Serialization(format!("Invalid change token: {}", e)))
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken([{} bytes])", self.0.len())
    }
}

impl Serialize for ChangeToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ChangeToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
