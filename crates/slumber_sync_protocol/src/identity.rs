//! Entity identities and version markers.

use serde::{Deserialize, Serialize};
use slumber_codec::{Payload, ShapeMismatch, Timestamp, ValueKind};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a syncable entity, shared by both devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generates a fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
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
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Marker distinguishing versions of one entity produced by different edits.
///
/// Compared lexicographically when two versions share a `lastUpdated`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncId(String);

impl SyncId {
    /// Generates a fresh marker for a new edit.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing marker.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the marker text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The version of an entity: `lastUpdated`, then `syncId` as tie-break.
///
/// The derived ordering compares fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Instant of the edit that produced this version.
    pub last_updated: Timestamp,
    /// Marker of the edit that produced this version.
    pub sync_id: SyncId,
}

/// Identity and version fields every syncable entity carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityMeta {
    /// Stable identity.
    pub id: EntityId,
    /// Instant of the latest edit.
    pub last_updated: Timestamp,
    /// Marker of the latest edit.
    pub sync_id: SyncId,
}

pub(crate) const KEY_ID: &str = "id";
pub(crate) const KEY_LAST_UPDATED: &str = "lastUpdated";
pub(crate) const KEY_SYNC_ID: &str = "syncId";

impl EntityMeta {
    /// Metadata for a newly created entity.
    pub fn new(now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            last_updated: now,
            sync_id: SyncId::generate(),
        }
    }

    /// Metadata with explicit fields.
    pub fn with_version(id: EntityId, last_updated: Timestamp, sync_id: SyncId) -> Self {
        Self {
            id,
            last_updated,
            sync_id,
        }
    }

    /// Records a new edit at `now`.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_updated = now;
        self.sync_id = SyncId::generate();
    }

    /// Current version.
    pub fn version(&self) -> Version {
        Version {
            last_updated: self.last_updated,
            sync_id: self.sync_id.clone(),
        }
    }

    pub(crate) fn encode_into(&self, payload: &mut Payload) {
        payload.insert(KEY_ID, self.id.to_string());
        payload.insert(KEY_LAST_UPDATED, self.last_updated);
        payload.insert(KEY_SYNC_ID, self.sync_id.as_str());
    }

    pub(crate) fn decode_from(payload: &Payload) -> Result<Self, ShapeMismatch> {
        Ok(Self {
            id: decode_entity_id(payload, KEY_ID)?,
            last_updated: payload.require_timestamp(KEY_LAST_UPDATED)?,
            sync_id: SyncId::new(payload.require_text(KEY_SYNC_ID)?),
        })
    }
}

/// Reads a UUID-shaped identity from a text field.
pub(crate) fn decode_entity_id(payload: &Payload, key: &str) -> Result<EntityId, ShapeMismatch> {
    payload
        .require_text(key)?
        .parse()
        .map_err(|_| ShapeMismatch::invalid(key, ValueKind::Text))
}
