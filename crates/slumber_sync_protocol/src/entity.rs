//! Kind-tagged syncable records and entity sets.

use crate::identity::{EntityId, EntityMeta, Version};
use crate::records::{index_key, AdaptationSnapshot, SleepEntry, SleepSchedule, UserPreferences};
use slumber_codec::{Payload, PayloadCodec, ShapeMismatch, Timestamp, Value, ValueKind};
use std::fmt;

const KEY_KIND: &str = "kind";

/// The families of syncable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// [`SleepEntry`].
    SleepEntry,
    /// [`SleepSchedule`].
    Schedule,
    /// [`AdaptationSnapshot`].
    Adaptation,
    /// [`UserPreferences`].
    Preferences,
}

impl EntityKind {
    /// All kinds.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::SleepEntry,
        EntityKind::Schedule,
        EntityKind::Adaptation,
        EntityKind::Preferences,
    ];

    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::SleepEntry => "sleepEntry",
            EntityKind::Schedule => "schedule",
            EntityKind::Adaptation => "adaptation",
            EntityKind::Preferences => "preferences",
        }
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any syncable record.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRecord {
    /// A sleep entry.
    SleepEntry(SleepEntry),
    /// A schedule.
    Schedule(SleepSchedule),
    /// An adaptation snapshot.
    Adaptation(AdaptationSnapshot),
    /// The preference set.
    Preferences(UserPreferences),
}

impl SyncRecord {
    /// Kind of the wrapped record.
    pub fn kind(&self) -> EntityKind {
        match self {
            SyncRecord::SleepEntry(_) => EntityKind::SleepEntry,
            SyncRecord::Schedule(_) => EntityKind::Schedule,
            SyncRecord::Adaptation(_) => EntityKind::Adaptation,
            SyncRecord::Preferences(_) => EntityKind::Preferences,
        }
    }

    /// Identity and version fields.
    pub fn meta(&self) -> &EntityMeta {
        match self {
            SyncRecord::SleepEntry(r) => &r.meta,
            SyncRecord::Schedule(r) => &r.meta,
            SyncRecord::Adaptation(r) => &r.meta,
            SyncRecord::Preferences(r) => &r.meta,
        }
    }

    /// Stable identity.
    pub fn id(&self) -> EntityId {
        self.meta().id
    }

    /// Instant of the latest edit.
    pub fn last_updated(&self) -> Timestamp {
        self.meta().last_updated
    }

    /// Current version.
    pub fn version(&self) -> Version {
        self.meta().version()
    }

    /// Returns the sleep entry, if this is one.
    pub fn as_sleep_entry(&self) -> Option<&SleepEntry> {
        match self {
            SyncRecord::SleepEntry(entry) => Some(entry),
            _ => None,
        }
    }

    /// Decodes a record whose kind the context already fixes.
    ///
    /// A `kind` key, when present, must agree with `expected`.
    pub fn decode_as(expected: EntityKind, payload: &Payload) -> Result<Self, ShapeMismatch> {
        if let Some(tag) = payload.optional_text(KEY_KIND)? {
            if EntityKind::from_tag(tag) != Some(expected) {
                return Err(ShapeMismatch::invalid(KEY_KIND, ValueKind::Text));
            }
        }
        Ok(match expected {
            EntityKind::SleepEntry => SyncRecord::SleepEntry(SleepEntry::decode(payload)?),
            EntityKind::Schedule => SyncRecord::Schedule(SleepSchedule::decode(payload)?),
            EntityKind::Adaptation => SyncRecord::Adaptation(AdaptationSnapshot::decode(payload)?),
            EntityKind::Preferences => SyncRecord::Preferences(UserPreferences::decode(payload)?),
        })
    }
}

impl PayloadCodec for SyncRecord {
    fn encode(&self) -> Payload {
        let payload = match self {
            SyncRecord::SleepEntry(r) => r.encode(),
            SyncRecord::Schedule(r) => r.encode(),
            SyncRecord::Adaptation(r) => r.encode(),
            SyncRecord::Preferences(r) => r.encode(),
        };
        payload.with(KEY_KIND, self.kind().as_str())
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        let kind = EntityKind::from_tag(payload.require_text(KEY_KIND)?)
            .ok_or_else(|| ShapeMismatch::invalid(KEY_KIND, ValueKind::Text))?;
        Self::decode_as(kind, payload)
    }
}

impl From<SleepEntry> for SyncRecord {
    fn from(record: SleepEntry) -> Self {
        SyncRecord::SleepEntry(record)
    }
}

impl From<SleepSchedule> for SyncRecord {
    fn from(record: SleepSchedule) -> Self {
        SyncRecord::Schedule(record)
    }
}

impl From<AdaptationSnapshot> for SyncRecord {
    fn from(record: AdaptationSnapshot) -> Self {
        SyncRecord::Adaptation(record)
    }
}

impl From<UserPreferences> for SyncRecord {
    fn from(record: UserPreferences) -> Self {
        SyncRecord::Preferences(record)
    }
}

/// Records decoded from an entity set, plus the ones that were dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySet {
    /// Well-formed records in sender order.
    pub records: Vec<SyncRecord>,
    /// One mismatch per dropped record, keyed by its position.
    pub rejected: Vec<ShapeMismatch>,
}

/// Encodes records as a nested map keyed by zero-padded position.
pub fn encode_entity_set<'a>(records: impl IntoIterator<Item = &'a SyncRecord>) -> Payload {
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| (index_key(i), Value::Map(record.encode())))
        .collect()
}

/// Decodes an entity set, skipping malformed records.
pub fn decode_entity_set(set: &Payload) -> EntitySet {
    let mut decoded = EntitySet::default();
    for (key, value) in set {
        let result = match value.as_map() {
            Some(map) => SyncRecord::decode(map).map_err(|e| e.nested_in(key)),
            None => Err(ShapeMismatch::wrong_kind(
                key.as_str(),
                ValueKind::Map,
                value.kind(),
            )),
        };
        match result {
            Ok(record) => decoded.records.push(record),
            Err(mismatch) => decoded.rejected.push(mismatch),
        }
    }
    decoded
}
