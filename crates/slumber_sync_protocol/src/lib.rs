//! # Slumber Sync Protocol
//!
//! Protocol types for the Slumber cross-device sync engine.
//!
//! This crate provides:
//! - [`Envelope`] and the closed [`MessageType`] tag set
//! - Entity identities and [`Version`] markers
//! - The syncable domain records and the kind-tagged [`SyncRecord`]
//! - Typed reconciliation messages ([`SyncRequest`], [`SyncResponse`],
//!   [`FullDataSync`], [`ChangeEvent`])
//! - The last-write-wins [`resolve`] function
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod envelope;
mod error;
mod identity;
mod messages;
mod records;

pub use conflict::{resolve, Conflict, ConflictResolution, Versioned};
pub use entity::{decode_entity_set, encode_entity_set, EntityKind, EntitySet, SyncRecord};
pub use envelope::{Envelope, MessageType};
pub use error::{ProtocolError, ProtocolResult};
pub use identity::{EntityId, EntityMeta, SyncId, Version};
pub use messages::{ChangeEvent, Decoded, FullDataSync, SyncMessage, SyncRequest, SyncResponse};
pub use records::{
    AdaptationData, AdaptationSnapshot, ScheduleType, SleepBlock, SleepEntry, SleepSchedule,
    SleepType, UserPreferences, MINUTES_PER_DAY,
};
