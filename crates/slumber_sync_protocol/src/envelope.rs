//! Transport envelopes and their wire shape.

use crate::entity::EntityKind;
use slumber_codec::{
    payload_from_cbor, payload_to_cbor, CodecError, CodecResult, Payload, ShapeMismatch,
    Timestamp, ValueKind,
};
use std::fmt;

const WIRE_MESSAGE_TYPE: &str = "messageType";
const WIRE_PAYLOAD: &str = "payload";
const WIRE_TIMESTAMP: &str = "timestamp";

/// The closed set of envelope tags.
///
/// Tags outside the set decode to [`MessageType::Unrecognized`] instead of
/// failing, so a newer peer cannot crash an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A sleep session began.
    SleepStarted,
    /// A sleep session ended.
    SleepEnded,
    /// A sleep entry received a quality rating.
    QualityRated,
    /// A schedule was edited.
    ScheduleUpdate,
    /// A schedule became the active one.
    ScheduleActivated,
    /// Adaptation progress changed.
    AdaptationUpdate,
    /// A complete sleep entry was logged.
    SleepEntryAdded,
    /// User preferences changed.
    UserPreferencesUpdate,
    /// Opens a reconciliation cycle.
    SyncRequest,
    /// Answers a reconciliation cycle.
    SyncResponse,
    /// Carries the sender's entire entity set.
    FullDataSync,
    /// Any tag outside the known set.
    Unrecognized(String),
}

impl MessageType {
    /// Every known message type.
    pub const KNOWN: [MessageType; 11] = [
        MessageType::SleepStarted,
        MessageType::SleepEnded,
        MessageType::QualityRated,
        MessageType::ScheduleUpdate,
        MessageType::ScheduleActivated,
        MessageType::AdaptationUpdate,
        MessageType::SleepEntryAdded,
        MessageType::UserPreferencesUpdate,
        MessageType::SyncRequest,
        MessageType::SyncResponse,
        MessageType::FullDataSync,
    ];

    /// Parses a wire tag. Never fails.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "sleepStarted" => MessageType::SleepStarted,
            "sleepEnded" => MessageType::SleepEnded,
            "qualityRated" => MessageType::QualityRated,
            "scheduleUpdate" => MessageType::ScheduleUpdate,
            "scheduleActivated" => MessageType::ScheduleActivated,
            "adaptationUpdate" => MessageType::AdaptationUpdate,
            "sleepEntryAdded" => MessageType::SleepEntryAdded,
            "userPreferencesUpdate" => MessageType::UserPreferencesUpdate,
            "syncRequest" => MessageType::SyncRequest,
            "syncResponse" => MessageType::SyncResponse,
            "fullDataSync" => MessageType::FullDataSync,
            other => MessageType::Unrecognized(other.to_string()),
        }
    }

    /// Returns the wire tag.
    pub fn as_tag(&self) -> &str {
        match self {
            MessageType::SleepStarted => "sleepStarted",
            MessageType::SleepEnded => "sleepEnded",
            MessageType::QualityRated => "qualityRated",
            MessageType::ScheduleUpdate => "scheduleUpdate",
            MessageType::ScheduleActivated => "scheduleActivated",
            MessageType::AdaptationUpdate => "adaptationUpdate",
            MessageType::SleepEntryAdded => "sleepEntryAdded",
            MessageType::UserPreferencesUpdate => "userPreferencesUpdate",
            MessageType::SyncRequest => "syncRequest",
            MessageType::SyncResponse => "syncResponse",
            MessageType::FullDataSync => "fullDataSync",
            MessageType::Unrecognized(tag) => tag,
        }
    }

    /// Returns true for tags outside the known set.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, MessageType::Unrecognized(_))
    }

    /// The entity kind a change-event message carries.
    ///
    /// `None` for reconciliation messages and unrecognized tags.
    pub fn change_event_kind(&self) -> Option<EntityKind> {
        match self {
            MessageType::SleepStarted
            | MessageType::SleepEnded
            | MessageType::QualityRated
            | MessageType::SleepEntryAdded => Some(EntityKind::SleepEntry),
            MessageType::ScheduleUpdate | MessageType::ScheduleActivated => {
                Some(EntityKind::Schedule)
            }
            MessageType::AdaptationUpdate => Some(EntityKind::Adaptation),
            MessageType::UserPreferencesUpdate => Some(EntityKind::Preferences),
            MessageType::SyncRequest
            | MessageType::SyncResponse
            | MessageType::FullDataSync
            | MessageType::Unrecognized(_) => None,
        }
    }

    /// Returns true for discrete change-event messages.
    pub fn is_change_event(&self) -> bool {
        self.change_event_kind().is_some()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// The unit of transport between the two devices.
///
/// Immutable once constructed. `origin_timestamp` is the instant the
/// envelope was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message_type: MessageType,
    payload: Payload,
    origin_timestamp: Timestamp,
}

impl Envelope {
    /// Creates an envelope.
    pub fn new(message_type: MessageType, payload: Payload, origin_timestamp: Timestamp) -> Self {
        Self {
            message_type,
            payload,
            origin_timestamp,
        }
    }

    /// The message tag.
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// The payload map.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Instant the envelope was produced.
    pub fn origin_timestamp(&self) -> Timestamp {
        self.origin_timestamp
    }

    /// Consumes the envelope, returning its payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// The wire record `{messageType, payload, timestamp}`.
    ///
    /// `timestamp` is plain float seconds since the epoch.
    pub fn to_wire_payload(&self) -> Payload {
        Payload::new()
            .with(WIRE_MESSAGE_TYPE, self.message_type.as_tag())
            .with(WIRE_PAYLOAD, self.payload.clone())
            .with(WIRE_TIMESTAMP, self.origin_timestamp.as_secs_f64())
    }

    /// Reads the wire record. Unknown tags become `Unrecognized`.
    pub fn from_wire_payload(wire: &Payload) -> Result<Self, ShapeMismatch> {
        let message_type = MessageType::from_tag(wire.require_text(WIRE_MESSAGE_TYPE)?);
        let payload = wire.require_map(WIRE_PAYLOAD)?.clone();
        let origin_timestamp = Timestamp::from_secs_f64(wire.require_double(WIRE_TIMESTAMP)?)
            .ok_or_else(|| ShapeMismatch::invalid(WIRE_TIMESTAMP, ValueKind::Double))?;
        Ok(Self {
            message_type,
            payload,
            origin_timestamp,
        })
    }

    /// Encodes to canonical CBOR bytes.
    pub fn to_wire(&self) -> CodecResult<Vec<u8>> {
        payload_to_cbor(&self.to_wire_payload())
    }

    /// Decodes from CBOR bytes.
    pub fn from_wire(bytes: &[u8]) -> CodecResult<Self> {
        let wire = payload_from_cbor(bytes)?;
        Self::from_wire_payload(&wire).map_err(CodecError::from)
    }
}
