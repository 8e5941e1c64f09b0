//! Typed protocol messages and their envelope form.
//!
//! Reconciliation messages carry an entity set (see
//! [`encode_entity_set`](crate::encode_entity_set)). Decoding them never
//! fails because of one bad record: malformed records come back in
//! [`Decoded::rejected`] and the rest are applied.

use crate::entity::{decode_entity_set, encode_entity_set, EntitySet, SyncRecord};
use crate::envelope::{Envelope, MessageType};
use crate::error::{ProtocolError, ProtocolResult};
use slumber_codec::{Payload, PayloadCodec, ShapeMismatch, Timestamp, ValueKind};

const KEY_SEQUENCE: &str = "sequence";
const KEY_WATERMARK: &str = "watermark";
const KEY_ENTITIES: &str = "entities";

/// A decoded message plus the records that were dropped while decoding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// The message.
    pub message: T,
    /// One mismatch per dropped record.
    pub rejected: Vec<ShapeMismatch>,
}

impl<T> Decoded<T> {
    fn clean(message: T) -> Self {
        Self {
            message,
            rejected: Vec::new(),
        }
    }

    /// Maps the message, keeping the rejections.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        Decoded {
            message: f(self.message),
            rejected: self.rejected,
        }
    }
}

fn expect_type(envelope: &Envelope, expected: MessageType) -> ProtocolResult<()> {
    let found = envelope.message_type();
    if *found == expected {
        return Ok(());
    }
    if let MessageType::Unrecognized(tag) = found {
        return Err(ProtocolError::UnrecognizedMessageType(tag.clone()));
    }
    Err(ProtocolError::UnexpectedMessageType {
        expected: match expected {
            MessageType::SyncRequest => "syncRequest",
            MessageType::SyncResponse => "syncResponse",
            MessageType::FullDataSync => "fullDataSync",
            _ => "change event",
        },
        found: found.clone(),
    })
}

fn encode_sequence(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

fn decode_sequence(payload: &Payload) -> Result<u64, ShapeMismatch> {
    u64::try_from(payload.require_integer(KEY_SEQUENCE)?)
        .map_err(|_| ShapeMismatch::invalid(KEY_SEQUENCE, ValueKind::Integer))
}

fn decode_entities(payload: &Payload) -> Result<EntitySet, ShapeMismatch> {
    Ok(decode_entity_set(payload.require_map(KEY_ENTITIES)?))
}

/// Opens a reconciliation cycle.
///
/// Carries every local entity changed after `watermark`, the instant of the
/// sender's last confirmed apply. The peer answers with its own changes
/// after that same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// Session sequence number, echoed by the response.
    pub sequence: u64,
    /// Sender's last successful session start.
    pub watermark: Timestamp,
    /// Sender's changes since `watermark`.
    pub entities: Vec<SyncRecord>,
}

impl SyncRequest {
    /// Wraps the request in an envelope.
    pub fn into_envelope(self, now: Timestamp) -> Envelope {
        let payload = Payload::new()
            .with(KEY_SEQUENCE, encode_sequence(self.sequence))
            .with(KEY_WATERMARK, self.watermark)
            .with(KEY_ENTITIES, encode_entity_set(&self.entities));
        Envelope::new(MessageType::SyncRequest, payload, now)
    }

    /// Reads a request from an envelope.
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Decoded<Self>> {
        expect_type(envelope, MessageType::SyncRequest)?;
        let payload = envelope.payload();
        let set = decode_entities(payload)?;
        Ok(Decoded {
            message: Self {
                sequence: decode_sequence(payload)?,
                watermark: payload.require_timestamp(KEY_WATERMARK)?,
                entities: set.records,
            },
            rejected: set.rejected,
        })
    }
}

/// Answers a [`SyncRequest`] with the responder's changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// Sequence of the request being answered.
    pub sequence: u64,
    /// Responder's changes since the requester's watermark.
    pub entities: Vec<SyncRecord>,
}

impl SyncResponse {
    /// Wraps the response in an envelope.
    pub fn into_envelope(self, now: Timestamp) -> Envelope {
        let payload = Payload::new()
            .with(KEY_SEQUENCE, encode_sequence(self.sequence))
            .with(KEY_ENTITIES, encode_entity_set(&self.entities));
        Envelope::new(MessageType::SyncResponse, payload, now)
    }

    /// Reads a response from an envelope.
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Decoded<Self>> {
        expect_type(envelope, MessageType::SyncResponse)?;
        let payload = envelope.payload();
        let set = decode_entities(payload)?;
        Ok(Decoded {
            message: Self {
                sequence: decode_sequence(payload)?,
                entities: set.records,
            },
            rejected: set.rejected,
        })
    }
}

/// The sender's entire entity set, applied without a watermark.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FullDataSync {
    /// Every entity the sender holds, or one chunk of them.
    pub entities: Vec<SyncRecord>,
}

impl FullDataSync {
    /// Wraps the set in an envelope.
    pub fn into_envelope(self, now: Timestamp) -> Envelope {
        let payload = Payload::new().with(KEY_ENTITIES, encode_entity_set(&self.entities));
        Envelope::new(MessageType::FullDataSync, payload, now)
    }

    /// Reads a full data sync from an envelope.
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Decoded<Self>> {
        expect_type(envelope, MessageType::FullDataSync)?;
        let set = decode_entities(envelope.payload())?;
        Ok(Decoded {
            message: Self {
                entities: set.records,
            },
            rejected: set.rejected,
        })
    }
}

/// One discrete domain mutation, sent as it happens.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    message_type: MessageType,
    record: SyncRecord,
}

impl ChangeEvent {
    /// Pairs a change-event tag with the record it describes.
    ///
    /// Fails if the tag is not a change event or carries another kind.
    pub fn new(message_type: MessageType, record: SyncRecord) -> ProtocolResult<Self> {
        if message_type.change_event_kind() != Some(record.kind()) {
            return Err(ProtocolError::UnexpectedMessageType {
                expected: record.kind().as_str(),
                found: message_type,
            });
        }
        Ok(Self {
            message_type,
            record,
        })
    }

    /// The change-event tag.
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// The changed record.
    pub fn record(&self) -> &SyncRecord {
        &self.record
    }

    /// Consumes the event, returning the record.
    pub fn into_record(self) -> SyncRecord {
        self.record
    }

    /// Wraps the event in an envelope. The payload is the record itself.
    pub fn into_envelope(self, now: Timestamp) -> Envelope {
        Envelope::new(self.message_type, self.record.encode(), now)
    }

    /// Reads a change event from an envelope.
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Self> {
        let message_type = envelope.message_type();
        let Some(kind) = message_type.change_event_kind() else {
            return Err(match message_type {
                MessageType::Unrecognized(tag) => ProtocolError::UnrecognizedMessageType(tag.clone()),
                other => ProtocolError::UnexpectedMessageType {
                    expected: "change event",
                    found: other.clone(),
                },
            });
        };
        let record = SyncRecord::decode_as(kind, envelope.payload())?;
        Ok(Self {
            message_type: message_type.clone(),
            record,
        })
    }
}

/// Any inbound message, dispatched on its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// `syncRequest`.
    Request(SyncRequest),
    /// `syncResponse`.
    Response(SyncResponse),
    /// `fullDataSync`.
    FullData(FullDataSync),
    /// A discrete change event.
    Change(ChangeEvent),
}

impl SyncMessage {
    /// Decodes an envelope of any known type.
    ///
    /// Unrecognized tags fail with [`ProtocolError::UnrecognizedMessageType`].
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Decoded<Self>> {
        match envelope.message_type() {
            MessageType::SyncRequest => {
                Ok(SyncRequest::from_envelope(envelope)?.map(SyncMessage::Request))
            }
            MessageType::SyncResponse => {
                Ok(SyncResponse::from_envelope(envelope)?.map(SyncMessage::Response))
            }
            MessageType::FullDataSync => {
                Ok(FullDataSync::from_envelope(envelope)?.map(SyncMessage::FullData))
            }
            MessageType::Unrecognized(tag) => {
                Err(ProtocolError::UnrecognizedMessageType(tag.clone()))
            }
            _ => Ok(Decoded::clean(SyncMessage::Change(
                ChangeEvent::from_envelope(envelope)?,
            ))),
        }
    }

    /// The tag this message travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::Request(_) => MessageType::SyncRequest,
            SyncMessage::Response(_) => MessageType::SyncResponse,
            SyncMessage::FullData(_) => MessageType::FullDataSync,
            SyncMessage::Change(event) => event.message_type().clone(),
        }
    }
}
