//! Protocol-level errors.

use crate::envelope::MessageType;
use slumber_codec::{CodecError, ShapeMismatch};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while turning envelopes into typed messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The envelope carries a different message type than the decoder handles.
    #[error("expected {expected} message, found {found}")]
    UnexpectedMessageType {
        /// Message type the decoder handles.
        expected: &'static str,
        /// Message type the envelope carries.
        found: MessageType,
    },

    /// The envelope's tag is not one of the known message types.
    #[error("unrecognized message type `{0}`")]
    UnrecognizedMessageType(String),

    /// A message-level field is missing or malformed.
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),

    /// Wire encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
