//! Error types for the sync engine.

use slumber_codec::{CodecError, ShapeMismatch};
use slumber_sync_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these reach the presentation layer as a crash. The worst
/// outcome of any of them is delayed convergence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A record is missing a key or holds the wrong kind; it is skipped.
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),

    /// The peer is unreachable. Deferred to the next tick or reconnect.
    #[error("channel unavailable: peer is unreachable")]
    ChannelUnavailable,

    /// A reconciliation session is already open.
    #[error("reconciliation session {open_sequence} is already open")]
    SessionConflict {
        /// Sequence of the session that is open.
        open_sequence: u64,
    },

    /// The local store refused a write; the watermark is not advanced.
    #[error("store write failed: {0}")]
    StoreWriteFailed(String),

    /// The envelope's tag is outside the known set.
    #[error("unrecognized message type `{0}`")]
    UnrecognizedMessageType(String),

    /// No response arrived within the allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer received the envelope and refused it.
    #[error("peer rejected envelope: {0}")]
    Rejected(String),

    /// A message could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An inbound handler is already registered on the channel.
    #[error("an inbound handler is already registered")]
    HandlerAlreadyRegistered,

    /// The host refused a wake-up request.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The other end of an internal channel went away.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Creates a store write error.
    pub fn store_write(message: impl Into<String>) -> Self {
        Self::StoreWriteFailed(message.into())
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns true if a later attempt can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ChannelUnavailable
                | SyncError::Timeout(_)
                | SyncError::StoreWriteFailed(_)
                | SyncError::SessionConflict { .. }
                | SyncError::ChannelClosed
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Shape(mismatch) => SyncError::ShapeMismatch(mismatch),
            ProtocolError::Codec(codec) => SyncError::Codec(codec),
            ProtocolError::UnrecognizedMessageType(tag) => SyncError::UnrecognizedMessageType(tag),
            other @ ProtocolError::UnexpectedMessageType { .. } => {
                SyncError::Protocol(other.to_string())
            }
        }
    }
}
