//! Error types for the codec crate.

use crate::value::ValueKind;
use std::fmt;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// NaN values are forbidden.
    #[error("NaN values are forbidden")]
    NaNForbidden,

    /// Indefinite-length items are forbidden.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLengthForbidden,

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Input continued after the top-level value.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },

    /// Invalid CBOR structure.
    #[error("invalid CBOR structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// Unsupported CBOR type.
    #[error("unsupported CBOR type: {type_name}")]
    UnsupportedType {
        /// Name of the unsupported type.
        type_name: String,
    },

    /// A declared length exceeds the decoder limits.
    #[error("size limit exceeded: claimed {claimed}, max {max_allowed}")]
    SizeLimitExceeded {
        /// Length declared by the input.
        claimed: u64,
        /// Largest accepted length.
        max_allowed: u64,
    },

    /// A payload field is missing or holds a value of the wrong kind.
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create an unsupported type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }
}

/// A required payload key is absent, or its value has the wrong kind.
///
/// Callers drop the affected record and keep processing the rest of the
/// envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    /// Dotted path of the offending key.
    pub key: String,
    /// Kind the decoder expected.
    pub expected: ValueKind,
    /// Kind that was present, `None` when the key was absent.
    pub found: Option<ValueKind>,
}

impl ShapeMismatch {
    /// The key is absent.
    pub fn missing(key: impl Into<String>, expected: ValueKind) -> Self {
        Self {
            key: key.into(),
            expected,
            found: None,
        }
    }

    /// The key holds a value of another kind.
    pub fn wrong_kind(key: impl Into<String>, expected: ValueKind, found: ValueKind) -> Self {
        Self {
            key: key.into(),
            expected,
            found: Some(found),
        }
    }

    /// The key holds a value of the right kind that is out of range.
    pub fn invalid(key: impl Into<String>, expected: ValueKind) -> Self {
        Self {
            key: key.into(),
            expected,
            found: Some(expected),
        }
    }

    /// Prefixes the key with the enclosing map's key.
    pub fn nested_in(mut self, parent: &str) -> Self {
        self.key = format!("{parent}.{}", self.key);
        self
    }
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.found {
            None => write!(f, "shape mismatch at `{}`: expected {}, key absent", self.key, self.expected),
            Some(found) if found == self.expected => {
                write!(f, "shape mismatch at `{}`: invalid {} value", self.key, self.expected)
            }
            Some(found) => write!(
                f,
                "shape mismatch at `{}`: expected {}, found {}",
                self.key, self.expected, found
            ),
        }
    }
}
