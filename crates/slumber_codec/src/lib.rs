//! # Slumber Codec
//!
//! Typed payload values and the canonical CBOR wire codec used by the
//! Slumber sync engine.
//!
//! This crate provides:
//! - [`Value`], a tagged variant over the primitive kinds an envelope
//!   payload may hold (text, integer, double, bool, timestamp, nested map)
//! - [`Payload`], a string-keyed map with typed accessors that report
//!   [`ShapeMismatch`] instead of panicking
//! - [`Timestamp`], millisecond-precision instants
//! - Deterministic CBOR encoding and strict decoding
//!
//! ## Canonical CBOR Rules
//!
//! - Maps are sorted by key (length-first, then bytewise)
//! - Map keys are always text
//! - Integers use shortest encoding
//! - Doubles are 8-byte floats, NaN is forbidden
//! - Timestamps are tag 1 over float seconds
//! - No indefinite-length items
//!
//! ## Usage
//!
//! ```
//! use slumber_codec::{from_cbor, to_canonical_cbor, Payload, Value};
//!
//! let payload = Payload::new().with("rating", 4i64).with("notes", "restless");
//! let bytes = to_canonical_cbor(&Value::Map(payload.clone())).unwrap();
//!
//! let decoded = from_cbor(&bytes).unwrap();
//! assert_eq!(decoded, Value::Map(payload));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod timestamp;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult, ShapeMismatch};
pub use timestamp::Timestamp;
pub use value::{Payload, Value, ValueKind};

/// Converts a typed record to and from a payload map.
///
/// `decode(&encode(x))` must reproduce `x` for all transported fields.
/// Derived fields are recomputed by `decode`, never read from the payload.
pub trait PayloadCodec: Sized {
    /// Encode this record as a payload map.
    fn encode(&self) -> Payload;

    /// Decode a record, reporting the first missing or mistyped key.
    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch>;
}

/// Encode a payload map to canonical CBOR bytes.
pub fn payload_to_cbor(payload: &Payload) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode_map(payload)?;
    Ok(encoder.into_bytes())
}

/// Decode canonical CBOR bytes that must hold a payload map.
pub fn payload_from_cbor(bytes: &[u8]) -> CodecResult<Payload> {
    match from_cbor(bytes)? {
        Value::Map(payload) => Ok(payload),
        other => Err(CodecError::invalid_structure(format!(
            "expected map at top level, found {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: &Value) -> Value {
        let bytes = to_canonical_cbor(value).unwrap();
        from_cbor(&bytes).unwrap()
    }

    fn leaf_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-zA-Z0-9 _-]{0,24}".prop_map(Value::Text),
            any::<i64>().prop_map(Value::Integer),
            (prop::num::f64::NORMAL | prop::num::f64::ZERO | prop::num::f64::SUBNORMAL)
                .prop_map(Value::Double),
            any::<bool>().prop_map(Value::Bool),
            (-10_000_000_000_000i64..10_000_000_000_000i64)
                .prop_map(|ms| Value::Timestamp(Timestamp::from_millis(ms))),
        ]
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        leaf_strategy().prop_recursive(3, 32, 6, |inner| {
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                .prop_map(|entries| Value::Map(entries.into_iter().collect()))
        })
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(value in value_strategy()) {
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn encoding_is_deterministic(value in value_strategy()) {
            prop_assert_eq!(
                to_canonical_cbor(&value).unwrap(),
                to_canonical_cbor(&value).unwrap()
            );
        }
    }

    #[test]
    fn roundtrip_nested_payload() {
        let payload = Payload::new()
            .with("name", "Uberman")
            .with(
                "blocks",
                Payload::new()
                    .with("000000", Payload::new().with("startMinute", 0i64))
                    .with("000001", Payload::new().with("startMinute", 240i64)),
            )
            .with("at", Timestamp::from_millis(1_700_000_000_123));
        let bytes = payload_to_cbor(&payload).unwrap();
        assert_eq!(payload_from_cbor(&bytes).unwrap(), payload);
    }

    #[test]
    fn payload_from_cbor_requires_map() {
        let bytes = to_canonical_cbor(&Value::Integer(1)).unwrap();
        assert!(matches!(
            payload_from_cbor(&bytes),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn roundtrip_negative_zero_and_extremes() {
        for value in [
            Value::Double(-0.0),
            Value::Double(f64::MAX),
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
        ] {
            let decoded = roundtrip(&value);
            assert_eq!(decoded, value);
        }
    }
}
