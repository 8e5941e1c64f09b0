//! Canonical CBOR encoder.

use crate::error::{CodecError, CodecResult};
use crate::timestamp::Timestamp;
use crate::value::{Payload, Value};

/// CBOR tag 1: epoch-based date/time.
pub(crate) const TAG_EPOCH_TIME: u64 = 1;

/// Encode a value to canonical CBOR bytes.
///
/// Encoding is deterministic:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - Doubles are always 8-byte floats
/// - Timestamps are tag 1 wrapping float seconds
/// - No indefinite-length encoding
///
/// # Errors
///
/// Returns an error if the value contains a NaN.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// A canonical CBOR encoder.
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a value.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Text(s) => {
                self.encode_text(s);
                Ok(())
            }
            Value::Integer(n) => {
                self.encode_integer(*n);
                Ok(())
            }
            Value::Double(d) => self.encode_double(*d),
            Value::Bool(b) => {
                self.encode_bool(*b);
                Ok(())
            }
            Value::Timestamp(ts) => {
                self.encode_timestamp(*ts);
                Ok(())
            }
            Value::Map(payload) => self.encode_map(payload),
        }
    }

    /// Encode a string-keyed map.
    pub fn encode_map(&mut self, payload: &Payload) -> CodecResult<()> {
        let mut encoded_pairs: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(payload.len());

        for (key, value) in payload {
            let mut key_encoder = CanonicalEncoder::new();
            key_encoder.encode_text(key);
            encoded_pairs.push((key_encoder.into_bytes(), value));
        }

        // Sort by encoded key (length-first, then bytewise)
        encoded_pairs.sort_by(|a, b| match a.0.len().cmp(&b.0.len()) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        self.encode_unsigned(5, payload.len() as u64);
        for (encoded_key, value) in encoded_pairs {
            self.buffer.extend_from_slice(&encoded_key);
            self.encode(value)?;
        }

        Ok(())
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn encode_bool(&mut self, b: bool) {
        // CBOR false is 0xf4, true is 0xf5
        self.buffer.push(if b { 0xf5 } else { 0xf4 });
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_unsigned(0, n as u64);
        } else {
            // CBOR negative integers encode -(n+1)
            let abs_minus_one = (-(n + 1)) as u64;
            self.encode_unsigned(1, abs_minus_one);
        }
    }

    fn encode_double(&mut self, d: f64) -> CodecResult<()> {
        if d.is_nan() {
            return Err(CodecError::NaNForbidden);
        }
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&d.to_be_bytes());
        Ok(())
    }

    fn encode_timestamp(&mut self, ts: Timestamp) {
        self.encode_unsigned(6, TAG_EPOCH_TIME);
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&ts.as_secs_f64().to_be_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_unsigned(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn encode_text(&mut self, text: &str) {
        self.encode_unsigned(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_bool() {
        assert_eq!(to_canonical_cbor(&Value::Bool(false)).unwrap(), vec![0xf4]);
        assert_eq!(to_canonical_cbor(&Value::Bool(true)).unwrap(), vec![0xf5]);
    }

    #[test]
    fn encode_integers_shortest_form() {
        assert_eq!(to_canonical_cbor(&Value::Integer(0)).unwrap(), vec![0x00]);
        assert_eq!(to_canonical_cbor(&Value::Integer(23)).unwrap(), vec![0x17]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(24)).unwrap(),
            vec![0x18, 24]
        );
        assert_eq!(
            to_canonical_cbor(&Value::Integer(256)).unwrap(),
            vec![0x19, 0x01, 0x00]
        );
        assert_eq!(to_canonical_cbor(&Value::Integer(-1)).unwrap(), vec![0x20]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(-100)).unwrap(),
            vec![0x38, 99]
        );
    }

    #[test]
    fn encode_double() {
        let bytes = to_canonical_cbor(&Value::Double(1.5)).unwrap();
        assert_eq!(bytes[0], 0xfb);
        assert_eq!(&bytes[1..], &1.5f64.to_be_bytes());
    }

    #[test]
    fn encode_nan_rejected() {
        assert_eq!(
            to_canonical_cbor(&Value::Double(f64::NAN)),
            Err(CodecError::NaNForbidden)
        );
    }

    #[test]
    fn encode_timestamp_as_tag_1() {
        let bytes = to_canonical_cbor(&Value::Timestamp(Timestamp::from_millis(2_500))).unwrap();
        assert_eq!(bytes[0], 0xc1);
        assert_eq!(bytes[1], 0xfb);
        assert_eq!(&bytes[2..], &2.5f64.to_be_bytes());
    }

    #[test]
    fn encode_text() {
        assert_eq!(
            to_canonical_cbor(&Value::Text(String::new())).unwrap(),
            vec![0x60]
        );
        assert_eq!(
            to_canonical_cbor(&Value::Text("hello".to_string())).unwrap(),
            vec![0x65, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn encode_map_sorted_length_first() {
        let map = Payload::new().with("bb", 2i64).with("a", 1i64).with("c", 3i64);
        let bytes = to_canonical_cbor(&Value::Map(map)).unwrap();

        // map(3), "a" 1, "c" 3, "bb" 2
        assert_eq!(
            bytes,
            vec![0xa3, 0x61, b'a', 0x01, 0x61, b'c', 0x03, 0x62, b'b', b'b', 0x02]
        );
    }

    #[test]
    fn deterministic_encoding() {
        let mut first = Payload::new();
        first.insert("z", 1i64);
        first.insert("a", 2i64);
        let mut second = Payload::new();
        second.insert("a", 2i64);
        second.insert("z", 1i64);

        assert_eq!(
            to_canonical_cbor(&Value::Map(first)).unwrap(),
            to_canonical_cbor(&Value::Map(second)).unwrap()
        );
    }
}
