//! Canonical CBOR decoder.

use crate::encoder::TAG_EPOCH_TIME;
use crate::error::{CodecError, CodecResult};
use crate::timestamp::Timestamp;
use crate::value::{Payload, Value};

/// Decode a single value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid canonical CBOR, contain a
/// construct outside the payload value kinds, or carry trailing bytes.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A canonical CBOR decoder.
///
/// This decoder validates that input follows canonical CBOR rules
/// and rejects constructs the payload model cannot hold (arrays, byte
/// strings, null, tags other than epoch time).
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Maximum allowed entry count for maps.
const MAX_CONTAINER_ELEMENTS: u64 = 1024 * 1024;

/// Maximum allowed text length.
const MAX_TEXT_LENGTH: u64 = 16 * 1024 * 1024;

/// Maximum nesting of maps.
const MAX_DEPTH: usize = 32;

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Decode the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let additional_info = initial_byte & 0x1f;

        match major_type {
            0 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::decoding_failed("integer exceeds i64 range"))
            }
            1 => {
                // Negative integer: value is -(n+1)
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::decoding_failed("integer exceeds i64 range"))
            }
            2 => Err(CodecError::unsupported_type("byte string")),
            3 => self.decode_text(additional_info).map(Value::Text),
            4 => Err(CodecError::unsupported_type("array")),
            5 => self.decode_map(additional_info).map(Value::Map),
            6 => self.decode_tagged(additional_info),
            7 => self.decode_simple(additional_info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        if self.pos >= self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_f64(&mut self) -> CodecResult<f64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_be_bytes(buf))
    }

    fn non_canonical() -> CodecError {
        CodecError::invalid_structure("non-canonical: value could be encoded in fewer bytes")
    }

    #[inline]
    fn decode_unsigned(&mut self, additional_info: u8) -> CodecResult<u64> {
        match additional_info {
            0..=23 => Ok(u64::from(additional_info)),
            24 => {
                let byte = self.read_byte()?;
                if byte < 24 {
                    return Err(Self::non_canonical());
                }
                Ok(u64::from(byte))
            }
            25 => {
                let bytes = self.read_bytes(2)?;
                let value = u16::from_be_bytes([bytes[0], bytes[1]]);
                if u8::try_from(value).is_ok() {
                    return Err(Self::non_canonical());
                }
                Ok(u64::from(value))
            }
            26 => {
                let bytes = self.read_bytes(4)?;
                let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if u16::try_from(value).is_ok() {
                    return Err(Self::non_canonical());
                }
                Ok(u64::from(value))
            }
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                let value = u64::from_be_bytes(buf);
                if u32::try_from(value).is_ok() {
                    return Err(Self::non_canonical());
                }
                Ok(value)
            }
            28..=30 => Err(CodecError::invalid_structure("reserved additional info")),
            _ => Err(CodecError::IndefiniteLengthForbidden),
        }
    }

    fn decode_text(&mut self, additional_info: u8) -> CodecResult<String> {
        if additional_info == 31 {
            return Err(CodecError::IndefiniteLengthForbidden);
        }
        let len_u64 = self.decode_unsigned(additional_info)?;
        if len_u64 > MAX_TEXT_LENGTH {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len_u64,
                max_allowed: MAX_TEXT_LENGTH,
            });
        }
        let len = usize::try_from(len_u64).map_err(|_| CodecError::UnexpectedEof)?;
        let bytes = self.read_bytes(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(text.to_string())
    }

    fn decode_map(&mut self, additional_info: u8) -> CodecResult<Payload> {
        if additional_info == 31 {
            return Err(CodecError::IndefiniteLengthForbidden);
        }
        let len = self.decode_unsigned(additional_info)?;
        if len > MAX_CONTAINER_ELEMENTS {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_CONTAINER_ELEMENTS,
            });
        }
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::invalid_structure("maps nested too deeply"));
        }
        self.depth += 1;

        let mut payload = Payload::new();
        let mut prev_key_bytes: Option<&'a [u8]> = None;

        for _ in 0..len {
            let key_start = self.pos;
            let key_header = self.read_byte()?;
            if key_header >> 5 != 3 {
                return Err(CodecError::invalid_structure("map keys must be text"));
            }
            let key = self.decode_text(key_header & 0x1f)?;
            let data = self.data;
            let key_bytes = &data[key_start..self.pos];

            // Keys must be strictly increasing in canonical order
            if let Some(prev) = prev_key_bytes {
                if compare_cbor_bytes(prev, key_bytes) != std::cmp::Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }
            prev_key_bytes = Some(key_bytes);

            let value = self.decode()?;
            payload.insert(key, value);
        }

        self.depth -= 1;
        Ok(payload)
    }

    fn decode_tagged(&mut self, additional_info: u8) -> CodecResult<Value> {
        let tag = self.decode_unsigned(additional_info)?;
        if tag != TAG_EPOCH_TIME {
            return Err(CodecError::unsupported_type(format!("tag {tag}")));
        }
        let header = self.read_byte()?;
        let secs = match header {
            0xfb => self.read_f64()?,
            _ => {
                return Err(CodecError::invalid_structure(
                    "epoch time must wrap a double",
                ))
            }
        };
        Timestamp::from_secs_f64(secs)
            .map(Value::Timestamp)
            .ok_or_else(|| CodecError::decoding_failed("epoch time out of range"))
    }

    fn decode_simple(&mut self, additional_info: u8) -> CodecResult<Value> {
        match additional_info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 | 23 => Err(CodecError::unsupported_type("null")),
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: floats must use 8-byte encoding",
            )),
            27 => {
                let d = self.read_f64()?;
                if d.is_nan() {
                    return Err(CodecError::NaNForbidden);
                }
                Ok(Value::Double(d))
            }
            28..=30 => Err(CodecError::invalid_structure("reserved additional info")),
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            _ => Err(CodecError::unsupported_type(format!(
                "simple value {additional_info}"
            ))),
        }
    }
}

/// Compare two CBOR byte sequences for canonical ordering.
/// Uses length-first, then bytewise comparison.
fn compare_cbor_bytes(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    match a.len().cmp(&b.len()) {
        std::cmp::Ordering::Equal => a.cmp(b),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_bool() {
        assert_eq!(from_cbor(&[0xf4]).unwrap(), Value::Bool(false));
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn decode_integers() {
        assert_eq!(from_cbor(&[0x17]).unwrap(), Value::Integer(23));
        assert_eq!(from_cbor(&[0x18, 255]).unwrap(), Value::Integer(255));
        assert_eq!(from_cbor(&[0x19, 0x01, 0x00]).unwrap(), Value::Integer(256));
        assert_eq!(from_cbor(&[0x20]).unwrap(), Value::Integer(-1));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
    }

    #[test]
    fn decode_double() {
        let mut bytes = vec![0xfb];
        bytes.extend_from_slice(&7.25f64.to_be_bytes());
        assert_eq!(from_cbor(&bytes).unwrap(), Value::Double(7.25));
    }

    #[test]
    fn decode_timestamp() {
        let mut bytes = vec![0xc1, 0xfb];
        bytes.extend_from_slice(&1.5f64.to_be_bytes());
        assert_eq!(
            from_cbor(&bytes).unwrap(),
            Value::Timestamp(Timestamp::from_millis(1_500))
        );
    }

    #[test]
    fn decode_map() {
        assert_eq!(from_cbor(&[0xa0]).unwrap(), Value::Map(Payload::new()));
        assert_eq!(
            from_cbor(&[0xa1, 0x61, b'a', 0x01]).unwrap(),
            Value::Map(Payload::new().with("a", 1i64))
        );
    }

    #[test]
    fn reject_short_floats() {
        assert!(matches!(
            from_cbor(&[0xf9, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0xfa, 0x00, 0x00, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_nan() {
        let mut bytes = vec![0xfb];
        bytes.extend_from_slice(&f64::NAN.to_be_bytes());
        assert_eq!(from_cbor(&bytes), Err(CodecError::NaNForbidden));
    }

    #[test]
    fn reject_kinds_outside_payload_model() {
        assert!(matches!(
            from_cbor(&[0x43, 1, 2, 3]),
            Err(CodecError::UnsupportedType { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x82, 0x01, 0x02]),
            Err(CodecError::UnsupportedType { .. })
        ));
        assert!(matches!(
            from_cbor(&[0xf6]),
            Err(CodecError::UnsupportedType { .. })
        ));
        // Tag 0 (date string) is not supported
        assert!(matches!(
            from_cbor(&[0xc0, 0x61, b'x']),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn reject_non_text_map_keys() {
        assert!(matches!(
            from_cbor(&[0xa1, 0x01, 0x01]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_indefinite_length() {
        assert!(matches!(
            from_cbor(&[0x7f, 0x61, b'a', 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
        assert!(matches!(
            from_cbor(&[0xbf, 0x61, b'a', 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x19, 0x00, 0xff]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unsorted_map_keys() {
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_trailing_bytes() {
        assert_eq!(
            from_cbor(&[0x01, 0x02]),
            Err(CodecError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn unexpected_eof() {
        assert!(matches!(from_cbor(&[]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(from_cbor(&[0x18]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(
            from_cbor(&[0x65, b'h']),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert!(matches!(
            from_cbor(&[0x62, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn deep_nesting_rejected() {
        // 40 nested single-entry maps {"a": {"a": ...}}
        let mut bytes = Vec::new();
        for _ in 0..40 {
            bytes.extend_from_slice(&[0xa1, 0x61, b'a']);
        }
        bytes.push(0x01);
        assert!(matches!(
            from_cbor(&bytes),
            Err(CodecError::InvalidStructure { .. })
        ));
    }
}
