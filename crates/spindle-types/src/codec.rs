//! Tuple wire format.
//!
//! A tuple is encoded as a field count followed by the fields. Every
//! field starts with a one-byte type tag:
//!
//! ```text
//! tuple    := varint(field_count) field*
//! field    := 0x01 varint(u64)              -- unsigned
//!           | 0x02 varint(len) byte*        -- string (UTF-8)
//!           | 0x03 varint(count) field*     -- array
//! varint   := LEB128, 7 bits per byte, high bit = continuation
//! ```
//!
//! Decoding is strict: trailing bytes, truncated payloads, unknown tags
//! and invalid UTF-8 are all rejected, because snapshot and WAL rows are
//! trusted only as far as their checksums.

use spindle_error::{Result, SpindleError};

use crate::value::Value;

const TAG_UNSIGNED: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const TAG_ARRAY: u8 = 0x03;

/// Maximum nesting depth for arrays; deeper input is rejected as corrupt.
const MAX_DEPTH: u32 = 32;

fn bad(detail: impl Into<String>) -> SpindleError {
    SpindleError::InvalidTupleData {
        detail: detail.into(),
    }
}

/// Append `v` to `buf` as a LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read a LEB128 varint, returning the value and the bytes consumed.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(bad("varint overflows u64"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(bad("truncated varint"))
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Unsigned(v) => {
            buf.push(TAG_UNSIGNED);
            write_varint(buf, *v);
        }
        Value::Str(s) => {
            buf.push(TAG_STR);
            write_varint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            buf.push(TAG_ARRAY);
            write_varint(buf, items.len() as u64);
            for item in items {
                encode_value(buf, item);
            }
        }
    }
}

fn decode_value(data: &[u8], depth: u32) -> Result<(Value, usize)> {
    if depth > MAX_DEPTH {
        return Err(bad("array nesting too deep"));
    }
    let (&tag, rest) = data
        .split_first()
        .ok_or_else(|| bad("truncated field tag"))?;
    match tag {
        TAG_UNSIGNED => {
            let (v, n) = read_varint(rest)?;
            Ok((Value::Unsigned(v), 1 + n))
        }
        TAG_STR => {
            let (len, n) = read_varint(rest)?;
            let len = usize::try_from(len).map_err(|_| bad("string length overflow"))?;
            let bytes = rest
                .get(n..n + len)
                .ok_or_else(|| bad("truncated string payload"))?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| bad("string field is not valid UTF-8"))?;
            Ok((Value::Str(s.to_owned()), 1 + n + len))
        }
        TAG_ARRAY => {
            let (count, n) = read_varint(rest)?;
            let count = usize::try_from(count).map_err(|_| bad("array length overflow"))?;
            let mut offset = 1 + n;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let (item, consumed) =
                    decode_value(data.get(offset..).unwrap_or(&[]), depth + 1)?;
                items.push(item);
                offset += consumed;
            }
            Ok((Value::Array(items), offset))
        }
        other => Err(bad(format!("unknown field tag {other:#04x}"))),
    }
}

/// Serialize a field vector into the wire format.
pub fn encode_tuple(fields: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + fields.len() * 4);
    write_varint(&mut buf, fields.len() as u64);
    for field in fields {
        encode_value(&mut buf, field);
    }
    buf
}

/// Parse a wire-format byte slice into a field vector.
///
/// The whole slice must be consumed; trailing garbage is an error.
pub fn decode_tuple(data: &[u8]) -> Result<Vec<Value>> {
    let (count, mut offset) = read_varint(data)?;
    let count = usize::try_from(count).map_err(|_| bad("field count overflow"))?;
    let mut fields = Vec::with_capacity(count.min(128));
    for _ in 0..count {
        let (value, consumed) = decode_value(data.get(offset..).unwrap_or(&[]), 0)?;
        fields.push(value);
        offset += consumed;
    }
    if offset != data.len() {
        return Err(bad(format!(
            "{} trailing bytes after the last field",
            data.len() - offset
        )));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let (got, n) = read_varint(&buf).unwrap();
            assert_eq!(got, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn encode_decode_simple() {
        let fields = vec![Value::Unsigned(1), Value::Str("a".into())];
        let data = encode_tuple(&fields);
        assert_eq!(decode_tuple(&data).unwrap(), fields);
    }

    #[test]
    fn encode_decode_nested_array() {
        let fields = vec![Value::Array(vec![
            Value::Unsigned(1),
            Value::Array(vec![Value::Str("x".into())]),
        ])];
        let data = encode_tuple(&fields);
        assert_eq!(decode_tuple(&data).unwrap(), fields);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut data = encode_tuple(&[Value::Unsigned(1)]);
        data.push(0);
        assert!(decode_tuple(&data).is_err());
    }

    #[test]
    fn truncated_rejected() {
        let data = encode_tuple(&[Value::Str("hello".into())]);
        assert!(decode_tuple(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        // field count 1, then a bogus tag
        let data = [0x01, 0x7f];
        assert!(decode_tuple(&data).is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<u64>().prop_map(Value::Unsigned),
            "[a-z0-9]{0,12}".prop_map(Value::Str),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(fields in prop::collection::vec(arb_value(), 0..6)) {
            let data = encode_tuple(&fields);
            prop_assert_eq!(decode_tuple(&data).unwrap(), fields);
        }
    }
}
