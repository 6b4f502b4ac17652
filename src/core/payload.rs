//! # Payload Codec
//!
//! Schema-driven binary encoding of packet bodies.
//!
//! Packets are bridged to a [`serde_json::Value`] tree with `serde`, then written field
//! by field in schema order. All numbers are big-endian; strings, byte blobs and
//! sequences carry a `u32` length prefix; objects carry a `u16` field count.
//!
//! Decoding is forgiving about *missing* data and strict about *extra* data: an object
//! that encodes fewer fields than the local schema decodes the remainder as zero
//! values, while more fields than the schema knows is rejected.
//!
//! Non-finite floats have no representation and decode as `0.0`.
//!
//! Byte blobs and sequences decode to one JSON value per element, so a body may hold
//! at most [`MAX_DECODED_ELEMENTS`] of them in total.

use bytes::{Buf, BufMut};
use serde_json::{Map, Number, Value};

use crate::core::schema::{FieldKind, Packet, Schema};
use crate::error::{ProtocolError, Result};

/// Blob bytes plus sequence items accepted in one decoded body
pub const MAX_DECODED_ELEMENTS: usize = 1 << 20;

fn malformed(detail: impl Into<String>) -> ProtocolError {
    ProtocolError::SerializationError(detail.into())
}

/// Encode a value tree according to `schema`.
pub fn encode_value(schema: &Schema, value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_object(schema, value, &mut out)?;
    Ok(out)
}

/// Decode a complete body according to `schema`. Trailing bytes are an error.
pub fn decode_value(schema: &Schema, bytes: &[u8]) -> Result<Value> {
    let mut buf = bytes;
    let mut budget = MAX_DECODED_ELEMENTS;
    let value = decode_object(schema, &mut buf, &mut budget)?;
    if buf.has_remaining() {
        return Err(malformed(format!(
            "{} trailing bytes after packet body",
            buf.remaining()
        )));
    }
    Ok(value)
}

pub fn encode_packet<T: Packet>(packet: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(packet)?;
    encode_value(&T::schema(), &value)
}

pub fn decode_packet<T: Packet>(bytes: &[u8]) -> Result<T> {
    let value = decode_value(&T::schema(), bytes)?;
    Ok(serde_json::from_value(value)?)
}

fn encode_object(schema: &Schema, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let empty = Map::new();
    let map = match value {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(malformed(format!("expected object, found {other}"))),
    };

    let count =
        u16::try_from(schema.len()).map_err(|_| malformed("object has more than 65535 fields"))?;
    out.put_u16(count);
    for field in &schema.fields {
        let field_value = map.get(&field.name).unwrap_or(&Value::Null);
        encode_field(&field.kind, field_value, out)
            .map_err(|e| malformed(format!("field '{}': {e}", field.name)))?;
    }
    Ok(())
}

fn put_len(len: usize, out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| malformed("length exceeds u32"))?;
    out.put_u32(len);
    Ok(())
}

fn expect_u64(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| malformed(format!("expected unsigned integer, found {value}")))
}

fn expect_i64(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| malformed(format!("expected integer, found {value}")))
}

fn out_of_range(value: &Value) -> ProtocolError {
    malformed(format!("{value} out of range"))
}

fn encode_field(kind: &FieldKind, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    if value.is_null() {
        write_zero(kind, out);
        return Ok(());
    }

    match kind {
        FieldKind::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| malformed(format!("expected bool, found {value}")))?;
            out.put_u8(u8::from(b));
        }
        FieldKind::U8 => out.put_u8(u8::try_from(expect_u64(value)?).map_err(|_| out_of_range(value))?),
        FieldKind::U16 => {
            out.put_u16(u16::try_from(expect_u64(value)?).map_err(|_| out_of_range(value))?)
        }
        FieldKind::U32 => {
            out.put_u32(u32::try_from(expect_u64(value)?).map_err(|_| out_of_range(value))?)
        }
        FieldKind::U64 => out.put_u64(expect_u64(value)?),
        FieldKind::I32 => {
            out.put_i32(i32::try_from(expect_i64(value)?).map_err(|_| out_of_range(value))?)
        }
        FieldKind::I64 => out.put_i64(expect_i64(value)?),
        FieldKind::F32 => {
            let f = value
                .as_f64()
                .ok_or_else(|| malformed(format!("expected number, found {value}")))?;
            out.put_f32(f as f32);
        }
        FieldKind::F64 => {
            let f = value
                .as_f64()
                .ok_or_else(|| malformed(format!("expected number, found {value}")))?;
            out.put_f64(f);
        }
        FieldKind::String => {
            let s = value
                .as_str()
                .ok_or_else(|| malformed(format!("expected string, found {value}")))?;
            put_len(s.len(), out)?;
            out.put_slice(s.as_bytes());
        }
        FieldKind::Bytes => {
            let items = value
                .as_array()
                .ok_or_else(|| malformed(format!("expected byte array, found {value}")))?;
            put_len(items.len(), out)?;
            for item in items {
                out.put_u8(u8::try_from(expect_u64(item)?).map_err(|_| out_of_range(item))?);
            }
        }
        FieldKind::Sequence(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| malformed(format!("expected sequence, found {value}")))?;
            put_len(items.len(), out)?;
            for item in items {
                encode_field(inner, item, out)?;
            }
        }
        FieldKind::Optional(inner) => {
            out.put_u8(1);
            encode_field(inner, value, out)?;
        }
        FieldKind::Object(schema) => encode_object(schema, value, out)?,
    }
    Ok(())
}

fn write_zero(kind: &FieldKind, out: &mut Vec<u8>) {
    match kind {
        FieldKind::Bool | FieldKind::U8 | FieldKind::Optional(_) => out.put_u8(0),
        FieldKind::U16 => out.put_u16(0),
        FieldKind::U32 | FieldKind::I32 => out.put_u32(0),
        FieldKind::U64 | FieldKind::I64 => out.put_u64(0),
        FieldKind::F32 => out.put_f32(0.0),
        FieldKind::F64 => out.put_f64(0.0),
        FieldKind::String | FieldKind::Bytes | FieldKind::Sequence(_) => out.put_u32(0),
        // zero encoded fields; the decoder fills in the defaults
        FieldKind::Object(_) => out.put_u16(0),
    }
}

/// Zero value of a kind, used for fields a peer did not encode.
pub fn zero_value(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Bool => Value::Bool(false),
        FieldKind::U8
        | FieldKind::U16
        | FieldKind::U32
        | FieldKind::U64
        | FieldKind::I32
        | FieldKind::I64 => Value::Number(Number::from(0)),
        FieldKind::F32 | FieldKind::F64 => float_value(0.0),
        FieldKind::String => Value::String(String::new()),
        FieldKind::Bytes | FieldKind::Sequence(_) => Value::Array(Vec::new()),
        FieldKind::Optional(_) => Value::Null,
        FieldKind::Object(schema) => {
            let map = schema
                .fields
                .iter()
                .map(|f| (f.name.clone(), zero_value(&f.kind)))
                .collect();
            Value::Object(map)
        }
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::Number(Number::from(0)))
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(malformed(format!(
            "truncated body: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_len(buf: &mut &[u8]) -> Result<usize> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    // every encoded element occupies at least one byte
    if len > buf.remaining() {
        return Err(malformed(format!(
            "length {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(len)
}

/// Charge `len` elements against the remaining budget.
fn spend(budget: &mut usize, len: usize) -> Result<()> {
    *budget = budget.checked_sub(len).ok_or_else(|| {
        malformed(format!(
            "body decodes to more than {MAX_DECODED_ELEMENTS} sequence elements"
        ))
    })?;
    Ok(())
}

fn decode_object(schema: &Schema, buf: &mut &[u8], budget: &mut usize) -> Result<Value> {
    need(buf, 2)?;
    let count = buf.get_u16() as usize;
    if count > schema.len() {
        return Err(malformed(format!(
            "object encodes {count} fields but the schema has {}",
            schema.len()
        )));
    }

    let mut map = Map::with_capacity(schema.len());
    for (index, field) in schema.fields.iter().enumerate() {
        let value = if index < count {
            decode_field(&field.kind, buf, budget)
                .map_err(|e| malformed(format!("field '{}': {e}", field.name)))?
        } else {
            zero_value(&field.kind)
        };
        map.insert(field.name.clone(), value);
    }
    Ok(Value::Object(map))
}

fn decode_field(kind: &FieldKind, buf: &mut &[u8], budget: &mut usize) -> Result<Value> {
    let value = match kind {
        FieldKind::Bool => {
            need(buf, 1)?;
            Value::Bool(buf.get_u8() != 0)
        }
        FieldKind::U8 => {
            need(buf, 1)?;
            Value::from(buf.get_u8())
        }
        FieldKind::U16 => {
            need(buf, 2)?;
            Value::from(buf.get_u16())
        }
        FieldKind::U32 => {
            need(buf, 4)?;
            Value::from(buf.get_u32())
        }
        FieldKind::U64 => {
            need(buf, 8)?;
            Value::from(buf.get_u64())
        }
        FieldKind::I32 => {
            need(buf, 4)?;
            Value::from(buf.get_i32())
        }
        FieldKind::I64 => {
            need(buf, 8)?;
            Value::from(buf.get_i64())
        }
        FieldKind::F32 => {
            need(buf, 4)?;
            float_value(f64::from(buf.get_f32()))
        }
        FieldKind::F64 => {
            need(buf, 8)?;
            float_value(buf.get_f64())
        }
        FieldKind::String => {
            let len = get_len(buf)?;
            let text = std::str::from_utf8(&buf[..len])
                .map_err(|e| malformed(format!("invalid utf-8: {e}")))?
                .to_owned();
            buf.advance(len);
            Value::String(text)
        }
        FieldKind::Bytes => {
            let len = get_len(buf)?;
            spend(budget, len)?;
            let items = buf[..len].iter().map(|b| Value::from(*b)).collect();
            buf.advance(len);
            Value::Array(items)
        }
        FieldKind::Sequence(inner) => {
            let len = get_len(buf)?;
            spend(budget, len)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_field(inner, buf, budget)?);
            }
            Value::Array(items)
        }
        FieldKind::Optional(inner) => {
            need(buf, 1)?;
            match buf.get_u8() {
                0 => Value::Null,
                1 => decode_field(inner, buf, budget)?,
                tag => return Err(malformed(format!("invalid optional tag {tag}"))),
            }
        }
        FieldKind::Object(schema) => decode_object(schema, buf, budget)?,
    };
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Address {
        street: String,
        number: u16,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Student {
        id: u64,
        name: String,
        grades: Vec<f64>,
        active: bool,
        address: Address,
        nickname: Option<String>,
        avatar: Vec<u8>,
        offset: i32,
    }

    fn address_schema() -> Schema {
        Schema::new()
            .field("street", FieldKind::String)
            .field("number", FieldKind::U16)
    }

    impl Packet for Student {
        const NAME: &'static str = "test.Student";

        fn schema() -> Schema {
            Schema::new()
                .field("id", FieldKind::U64)
                .field("name", FieldKind::String)
                .field("grades", FieldKind::sequence(FieldKind::F64))
                .field("active", FieldKind::Bool)
                .field("address", FieldKind::Object(address_schema()))
                .field("nickname", FieldKind::optional(FieldKind::String))
                .field("avatar", FieldKind::Bytes)
                .field("offset", FieldKind::I32)
        }
    }

    fn student() -> Student {
        Student {
            id: 42,
            name: "Ada".into(),
            grades: vec![1.5, 2.0, 3.25],
            active: true,
            address: Address {
                street: "Main".into(),
                number: 7,
            },
            nickname: Some("countess".into()),
            avatar: vec![0, 255, 7],
            offset: -12,
        }
    }

    #[test]
    fn test_nested_packet_roundtrip() {
        let original = student();
        let bytes = encode_packet(&original).unwrap();
        let decoded: Student = decode_packet(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_none_optional_roundtrip() {
        let mut original = student();
        original.nickname = None;
        let bytes = encode_packet(&original).unwrap();
        let decoded: Student = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.nickname, None);
    }

    #[test]
    fn test_big_endian_layout() {
        let schema = Schema::new().field("v", FieldKind::U32);
        let bytes = encode_value(&schema, &json!({ "v": 0x01020304u32 })).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        // a peer with an older shape only encoded the first two fields
        let short = Schema::new()
            .field("id", FieldKind::U64)
            .field("name", FieldKind::String);
        let bytes = encode_value(&short, &json!({ "id": 9, "name": "Bo" })).unwrap();

        let decoded: Student = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.name, "Bo");
        assert!(decoded.grades.is_empty());
        assert!(!decoded.active);
        assert_eq!(decoded.address.street, "");
        assert_eq!(decoded.nickname, None);
        assert_eq!(decoded.offset, 0);
    }

    #[test]
    fn test_null_values_encode_as_zero() {
        let schema = Schema::new()
            .field("n", FieldKind::I64)
            .field("s", FieldKind::String);
        let bytes = encode_value(&schema, &json!({})).unwrap();
        let value = decode_value(&schema, &bytes).unwrap();
        assert_eq!(value, json!({ "n": 0, "s": "" }));
    }

    #[test]
    fn test_extra_fields_rejected() {
        let long = Schema::new()
            .field("a", FieldKind::U8)
            .field("b", FieldKind::U8);
        let short = Schema::new().field("a", FieldKind::U8);
        let bytes = encode_value(&long, &json!({ "a": 1, "b": 2 })).unwrap();
        assert!(decode_value(&short, &bytes).is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let schema = Schema::new().field("v", FieldKind::U8);
        assert!(encode_value(&schema, &json!({ "v": 300 })).is_err());
        assert!(encode_value(&schema, &json!({ "v": -1 })).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = encode_packet(&student()).unwrap();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode_packet::<Student>(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_huge_sequence_length_rejected_without_allocation() {
        let schema = Schema::new().field("items", FieldKind::sequence(FieldKind::U8));
        let mut bytes = vec![0x00, 0x01];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_value(&schema, &bytes).is_err());
    }

    fn blob_body(lens: &[usize]) -> Vec<u8> {
        let mut bytes = (lens.len() as u16).to_be_bytes().to_vec();
        for &len in lens {
            bytes.extend_from_slice(&(len as u32).to_be_bytes());
            bytes.resize(bytes.len() + len, 0xAB);
        }
        bytes
    }

    #[test]
    fn test_blob_over_element_budget_rejected() {
        let schema = Schema::new().field("blob", FieldKind::Bytes);
        let err = decode_value(&schema, &blob_body(&[MAX_DECODED_ELEMENTS + 1])).unwrap_err();
        assert!(err.to_string().contains("sequence elements"), "{err}");
    }

    #[test]
    fn test_element_budget_spans_the_whole_body() {
        let half = MAX_DECODED_ELEMENTS / 2 + 1;
        let one = Schema::new().field("a", FieldKind::Bytes);
        assert!(decode_value(&one, &blob_body(&[half])).is_ok());

        let two = one.clone().field("b", FieldKind::Bytes);
        assert!(decode_value(&two, &blob_body(&[half, half])).is_err());
    }
}
