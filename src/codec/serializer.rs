// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot wire format.
//!
//! ```text
//! [version: u8] [field 0] [field 1] ...   fields in WireGroup order
//!
//! uint, enum, reference   uvarint (enum 1-based, 0 = unset; reference 0 = null)
//! int, datetime, date     zigzag varint (unix seconds, 0 = unset)
//! bool                    one byte
//! float                   f64 little endian, rounded to precision first
//! text, bytes, json       uvarint length + bytes (json "" = null)
//! set, references         uvarint count + uvarint items
//! nullable scalars        presence byte, value only when present
//! struct                  nested fields, same algorithm
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use super::value::{round_float, Value};
use super::CodecError;
use crate::schema::{Field, FieldKind, FieldLayout};

pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_uvarint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    pub fn write_varint(&mut self, v: i64) {
        self.write_uvarint(((v << 1) ^ (v >> 63)) as u64);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_uvarint(v.len() as u64);
        self.buf.extend_from_slice(v);
    }
}

pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn read_uvarint(&mut self) -> Result<u64, CodecError> {
        let mut result = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.read_u8()?;
            result |= ((b & 0x7f) as u64) << shift;
            if b < 0x80 {
                return Ok(result);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    pub fn read_varint(&mut self) -> Result<i64, CodecError> {
        let v = self.read_uvarint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let end = self.pos + 8;
        let bytes = self.buf.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        self.pos = end;
        Ok(f64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_uvarint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::UnexpectedEof)?;
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Encode normalized values into a versioned snapshot.
pub fn encode(layout: &FieldLayout, values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut ser = Serializer::new();
    ser.write_u8(SNAPSHOT_VERSION);
    write_layout(&mut ser, layout, values)?;
    Ok(ser.into_bytes())
}

/// Decode every field of a snapshot, indexed by declaration order.
pub fn decode(layout: &FieldLayout, bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    let mut de = open(bytes)?;
    let values = read_layout(&mut de, layout)?;
    if de.remaining() > 0 {
        return Err(CodecError::TrailingBytes(de.remaining()));
    }
    Ok(values)
}

/// Decode a single top-level field, stopping as soon as it has been read.
pub fn decode_field(layout: &FieldLayout, bytes: &[u8], index: usize) -> Result<Value, CodecError> {
    let mut de = open(bytes)?;
    for &i in layout.wire_order() {
        let value = read_field(&mut de, layout.field(i))?;
        if i == index {
            return Ok(value);
        }
    }
    Err(CodecError::UnknownField(index))
}

fn open(bytes: &[u8]) -> Result<Deserializer<'_>, CodecError> {
    let mut de = Deserializer::new(bytes);
    let version = de.read_u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(CodecError::VersionMismatch(version));
    }
    Ok(de)
}

fn write_layout(ser: &mut Serializer, layout: &FieldLayout, values: &[Value]) -> Result<(), CodecError> {
    if values.len() != layout.len() {
        return Err(CodecError::FieldCount { expected: layout.len(), actual: values.len() });
    }
    for &i in layout.wire_order() {
        write_field(ser, layout.field(i), &values[i])?;
    }
    Ok(())
}

fn read_layout(de: &mut Deserializer<'_>, layout: &FieldLayout) -> Result<Vec<Value>, CodecError> {
    let mut values = vec![Value::Null; layout.len()];
    for &i in layout.wire_order() {
        values[i] = read_field(de, layout.field(i))?;
    }
    Ok(values)
}

fn type_error(field: &Field) -> CodecError {
    CodecError::TypeMismatch {
        field: field.name.clone(),
        expected: super::value::kind_name(&field.kind),
    }
}

fn unix_seconds(dt: &NaiveDateTime) -> i64 {
    dt.and_utc().timestamp()
}

fn date_seconds(d: &NaiveDate) -> i64 {
    d.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn write_field(ser: &mut Serializer, field: &Field, value: &Value) -> Result<(), CodecError> {
    if field.nullable {
        ser.write_bool(!value.is_null());
        if value.is_null() {
            return Ok(());
        }
    }
    match (&field.kind, value) {
        (FieldKind::Uint { .. }, Value::Uint(v)) => ser.write_uvarint(*v),
        (FieldKind::Int { .. }, Value::Int(v)) => ser.write_varint(*v),
        (FieldKind::Bool, Value::Bool(v)) => ser.write_bool(*v),
        (FieldKind::Float { precision }, Value::Float(v)) => ser.write_f64(round_float(*v, *precision)),
        (FieldKind::Text, Value::Text(v)) => ser.write_bytes(v.as_bytes()),
        (FieldKind::Bytes, Value::Bytes(v)) => ser.write_bytes(v),
        (FieldKind::Bytes, Value::Null) => ser.write_uvarint(0),
        (FieldKind::DateTime, Value::DateTime(v)) => ser.write_varint(unix_seconds(v)),
        (FieldKind::DateTime, Value::Null) => ser.write_varint(0),
        (FieldKind::Date, Value::Date(v)) => ser.write_varint(date_seconds(v)),
        (FieldKind::Date, Value::Null) => ser.write_varint(0),
        (FieldKind::Enum(def), Value::Enum(v)) => ser.write_uvarint(def.index_of(v)),
        (FieldKind::Enum(_), Value::Null) => ser.write_uvarint(0),
        (FieldKind::Set(def), Value::Set(values)) => {
            ser.write_uvarint(values.len() as u64);
            for v in values {
                ser.write_uvarint(def.index_of(v));
            }
        }
        (FieldKind::Set(_), Value::Null) => ser.write_uvarint(0),
        (FieldKind::Json, Value::Json(v)) => {
            let text = serde_json::to_string(v).map_err(|e| CodecError::Json(e.to_string()))?;
            ser.write_bytes(text.as_bytes());
        }
        (FieldKind::Json, Value::Null) => ser.write_uvarint(0),
        (FieldKind::Reference { .. }, Value::Reference(id)) => ser.write_uvarint(*id),
        (FieldKind::Reference { .. }, Value::Null) => ser.write_uvarint(0),
        (FieldKind::References { .. }, Value::References(ids)) => {
            ser.write_uvarint(ids.len() as u64);
            for id in ids {
                ser.write_uvarint(*id);
            }
        }
        (FieldKind::References { .. }, Value::Null) => ser.write_uvarint(0),
        (FieldKind::Struct(layout), Value::Struct(values)) => write_layout(ser, layout, values)?,
        _ => return Err(type_error(field)),
    }
    Ok(())
}

fn read_field(de: &mut Deserializer<'_>, field: &Field) -> Result<Value, CodecError> {
    if field.nullable && !de.read_bool()? {
        return Ok(Value::Null);
    }
    let value = match &field.kind {
        FieldKind::Uint { .. } => Value::Uint(de.read_uvarint()?),
        FieldKind::Int { .. } => Value::Int(de.read_varint()?),
        FieldKind::Bool => Value::Bool(de.read_bool()?),
        FieldKind::Float { .. } => Value::Float(de.read_f64()?),
        FieldKind::Text => Value::Text(de.read_string()?),
        FieldKind::Bytes => {
            let bytes = de.read_bytes()?;
            if bytes.is_empty() { Value::Null } else { Value::Bytes(bytes.to_vec()) }
        }
        FieldKind::DateTime => {
            let secs = de.read_varint()?;
            if secs == 0 && !field.nullable {
                Value::Null
            } else {
                let dt = DateTime::from_timestamp(secs, 0).ok_or(CodecError::InvalidTimestamp(secs))?;
                Value::DateTime(dt.naive_utc())
            }
        }
        FieldKind::Date => {
            let secs = de.read_varint()?;
            if secs == 0 && !field.nullable {
                Value::Null
            } else {
                let dt = DateTime::from_timestamp(secs, 0).ok_or(CodecError::InvalidTimestamp(secs))?;
                Value::Date(dt.date_naive())
            }
        }
        FieldKind::Enum(def) => {
            let index = de.read_uvarint()?;
            if index == 0 {
                Value::Null
            } else {
                let v = def.value_at(index).ok_or(CodecError::InvalidEnumIndex(index))?;
                Value::Enum(v.to_string())
            }
        }
        FieldKind::Set(def) => {
            let count = de.read_uvarint()?;
            if count == 0 {
                Value::Null
            } else {
                let mut values = Vec::new();
                for _ in 0..count {
                    let index = de.read_uvarint()?;
                    let v = def.value_at(index).ok_or(CodecError::InvalidEnumIndex(index))?;
                    values.push(v.to_string());
                }
                Value::Set(values)
            }
        }
        FieldKind::Json => {
            let text = de.read_string()?;
            if text.is_empty() {
                Value::Null
            } else {
                Value::Json(serde_json::from_str(&text).map_err(|e| CodecError::Json(e.to_string()))?)
            }
        }
        FieldKind::Reference { .. } => match de.read_uvarint()? {
            0 => Value::Null,
            id => Value::Reference(id),
        },
        FieldKind::References { .. } => {
            let count = de.read_uvarint()?;
            if count == 0 {
                Value::Null
            } else {
                let mut ids = Vec::new();
                for _ in 0..count {
                    ids.push(de.read_uvarint()?);
                }
                Value::References(ids)
            }
        }
        FieldKind::Struct(layout) => Value::Struct(read_layout(de, layout)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::{default_values, normalize};
    use crate::schema::{EnumDefinition, FieldDescriptor};
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn layout() -> FieldLayout {
        let mut enums = HashMap::new();
        enums.insert(
            "color".to_string(),
            Arc::new(EnumDefinition::new("color", &["red", "green", "blue"]).unwrap()),
        );
        FieldLayout::build(
            &[
                FieldDescriptor::text("Name"),
                FieldDescriptor::uint("Age").nullable(),
                FieldDescriptor::int("Balance"),
                FieldDescriptor::enumeration("Color", "color"),
                FieldDescriptor::set("Tags", "color"),
                FieldDescriptor::datetime("Created"),
                FieldDescriptor::date("Birthday").nullable(),
                FieldDescriptor::float("Price", 2).nullable(),
                FieldDescriptor::reference("Owner", "User"),
                FieldDescriptor::references("Friends", "User"),
                FieldDescriptor::json("Meta"),
                FieldDescriptor::structure(
                    "Address",
                    vec![FieldDescriptor::text("City"), FieldDescriptor::boolean("Verified").nullable()],
                ),
            ],
            "",
            &enums,
        )
        .unwrap()
    }

    fn sample(layout: &FieldLayout) -> Vec<Value> {
        let raw = vec![
            Value::from("John"),
            Value::Uint(18),
            Value::Int(-42),
            Value::Enum("green".into()),
            Value::Set(vec!["blue".into(), "red".into()]),
            Value::DateTime(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(10, 30, 0).unwrap()),
            Value::Date(NaiveDate::from_ymd_opt(1990, 2, 3).unwrap()),
            Value::Float(9.991),
            Value::Reference(7),
            Value::References(vec![3, 1]),
            Value::Json(json!({"a": [1, 2]})),
            Value::Struct(vec![Value::from("Berlin"), Value::Bool(false)]),
        ];
        layout.fields().iter().zip(raw).map(|(f, v)| normalize(f, v).unwrap()).collect()
    }

    #[test]
    fn test_round_trip_all_groups() {
        let layout = layout();
        let values = sample(&layout);
        let bytes = encode(&layout, &values).unwrap();
        assert_eq!(bytes[0], SNAPSHOT_VERSION);
        assert_eq!(decode(&layout, &bytes).unwrap(), values);
    }

    #[test]
    fn test_round_trip_defaults_keeps_null_and_zero_apart() {
        let layout = layout();
        let mut values = default_values(&layout);
        values[2] = Value::Int(0);
        let decoded = decode(&layout, &encode(&layout, &values).unwrap()).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoded[1], Value::Null);
        assert_eq!(decoded[2], Value::Int(0));

        values[1] = Value::Uint(0);
        let decoded = decode(&layout, &encode(&layout, &values).unwrap()).unwrap();
        assert_eq!(decoded[1], Value::Uint(0));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let layout = layout();
        let values = sample(&layout);
        assert_eq!(encode(&layout, &values).unwrap(), encode(&layout, &values.clone()).unwrap());
    }

    #[test]
    fn test_decode_single_field() {
        let layout = layout();
        let values = sample(&layout);
        let bytes = encode(&layout, &values).unwrap();
        assert_eq!(decode_field(&layout, &bytes, 0).unwrap(), Value::from("John"));
        assert_eq!(decode_field(&layout, &bytes, 8).unwrap(), Value::Reference(7));
        assert!(matches!(decode_field(&layout, &bytes, 99), Err(CodecError::UnknownField(99))));
    }

    #[test]
    fn test_rejects_truncated_and_foreign_bytes() {
        let layout = layout();
        let bytes = encode(&layout, &sample(&layout)).unwrap();
        assert!(decode(&layout, &bytes[..bytes.len() - 1]).is_err());
        assert!(matches!(decode(&layout, b"\x00nil"), Err(CodecError::VersionMismatch(0))));
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(matches!(decode(&layout, &extra), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn test_varint_edges() {
        let mut ser = Serializer::new();
        for v in [0i64, -1, 1, i64::MIN, i64::MAX] {
            ser.write_varint(v);
        }
        ser.write_uvarint(u64::MAX);
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        for v in [0i64, -1, 1, i64::MIN, i64::MAX] {
            assert_eq!(de.read_varint().unwrap(), v);
        }
        assert_eq!(de.read_uvarint().unwrap(), u64::MAX);
    }
}
