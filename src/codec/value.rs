// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::CodecError;
use crate::schema::{Field, FieldKind, FieldLayout};

/// Decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Enum(String),
    Set(Vec<String>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Json(serde_json::Value),
    Reference(u64),
    References(Vec<u64>),
    Struct(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) | Value::Reference(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) | Value::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::Uint(v) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::Uint(v as u64) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Text(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Text(v) }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self { Value::DateTime(v) }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self { Value::Date(v) }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self { Value::Json(v) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

pub(crate) fn round_float(value: f64, precision: u8) -> f64 {
    // past 15 digits an f64 has nothing left to round
    if precision > 15 {
        return value;
    }
    let factor = 10f64.powi(precision as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

fn mismatch(field: &Field, expected: &'static str) -> CodecError {
    CodecError::TypeMismatch {
        field: field.name.clone(),
        expected,
    }
}

/// Zero value of a field: what a fresh record holds and what `Null` means
/// for non-nullable kinds.
pub fn default_value(field: &Field) -> Value {
    if field.nullable {
        return Value::Null;
    }
    match &field.kind {
        FieldKind::Uint { .. } => Value::Uint(0),
        FieldKind::Int { .. } => Value::Int(0),
        FieldKind::Bool => Value::Bool(false),
        FieldKind::Float { .. } => Value::Float(0.0),
        FieldKind::Text => Value::Text(String::new()),
        FieldKind::Struct(layout) => Value::Struct(default_values(layout)),
        _ => Value::Null,
    }
}

pub fn default_values(layout: &FieldLayout) -> Vec<Value> {
    layout.fields().iter().map(default_value).collect()
}

/// Coerce a caller-supplied value into the canonical form for `field`.
///
/// Canonical values encode and decode to themselves, which is what makes
/// snapshot comparison a valid dirty check.
pub fn normalize(field: &Field, value: Value) -> Result<Value, CodecError> {
    if value.is_null() {
        return Ok(default_value(field));
    }
    let normalized = match (&field.kind, value) {
        (FieldKind::Uint { bits }, Value::Uint(v)) => check_uint(field, *bits, v)?,
        (FieldKind::Uint { bits }, Value::Int(v)) if v >= 0 => check_uint(field, *bits, v as u64)?,
        (FieldKind::Int { bits }, Value::Int(v)) => check_int(field, *bits, v)?,
        (FieldKind::Int { bits }, Value::Uint(v)) => {
            let v = i64::try_from(v).map_err(|_| mismatch(field, "signed integer"))?;
            check_int(field, *bits, v)?
        }
        (FieldKind::Bool, Value::Bool(v)) => Value::Bool(v),
        (FieldKind::Float { .. }, Value::Float(v)) if !v.is_finite() => return Err(mismatch(field, "finite float")),
        (FieldKind::Float { precision }, Value::Float(v)) => Value::Float(round_float(v, *precision)),
        (FieldKind::Float { precision }, Value::Int(v)) => Value::Float(round_float(v as f64, *precision)),
        (FieldKind::Float { precision }, Value::Uint(v)) => Value::Float(round_float(v as f64, *precision)),
        (FieldKind::Text, Value::Text(v)) => Value::Text(v),
        (FieldKind::Bytes, Value::Bytes(v)) => {
            if v.is_empty() { Value::Null } else { Value::Bytes(v) }
        }
        (FieldKind::DateTime, Value::DateTime(v)) => {
            let v = v.with_nanosecond(0).unwrap_or(v);
            if !field.nullable && v.and_utc().timestamp() == 0 { Value::Null } else { Value::DateTime(v) }
        }
        (FieldKind::DateTime, Value::Date(v)) => {
            normalize(field, Value::DateTime(v.and_time(NaiveTime::MIN)))?
        }
        (FieldKind::Date, Value::Date(v)) => {
            if !field.nullable && v.and_time(NaiveTime::MIN).and_utc().timestamp() == 0 { Value::Null } else { Value::Date(v) }
        }
        (FieldKind::Date, Value::DateTime(v)) => normalize(field, Value::Date(v.date()))?,
        (FieldKind::Enum(def), Value::Enum(v)) | (FieldKind::Enum(def), Value::Text(v)) => {
            if v.is_empty() {
                Value::Null
            } else if def.index_of(&v) == 0 {
                return Err(CodecError::InvalidEnumValue { field: field.name.clone(), value: v });
            } else {
                Value::Enum(v)
            }
        }
        (FieldKind::Set(def), Value::Set(values)) => {
            let mut indexes = Vec::with_capacity(values.len());
            for v in values {
                let index = def.index_of(&v);
                if index == 0 {
                    return Err(CodecError::InvalidEnumValue { field: field.name.clone(), value: v });
                }
                indexes.push(index);
            }
            indexes.sort_unstable();
            indexes.dedup();
            if indexes.is_empty() {
                Value::Null
            } else {
                Value::Set(
                    indexes
                        .into_iter()
                        .filter_map(|i| def.value_at(i).map(str::to_string))
                        .collect(),
                )
            }
        }
        (FieldKind::Json, Value::Json(v)) => {
            if v.is_null() { Value::Null } else { Value::Json(v) }
        }
        (FieldKind::Reference { .. }, Value::Reference(id)) | (FieldKind::Reference { .. }, Value::Uint(id)) => {
            if id == 0 { Value::Null } else { Value::Reference(id) }
        }
        (FieldKind::References { .. }, Value::References(ids)) => {
            if ids.is_empty() { Value::Null } else { Value::References(ids) }
        }
        (FieldKind::Struct(layout), Value::Struct(values)) => {
            if values.len() != layout.len() {
                return Err(mismatch(field, "struct with matching field count"));
            }
            let values = layout
                .fields()
                .iter()
                .zip(values)
                .map(|(f, v)| normalize(f, v))
                .collect::<Result<Vec<_>, _>>()?;
            Value::Struct(values)
        }
        (kind, _) => return Err(mismatch(field, kind_name(kind))),
    };
    Ok(normalized)
}

fn check_uint(field: &Field, bits: u8, v: u64) -> Result<Value, CodecError> {
    if bits < 64 && v >= 1u64 << bits {
        return Err(mismatch(field, "unsigned integer within size class"));
    }
    Ok(Value::Uint(v))
}

fn check_int(field: &Field, bits: u8, v: i64) -> Result<Value, CodecError> {
    if bits < 64 {
        let max = (1i64 << (bits - 1)) - 1;
        if v > max || v < -max - 1 {
            return Err(mismatch(field, "signed integer within size class"));
        }
    }
    Ok(Value::Int(v))
}

pub(crate) fn kind_name(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Uint { .. } => "unsigned integer",
        FieldKind::Int { .. } => "signed integer",
        FieldKind::Bool => "bool",
        FieldKind::Float { .. } => "float",
        FieldKind::Text => "text",
        FieldKind::Bytes => "bytes",
        FieldKind::DateTime => "datetime",
        FieldKind::Date => "date",
        FieldKind::Enum(_) => "enum",
        FieldKind::Set(_) => "set",
        FieldKind::Json => "json",
        FieldKind::Reference { .. } => "reference",
        FieldKind::References { .. } => "references",
        FieldKind::Struct(_) => "struct",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumDefinition, FieldDescriptor};
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
                FieldDescriptor::uint("Small").bits(8),
                FieldDescriptor::float("Price", 2),
                FieldDescriptor::set("Colors", "color"),
                FieldDescriptor::text("Name"),
                FieldDescriptor::uint("Age").nullable(),
                FieldDescriptor::reference("Owner", "User"),
            ],
            "",
            &enums,
        )
        .unwrap()
    }

    #[test]
    fn test_size_class_overflow() {
        let layout = layout();
        assert!(normalize(layout.field(0), Value::Uint(255)).is_ok());
        assert!(normalize(layout.field(0), Value::Uint(256)).is_err());
    }

    #[test]
    fn test_float_rounded_to_precision() {
        let layout = layout();
        assert_eq!(normalize(layout.field(1), Value::Float(1.23456)).unwrap(), Value::Float(1.23));
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        let layout = layout();
        assert!(normalize(layout.field(1), Value::Float(f64::NAN)).is_err());
        assert!(normalize(layout.field(1), Value::Float(f64::INFINITY)).is_err());
        assert_eq!(round_float(1e308, 2), 1e308);
        assert_eq!(round_float(0.1234, 40), 0.1234);
    }

    #[test]
    fn test_set_sorted_by_declaration_and_deduped() {
        let layout = layout();
        let set = Value::Set(vec!["blue".into(), "red".into(), "blue".into()]);
        assert_eq!(
            normalize(layout.field(2), set).unwrap(),
            Value::Set(vec!["red".into(), "blue".into()])
        );
        assert_eq!(normalize(layout.field(2), Value::Set(vec![])).unwrap(), Value::Null);
        assert!(normalize(layout.field(2), Value::Set(vec!["pink".into()])).is_err());
    }

    #[test]
    fn test_null_becomes_zero_unless_nullable() {
        let layout = layout();
        assert_eq!(normalize(layout.field(3), Value::Null).unwrap(), Value::Text(String::new()));
        assert_eq!(normalize(layout.field(4), Value::Null).unwrap(), Value::Null);
        assert_eq!(normalize(layout.field(5), Value::Uint(0)).unwrap(), Value::Null);
    }

    #[test]
    fn test_type_mismatch() {
        let layout = layout();
        let err = normalize(layout.field(3), Value::Bool(true)).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { expected: "text", .. }));
    }
}
