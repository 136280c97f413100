// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conversion between decoded values and storage columns.
//!
//! Times cross the storage boundary shifted by the engine's time offset:
//! added on the way in, removed on the way out.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::value::{default_value, normalize, Value};
use super::CodecError;
use crate::schema::{Field, FieldKind, FieldLayout};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single column value as exchanged with storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::Uint(v) => Some(*v),
            SqlValue::Int(v) if *v >= 0 => Some(*v as u64),
            SqlValue::Text(v) => v.parse().ok(),
            _ => None,
        }
    }

    /// Text form, used for unique keys and loose comparisons.
    pub fn render(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Uint(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            SqlValue::Text(v) => Some(v),
            SqlValue::Bytes(v) => String::from_utf8(v).ok(),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Uint(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Null => None,
        }
    }
}

/// Column name to value; the minimal set of columns for one write.
pub type Bind = BTreeMap<String, SqlValue>;

fn to_sql(field: &Field, value: &Value, offset: i64) -> Result<SqlValue, CodecError> {
    let sql = match value {
        Value::Null => SqlValue::Null,
        Value::Text(v) if v.is_empty() && !field.required && !field.nullable => SqlValue::Null,
        Value::Text(v) | Value::Enum(v) => SqlValue::Text(v.clone()),
        Value::Bool(v) => SqlValue::Int(*v as i64),
        Value::Int(v) => SqlValue::Int(*v),
        Value::Uint(v) | Value::Reference(v) => SqlValue::Uint(*v),
        Value::Float(v) => SqlValue::Float(*v),
        Value::Bytes(v) => SqlValue::Bytes(v.clone()),
        Value::Set(v) => SqlValue::Text(v.join(",")),
        Value::DateTime(v) => {
            SqlValue::Text((*v + Duration::seconds(offset)).format(DATETIME_FORMAT).to_string())
        }
        Value::Date(v) => SqlValue::Text(v.format(DATE_FORMAT).to_string()),
        Value::Json(v) => SqlValue::Text(serde_json::to_string(v).map_err(|e| CodecError::Json(e.to_string()))?),
        Value::References(ids) => {
            SqlValue::Text(serde_json::to_string(ids).map_err(|e| CodecError::Json(e.to_string()))?)
        }
        Value::Struct(_) => {
            return Err(CodecError::TypeMismatch { field: field.name.clone(), expected: "scalar column" })
        }
    };
    Ok(sql)
}

fn column_error(field: &Field, value: &str) -> CodecError {
    CodecError::InvalidColumn {
        column: field.column.clone(),
        value: value.to_string(),
    }
}

fn parse_datetime(field: &Field, text: &str) -> Result<Option<NaiveDateTime>, CodecError> {
    if text.is_empty() || text.starts_with("0000-00-00") {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(Some)
        .map_err(|_| column_error(field, text))
}

fn from_sql(field: &Field, value: SqlValue, offset: i64) -> Result<Value, CodecError> {
    if value.is_null() {
        return Ok(default_value(field));
    }
    let decoded = match &field.kind {
        FieldKind::Uint { .. } | FieldKind::Reference { .. } => match value {
            SqlValue::Uint(v) => Value::Uint(v),
            SqlValue::Int(v) if v >= 0 => Value::Uint(v as u64),
            other => {
                let text = other.into_text().unwrap_or_default();
                Value::Uint(text.parse().map_err(|_| column_error(field, &text))?)
            }
        },
        FieldKind::Int { .. } => match value {
            SqlValue::Int(v) => Value::Int(v),
            SqlValue::Uint(v) => Value::Uint(v),
            other => {
                let text = other.into_text().unwrap_or_default();
                Value::Int(text.parse().map_err(|_| column_error(field, &text))?)
            }
        },
        FieldKind::Bool => match value {
            SqlValue::Int(v) => Value::Bool(v != 0),
            SqlValue::Uint(v) => Value::Bool(v != 0),
            other => {
                let text = other.into_text().unwrap_or_default();
                Value::Bool(text == "1" || text.eq_ignore_ascii_case("true"))
            }
        },
        FieldKind::Float { .. } => match value {
            SqlValue::Float(v) => Value::Float(v),
            SqlValue::Int(v) => Value::Float(v as f64),
            SqlValue::Uint(v) => Value::Float(v as f64),
            other => {
                let text = other.into_text().unwrap_or_default();
                Value::Float(text.parse().map_err(|_| column_error(field, &text))?)
            }
        },
        FieldKind::Bytes => match value {
            SqlValue::Bytes(v) => Value::Bytes(v),
            other => Value::Bytes(other.into_text().unwrap_or_default().into_bytes()),
        },
        _ => {
            let text = value.into_text().ok_or_else(|| column_error(field, "<binary>"))?;
            match &field.kind {
                FieldKind::Text => Value::Text(text),
                FieldKind::Enum(_) => Value::Enum(text),
                FieldKind::Set(_) => {
                    Value::Set(text.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                }
                FieldKind::DateTime => match parse_datetime(field, &text)? {
                    Some(dt) => Value::DateTime(dt - Duration::seconds(offset)),
                    None => Value::Null,
                },
                FieldKind::Date => {
                    if text.starts_with("0000-00-00") {
                        Value::Null
                    } else {
                        let date_part = text.get(..10).unwrap_or(&text);
                        Value::Date(
                            NaiveDate::parse_from_str(date_part, DATE_FORMAT)
                                .map_err(|_| column_error(field, &text))?,
                        )
                    }
                }
                FieldKind::Json => {
                    Value::Json(serde_json::from_str(&text).map_err(|_| column_error(field, &text))?)
                }
                FieldKind::References { .. } => Value::References(
                    serde_json::from_str(&text).map_err(|_| column_error(field, &text))?,
                ),
                _ => return Err(column_error(field, &text)),
            }
        }
    };
    normalize(field, decoded)
}

fn collect_columns(
    layout: &FieldLayout,
    values: &[Value],
    offset: i64,
    out: &mut Vec<(String, SqlValue)>,
) -> Result<(), CodecError> {
    for (field, value) in layout.fields().iter().zip(values) {
        match (&field.kind, value) {
            (FieldKind::Struct(nested), Value::Struct(nested_values)) => {
                collect_columns(nested, nested_values, offset, out)?
            }
            _ => out.push((field.column.clone(), to_sql(field, value, offset)?)),
        }
    }
    Ok(())
}

/// Every column with its storage value, in declaration order.
pub fn to_columns(layout: &FieldLayout, values: &[Value], offset: i64) -> Result<Vec<(String, SqlValue)>, CodecError> {
    let mut out = Vec::with_capacity(layout.len());
    collect_columns(layout, values, offset, &mut out)?;
    Ok(out)
}

/// Unconditional bind used for inserts.
pub fn full_bind(layout: &FieldLayout, values: &[Value], offset: i64) -> Result<Bind, CodecError> {
    Ok(to_columns(layout, values, offset)?.into_iter().collect())
}

/// Old and new binds holding only the columns whose values differ.
pub fn diff(layout: &FieldLayout, old: &[Value], new: &[Value], offset: i64) -> Result<(Bind, Bind), CodecError> {
    let old_columns = to_columns(layout, old, offset)?;
    let new_columns = to_columns(layout, new, offset)?;
    let mut old_bind = Bind::new();
    let mut new_bind = Bind::new();
    for ((column, before), (_, after)) in old_columns.into_iter().zip(new_columns) {
        if before != after {
            old_bind.insert(column.clone(), before);
            new_bind.insert(column, after);
        }
    }
    Ok((old_bind, new_bind))
}

fn read_columns<I>(layout: &FieldLayout, row: &mut I, offset: i64) -> Result<Vec<Value>, CodecError>
where
    I: Iterator<Item = SqlValue>,
{
    let mut values = Vec::with_capacity(layout.len());
    for field in layout.fields() {
        let value = match &field.kind {
            FieldKind::Struct(nested) => Value::Struct(read_columns(nested, row, offset)?),
            _ => {
                let raw = row.next().ok_or(CodecError::FieldCount {
                    expected: layout.len(),
                    actual: values.len(),
                })?;
                from_sql(field, raw, offset)?
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Decode a storage row whose columns follow `layout.columns()` order.
pub fn values_from_row(layout: &FieldLayout, row: Vec<SqlValue>, offset: i64) -> Result<Vec<Value>, CodecError> {
    let mut iter = row.into_iter();
    read_columns(layout, &mut iter, offset)
}
