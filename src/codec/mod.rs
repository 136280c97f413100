// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metadata-driven record codec.
//!
//! - [`value`]: decoded field values and their canonical form
//! - [`serializer`]: the compact snapshot format used for caching and dirty checks
//! - [`bind`]: column binds exchanged with storage

pub mod bind;
pub mod serializer;
pub mod value;

pub use bind::{diff, full_bind, to_columns, values_from_row, Bind, SqlValue};
pub use serializer::{decode, decode_field, encode, SNAPSHOT_VERSION};
pub use value::{default_value, default_values, normalize, Value};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("unexpected end of snapshot")]
    UnexpectedEof,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid utf-8 in text field")]
    InvalidUtf8,
    #[error("unsupported snapshot version {0}")]
    VersionMismatch(u8),
    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("no field at index {0}")]
    UnknownField(usize),
    #[error("field {field} expects {expected}")]
    TypeMismatch { field: String, expected: &'static str },
    #[error("'{value}' is not a valid value for {field}")]
    InvalidEnumValue { field: String, value: String },
    #[error("enum index {0} out of range")]
    InvalidEnumIndex(u64),
    #[error("timestamp {0} out of range")]
    InvalidTimestamp(i64),
    #[error("column {column} holds unreadable value '{value}'")]
    InvalidColumn { column: String, value: String },
    #[error("json: {0}")]
    Json(String),
}
