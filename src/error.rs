// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-wide error type.

use thiserror::Error;

use crate::cache::CacheError;
use crate::codec::CodecError;
use crate::lazy::QueueError;
use crate::storage::StorageError;

/// MySQL's "Duplicate entry" error number.
pub const DUPLICATE_ENTRY_CODE: &str = "1062";

/// A unique index value is already reserved by another record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("duplicate value for unique index {index} (held by id {id}, columns {columns:?})")]
pub struct DuplicateKeyError {
    pub index: String,
    pub id: u64,
    pub columns: Vec<String>,
}

#[derive(Error, Debug)]
pub enum OrmError {
    /// Unknown entity, pool or cache. Never retried.
    #[error("registration error: {0}")]
    Registration(String),
    #[error(transparent)]
    DuplicateKey(#[from] DuplicateKeyError),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("remote cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("event bus error: {0}")]
    Queue(#[from] QueueError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrmError {
    /// Storage failures the lazy consumer may hand to error resolvers.
    ///
    /// A unique reservation refused by the remote cache is reported as the
    /// constraint violation storage would have raised for the same row.
    pub fn recoverable_storage_error(&self) -> Option<StorageError> {
        match self {
            OrmError::Storage(err) if err.is_recoverable() => Some(err.clone()),
            OrmError::DuplicateKey(err) => Some(StorageError::Constraint {
                code: DUPLICATE_ENTRY_CODE.to_string(),
                message: err.to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_message() {
        let err: OrmError = DuplicateKeyError {
            index: "Email".into(),
            id: 7,
            columns: vec!["Email".into()],
        }
        .into();
        assert!(err.to_string().contains("Email"));
        assert!(err.to_string().contains("id 7"));
    }

    #[test]
    fn test_duplicate_key_surfaces_as_constraint() {
        let err: OrmError = DuplicateKeyError {
            index: "Email".into(),
            id: 7,
            columns: vec!["Email".into()],
        }
        .into();
        match err.recoverable_storage_error() {
            Some(StorageError::Constraint { code, message }) => {
                assert_eq!(code, DUPLICATE_ENTRY_CODE);
                assert!(message.contains("Email"));
            }
            other => panic!("expected constraint, got {:?}", other),
        }
    }

    #[test]
    fn test_only_constraint_and_backend_are_recoverable() {
        let constraint = OrmError::Storage(StorageError::Constraint {
            code: "1062".into(),
            message: "Duplicate entry".into(),
        });
        assert!(constraint.recoverable_storage_error().is_some());

        let connection = OrmError::Storage(StorageError::Connection("refused".into()));
        assert!(connection.recoverable_storage_error().is_none());
        assert!(OrmError::Validation("x".into()).recoverable_storage_error().is_none());
    }
}
