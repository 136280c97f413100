use async_trait::async_trait;
use thiserror::Error;

use super::statement::{SelectQuery, WriteStatement};
use crate::codec::SqlValue;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Constraint violation ({code}): {message}")]
    Constraint { code: String, message: String },
    #[error("Storage connection error: {0}")]
    Connection(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl StorageError {
    /// Errors raised by the database itself, as opposed to transport or
    /// transaction bookkeeping failures.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Constraint { .. } | StorageError::Backend(_))
    }
}

/// Row values in the order of the query's columns.
pub type Row = Vec<SqlValue>;

/// Anything statements can run against: a pool or an open transaction.
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    async fn query(&self, query: &SelectQuery) -> Result<Vec<Row>, StorageError>;

    /// Returns affected row count.
    async fn exec(&self, statement: &WriteStatement) -> Result<u64, StorageError>;
}

/// Relational pool owning one or more entity tables.
///
/// The engine never retries calls made through this interface.
#[async_trait]
pub trait StoragePool: StorageExecutor {
    fn code(&self) -> &str;

    async fn max_id(&self, table: &str) -> Result<u64, StorageError>;

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError>;
}

#[async_trait]
pub trait StorageTransaction: StorageExecutor {
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
