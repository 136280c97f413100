// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage pool (MySQL or SQLite) over sqlx's `Any` driver.
//!
//! Tables are owned by the application; each entity table has an unsigned
//! `ID` primary key plus one column per (flattened) field:
//!
//! ```sql
//! CREATE TABLE users (
//!   ID BIGINT UNSIGNED PRIMARY KEY,
//!   Name VARCHAR(255),
//!   Age INT UNSIGNED NOT NULL DEFAULT 0,
//!   Created DATETIME,
//!   Status ENUM('active','banned')
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! `Any` has no unsigned integers, so ids are bound as `i64`. Text columns
//! may come back as BLOB, so reads fall back from `String` to `Vec<u8>`.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row, Transaction, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::statement::{max_id_sql, Dialect, SelectQuery, WriteStatement};
use super::traits::{Row as StorageRow, StorageError, StorageExecutor, StoragePool, StorageTransaction};
use crate::codec::SqlValue;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub(crate) fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => StorageError::Constraint {
                code: db.code().map(|c| c.into_owned()).unwrap_or_default(),
                message: db.message().to_string(),
            },
            _ => StorageError::Backend(db.message().to_string()),
        },
        sqlx::Error::Io(e) => StorageError::Connection(e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StorageError::Connection(e.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn bind_args<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: Vec<SqlValue>,
) -> Result<Query<'q, Any, AnyArguments<'q>>, StorageError> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Uint(v) => query.bind(
                i64::try_from(v).map_err(|_| StorageError::Backend(format!("value {} exceeds BIGINT range", v)))?,
            ),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Bytes(v) => query.bind(v),
        };
    }
    Ok(query)
}

fn decode_column(row: &AnyRow, index: usize) -> Result<SqlValue, StorageError> {
    let raw = row.try_get_raw(index).map_err(map_sqlx_error)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(SqlValue::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(SqlValue::Float(v));
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(SqlValue::Text(v));
    }
    row.try_get::<Vec<u8>, _>(index)
        .map(SqlValue::Bytes)
        .map_err(map_sqlx_error)
}

fn decode_rows(rows: Vec<AnyRow>, width: usize) -> Result<Vec<StorageRow>, StorageError> {
    rows.iter()
        .map(|row| (0..width).map(|i| decode_column(row, i)).collect())
        .collect()
}

pub struct SqlPool {
    code: String,
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlPool {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(code: impl Into<String>, connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = if connection_string.starts_with("sqlite:") {
            Dialect::Sqlite
        } else {
            Dialect::MySql
        };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        let code = code.into();
        info!(pool = %code, ?dialect, "SQL pool connected");
        Ok(Self { code, pool, dialect })
    }

    /// Get a clone of the connection pool (for DDL or ad-hoc queries).
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Run a statement outside the engine, e.g. schema setup.
    pub async fn execute_raw(&self, sql: &str) -> Result<u64, StorageError> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl StorageExecutor for SqlPool {
    async fn query(&self, query: &SelectQuery) -> Result<Vec<StorageRow>, StorageError> {
        let (sql, args) = query.to_sql();
        let rows = bind_args(sqlx::query(&sql), args)?
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        decode_rows(rows, query.columns.len() + 1)
    }

    async fn exec(&self, statement: &WriteStatement) -> Result<u64, StorageError> {
        let (sql, args) = statement.to_sql(self.dialect);
        debug!(pool = %self.code, sql = %sql, "exec");
        bind_args(sqlx::query(&sql), args)?
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl StoragePool for SqlPool {
    fn code(&self) -> &str {
        &self.code
    }

    async fn max_id(&self, table: &str) -> Result<u64, StorageError> {
        let row = sqlx::query(&max_id_sql(table))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let max: Option<i64> = row.try_get(0).map_err(map_sqlx_error)?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(SqlTransaction {
            tx: Mutex::new(Some(tx)),
            dialect: self.dialect,
        }))
    }
}

/// Open transaction; statements run on its dedicated connection.
pub struct SqlTransaction {
    tx: Mutex<Option<Transaction<'static, Any>>>,
    dialect: Dialect,
}

fn finished() -> StorageError {
    StorageError::Transaction("transaction already finished".into())
}

#[async_trait]
impl StorageExecutor for SqlTransaction {
    async fn query(&self, query: &SelectQuery) -> Result<Vec<StorageRow>, StorageError> {
        let (sql, args) = query.to_sql();
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let rows = bind_args(sqlx::query(&sql), args)?
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        decode_rows(rows, query.columns.len() + 1)
    }

    async fn exec(&self, statement: &WriteStatement) -> Result<u64, StorageError> {
        let (sql, args) = statement.to_sql(self.dialect);
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        bind_args(sqlx::query(&sql), args)?
            .execute(&mut **tx)
            .await
            .map(|r| r.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl StorageTransaction for SqlTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let tx = self.tx.into_inner().ok_or_else(finished)?;
        tx.commit().await.map_err(|e| StorageError::Transaction(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        let tx = self.tx.into_inner().ok_or_else(finished)?;
        tx.rollback().await.map_err(|e| StorageError::Transaction(e.to_string()))
    }
}
