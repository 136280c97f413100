// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational storage, the ground truth tier.
//!
//! - [`sql`]: MySQL / SQLite pools over sqlx
//! - [`memory`]: in-process pool for tests and embedded use

pub mod memory;
pub mod sql;
pub mod statement;
pub mod traits;

pub use memory::InMemoryPool;
pub use sql::SqlPool;
pub use statement::{rows_per_insert, Dialect, Filter, SelectQuery, WriteStatement, MAX_BIND_PARAMETERS};
pub use traits::{Row, StorageError, StorageExecutor, StoragePool, StorageTransaction};
