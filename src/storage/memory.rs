use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::statement::{Filter, SelectQuery, WriteStatement};
use super::traits::{Row, StorageError, StorageExecutor, StoragePool, StorageTransaction};
use crate::codec::SqlValue;

type TableRows = BTreeMap<u64, HashMap<String, SqlValue>>;
type Tables = HashMap<String, TableRows>;

/// Interprets structured statements against in-process tables.
///
/// Supports unique constraints, query/exec counters and one-shot failure
/// injection; transactions work on a copy that replaces the tables on commit.
pub struct InMemoryPool {
    code: String,
    tables: Arc<RwLock<Tables>>,
    unique: Arc<RwLock<HashMap<String, Vec<Vec<String>>>>>,
    queries: Arc<AtomicU64>,
    execs: Arc<AtomicU64>,
    injected: Arc<Mutex<Option<StorageError>>>,
}

impl InMemoryPool {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            tables: Arc::new(RwLock::new(HashMap::new())),
            unique: Arc::new(RwLock::new(HashMap::new())),
            queries: Arc::new(AtomicU64::new(0)),
            execs: Arc::new(AtomicU64::new(0)),
            injected: Arc::new(Mutex::new(None)),
        }
    }

    /// Reject writes that would duplicate `columns` in `table`.
    pub fn add_unique_constraint(&self, table: &str, columns: &[&str]) {
        self.unique
            .write()
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
    }

    /// Fail the next `exec` with `error`.
    pub fn inject_failure(&self, error: StorageError) {
        *self.injected.lock() = Some(error);
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> u64 {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn row(&self, table: &str, id: u64) -> Option<HashMap<String, SqlValue>> {
        self.tables.read().get(table)?.get(&id).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Seed a row directly, bypassing the engine.
    pub fn insert_row(&self, table: &str, id: u64, columns: Vec<(&str, SqlValue)>) {
        let row = columns.into_iter().map(|(c, v)| (c.to_string(), v)).collect();
        self.tables.write().entry(table.to_string()).or_default().insert(id, row);
    }
}

fn loosely_equal(a: &SqlValue, b: &SqlValue) -> bool {
    match (a, b) {
        (SqlValue::Null, _) | (_, SqlValue::Null) => false,
        _ => a.render() == b.render(),
    }
}

fn duplicate(table: &str, key: &str, value: String) -> StorageError {
    StorageError::Constraint {
        code: crate::error::DUPLICATE_ENTRY_CODE.into(),
        message: format!("Duplicate entry '{}' for key '{}.{}'", value, table, key),
    }
}

fn check_unique(
    table: &str,
    rows: &TableRows,
    constraints: &[Vec<String>],
    id: u64,
    row: &HashMap<String, SqlValue>,
) -> Result<(), StorageError> {
    for columns in constraints {
        let values: Vec<&SqlValue> = columns.iter().map(|c| row.get(c).unwrap_or(&SqlValue::Null)).collect();
        if values.iter().any(|v| v.is_null()) {
            continue;
        }
        let clash = rows.iter().any(|(other_id, other)| {
            *other_id != id
                && columns
                    .iter()
                    .zip(&values)
                    .all(|(c, v)| other.get(c).map(|o| loosely_equal(o, v)).unwrap_or(false))
        });
        if clash {
            let rendered: Vec<String> = values.iter().map(|v| v.render()).collect();
            return Err(duplicate(table, &columns.join("_"), rendered.join("-")));
        }
    }
    Ok(())
}

fn run_query(tables: &Tables, query: &SelectQuery) -> Vec<Row> {
    let Some(rows) = tables.get(&query.table) else {
        return Vec::new();
    };
    let project = |id: u64, row: &HashMap<String, SqlValue>| -> Row {
        let mut out = Vec::with_capacity(query.columns.len() + 1);
        out.push(SqlValue::Uint(id));
        out.extend(query.columns.iter().map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null)));
        out
    };
    match &query.filter {
        Filter::Ids(ids) => {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            ids.into_iter()
                .filter_map(|id| rows.get(&id).map(|row| project(id, row)))
                .collect()
        }
        Filter::Equals { column, value } => rows
            .iter()
            .filter(|(_, row)| row.get(column).map(|v| loosely_equal(v, value)).unwrap_or(false))
            .map(|(id, row)| project(*id, row))
            .collect(),
        Filter::All => rows.iter().map(|(id, row)| project(*id, row)).collect(),
    }
}

fn run_exec(
    tables: &mut Tables,
    unique: &HashMap<String, Vec<Vec<String>>>,
    statement: &WriteStatement,
) -> Result<u64, StorageError> {
    let table = statement.table().to_string();
    let constraints = unique.get(&table).cloned().unwrap_or_default();
    // work on a copy so a failing statement leaves the table untouched
    let mut rows = tables.get(&table).cloned().unwrap_or_default();
    let affected = match statement {
        WriteStatement::Insert { columns, rows: values, on_duplicate, .. } => {
            let mut affected = 0;
            for row_values in values {
                let mut row: HashMap<String, SqlValue> =
                    columns.iter().cloned().zip(row_values.iter().cloned()).collect();
                let id = row
                    .remove("ID")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| StorageError::Backend("insert without ID".into()))?;
                if let Some(existing) = rows.get_mut(&id) {
                    match on_duplicate {
                        Some(bind) => {
                            for (column, value) in bind {
                                existing.insert(column.clone(), value.clone());
                            }
                            affected += 2;
                            continue;
                        }
                        None => return Err(duplicate(&table, "PRIMARY", id.to_string())),
                    }
                }
                if let Err(e) = check_unique(&table, &rows, &constraints, id, &row) {
                    match on_duplicate {
                        Some(_) => continue,
                        None => return Err(e),
                    }
                }
                rows.insert(id, row);
                affected += 1;
            }
            affected
        }
        WriteStatement::Update { id, bind, .. } => match rows.get(id).cloned() {
            Some(mut row) => {
                for (column, value) in bind {
                    row.insert(column.clone(), value.clone());
                }
                check_unique(&table, &rows, &constraints, *id, &row)?;
                rows.insert(*id, row);
                1
            }
            None => 0,
        },
        WriteStatement::Delete { ids, .. } => ids.iter().filter(|id| rows.remove(id).is_some()).count() as u64,
    };
    tables.insert(table, rows);
    Ok(affected)
}

impl InMemoryPool {
    fn take_injected(&self) -> Result<(), StorageError> {
        match self.injected.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageExecutor for InMemoryPool {
    async fn query(&self, query: &SelectQuery) -> Result<Vec<Row>, StorageError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(run_query(&self.tables.read(), query))
    }

    async fn exec(&self, statement: &WriteStatement) -> Result<u64, StorageError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        run_exec(&mut self.tables.write(), &self.unique.read(), statement)
    }
}

#[async_trait]
impl StoragePool for InMemoryPool {
    fn code(&self) -> &str {
        &self.code
    }

    async fn max_id(&self, table: &str) -> Result<u64, StorageError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let working = self.tables.read().clone();
        Ok(Box::new(InMemoryTransaction {
            pool: InMemoryPool {
                code: self.code.clone(),
                tables: self.tables.clone(),
                unique: self.unique.clone(),
                queries: self.queries.clone(),
                execs: self.execs.clone(),
                injected: self.injected.clone(),
            },
            working: RwLock::new(working),
        }))
    }
}

struct InMemoryTransaction {
    pool: InMemoryPool,
    working: RwLock<Tables>,
}

#[async_trait]
impl StorageExecutor for InMemoryTransaction {
    async fn query(&self, query: &SelectQuery) -> Result<Vec<Row>, StorageError> {
        self.pool.queries.fetch_add(1, Ordering::SeqCst);
        Ok(run_query(&self.working.read(), query))
    }

    async fn exec(&self, statement: &WriteStatement) -> Result<u64, StorageError> {
        self.pool.execs.fetch_add(1, Ordering::SeqCst);
        self.pool.take_injected()?;
        run_exec(&mut self.working.write(), &self.pool.unique.read(), statement)
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        *self.pool.tables.write() = self.working.into_inner();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
