// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured statements and their SQL rendering.
//!
//! The flush engine builds these; SQL pools render them with placeholders,
//! in-memory pools interpret them directly.

use crate::codec::{Bind, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Ids(Vec<u64>),
    Equals { column: String, value: SqlValue },
    All,
}

/// `SELECT ID, columns... FROM table WHERE filter ORDER BY ID`
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
    /// One multi-row insert; `rows` follow `columns` (which start with `ID`).
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        on_duplicate: Option<Bind>,
    },
    Update { table: String, id: u64, bind: Bind },
    Delete { table: String, ids: Vec<u64> },
}

impl WriteStatement {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteStatement::Insert { .. } => "insert",
            WriteStatement::Update { .. } => "update",
            WriteStatement::Delete { .. } => "delete",
        }
    }

    pub fn table(&self) -> &str {
        match self {
            WriteStatement::Insert { table, .. }
            | WriteStatement::Update { table, .. }
            | WriteStatement::Delete { table, .. } => table,
        }
    }
}

fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

impl SelectQuery {
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut columns = vec![quote("ID")];
        columns.extend(self.columns.iter().map(|c| quote(c)));
        let mut sql = format!("SELECT {} FROM {}", columns.join(","), quote(&self.table));
        let args = match &self.filter {
            Filter::Ids(ids) => {
                sql.push_str(&format!(" WHERE {} IN ({})", quote("ID"), placeholders(ids.len())));
                ids.iter().map(|id| SqlValue::Uint(*id)).collect()
            }
            Filter::Equals { column, value } => {
                sql.push_str(&format!(" WHERE {} = ?", quote(column)));
                vec![value.clone()]
            }
            Filter::All => Vec::new(),
        };
        sql.push_str(&format!(" ORDER BY {}", quote("ID")));
        (sql, args)
    }
}

/// Placeholders one statement may carry on every supported dialect.
/// SQLite allows 32766, MySQL 65535.
pub const MAX_BIND_PARAMETERS: usize = 32_766;

/// Rows of a multi-row insert that fit in one statement.
pub fn rows_per_insert(columns: usize) -> usize {
    (MAX_BIND_PARAMETERS / columns.max(1)).max(1)
}

/// `SELECT MAX(ID)` for id allocation.
pub fn max_id_sql(table: &str) -> String {
    format!("SELECT MAX({}) FROM {}", quote("ID"), quote(table))
}

impl WriteStatement {
    pub fn to_sql(&self, dialect: Dialect) -> (String, Vec<SqlValue>) {
        match self {
            WriteStatement::Insert { table, columns, rows, on_duplicate } => {
                let column_list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                let row_placeholder = format!("({})", placeholders(columns.len()));
                let mut sql = format!(
                    "INSERT INTO {}({}) VALUES {}",
                    quote(table),
                    column_list.join(","),
                    vec![row_placeholder; rows.len()].join(",")
                );
                let mut args: Vec<SqlValue> = rows.iter().flatten().cloned().collect();
                if let Some(bind) = on_duplicate {
                    let sets: Vec<String> = bind.keys().map(|c| format!("{} = ?", quote(c))).collect();
                    match dialect {
                        Dialect::MySql => sql.push_str(" ON DUPLICATE KEY UPDATE "),
                        Dialect::Sqlite => sql.push_str(" ON CONFLICT DO UPDATE SET "),
                    }
                    if sets.is_empty() {
                        // keep the statement valid: a no-op assignment
                        sql.push_str(&format!("{0} = {0}", quote("ID")));
                    } else {
                        sql.push_str(&sets.join(","));
                    }
                    args.extend(bind.values().cloned());
                }
                (sql, args)
            }
            WriteStatement::Update { table, id, bind } => {
                let sets: Vec<String> = bind.keys().map(|c| format!("{} = ?", quote(c))).collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    quote(table),
                    sets.join(","),
                    quote("ID")
                );
                let mut args: Vec<SqlValue> = bind.values().cloned().collect();
                args.push(SqlValue::Uint(*id));
                (sql, args)
            }
            WriteStatement::Delete { table, ids } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    quote(table),
                    quote("ID"),
                    placeholders(ids.len())
                );
                (sql, ids.iter().map(|id| SqlValue::Uint(*id)).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_row_insert_uses_one_statement() {
        let statement = WriteStatement::Insert {
            table: "users".into(),
            columns: vec!["ID".into(), "Name".into()],
            rows: vec![
                vec![SqlValue::Uint(1), SqlValue::Text("a".into())],
                vec![SqlValue::Uint(2), SqlValue::Null],
            ],
            on_duplicate: None,
        };
        let (sql, args) = statement.to_sql(Dialect::MySql);
        assert_eq!(sql, "INSERT INTO `users`(`ID`,`Name`) VALUES (?,?),(?,?)");
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_rows_per_insert_stays_under_bind_limit() {
        assert_eq!(rows_per_insert(2), 16_383);
        assert_eq!(rows_per_insert(7) * 7, 32_760);
        assert_eq!(rows_per_insert(40_000), 1);
        assert_eq!(rows_per_insert(0), MAX_BIND_PARAMETERS);
    }

    #[test]
    fn test_on_duplicate_key_update() {
        let mut bind = Bind::new();
        bind.insert("Counter".into(), SqlValue::Uint(2));
        let statement = WriteStatement::Insert {
            table: "t".into(),
            columns: vec!["ID".into(), "Counter".into()],
            rows: vec![vec![SqlValue::Uint(1), SqlValue::Uint(1)]],
            on_duplicate: Some(bind),
        };
        let (sql, args) = statement.to_sql(Dialect::MySql);
        assert_eq!(sql, "INSERT INTO `t`(`ID`,`Counter`) VALUES (?,?) ON DUPLICATE KEY UPDATE `Counter` = ?");
        assert_eq!(args.last(), Some(&SqlValue::Uint(2)));
        let (sqlite, _) = statement.to_sql(Dialect::Sqlite);
        assert!(sqlite.contains("ON CONFLICT DO UPDATE SET `Counter` = ?"));
    }

    #[test]
    fn test_update_binds_only_given_columns() {
        let mut bind = Bind::new();
        bind.insert("Age".into(), SqlValue::Uint(30));
        let (sql, args) = WriteStatement::Update { table: "users".into(), id: 9, bind }.to_sql(Dialect::MySql);
        assert_eq!(sql, "UPDATE `users` SET `Age` = ? WHERE `ID` = ?");
        assert_eq!(args, vec![SqlValue::Uint(30), SqlValue::Uint(9)]);
    }

    #[test]
    fn test_select_by_reference() {
        let query = SelectQuery {
            table: "posts".into(),
            columns: vec!["Author".into()],
            filter: Filter::Equals { column: "Author".into(), value: SqlValue::Uint(4) },
        };
        let (sql, args) = query.to_sql();
        assert_eq!(sql, "SELECT `ID`,`Author` FROM `posts` WHERE `Author` = ? ORDER BY `ID`");
        assert_eq!(args, vec![SqlValue::Uint(4)]);
    }
}
