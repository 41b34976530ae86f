//! Relational storage access
//!
//! One SQLite connection behind a mutex. Every DAO goes through these helpers:
//! SQL text, bind parameters and a row decoder in, decoded rows out.
//!
//! Once [`DataSource::close`] has been called, DAOs return the closing
//! sentinel of their query's return type instead of touching the database.

use crate::error::{Result, StorageError};
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Column definition used when syncing a table's schema.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: &'static str) -> Self {
        Self { name, sql_type }
    }
}

pub struct DataSource {
    conn: Mutex<Connection>,
    closing: AtomicBool,
}

impl DataSource {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            closing: AtomicBool::new(false),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Mark the data source as shutting down. In-flight and later DAO calls
    /// fail soft from here on.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let conn = self.conn.lock()?;
        Ok(conn.execute(sql, params)?)
    }

    pub fn query<T, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, mapper)?;
        Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
    }

    pub fn query_optional<T, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock()?;
        Ok(conn.query_row(sql, params, mapper).optional()?)
    }

    /// Query that must produce exactly one row, such as an aggregate
    /// `sum()`/`max()` query. No row is an invariant violation.
    pub fn query_single<T, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query_optional(sql, params, mapper)?
            .ok_or_else(|| StorageError::Invariant(format!("no row returned for: {}", sql)))
    }

    /// Run `f` inside one transaction; committed when `f` returns `Ok`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Create the table if missing and add any columns it lacks.
    pub fn sync_table(&self, table: &str, columns: &[Column]) -> Result<()> {
        let conn = self.conn.lock()?;
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table,
            column_defs.join(", ")
        ))?;

        let existing: Vec<String> = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        for column in columns {
            if !existing.iter().any(|e| e.eq_ignore_ascii_case(column.name)) {
                tracing::info!(table, column = column.name, "adding missing column");
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table, column.name, column.sql_type
                ))?;
            }
        }
        Ok(())
    }

    pub fn sync_index(&self, table: &str, index: &str, columns: &[&str], unique: bool) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute_batch(&format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            index,
            table,
            columns.join(", ")
        ))?;
        Ok(())
    }

    /// Delete every row of `table` captured strictly before `capture_time`.
    pub fn delete_before(&self, table: &str, capture_time: i64) -> Result<usize> {
        self.execute(
            &format!("DELETE FROM {} WHERE capture_time < ?1", table),
            [capture_time],
        )
    }
}
