//! Transaction type lookup table
//!
//! Tracks every transaction type with the newest capture time that references
//! it at any rollup level. Used for listing types and for retention only.

use super::data_source::{Column, DataSource};
use crate::error::Result;
use rusqlite::params;
use std::sync::{Arc, Mutex};

const TABLE: &str = "transaction_type";

const COLUMNS: &[Column] = &[
    Column::new("transaction_type", "TEXT NOT NULL"),
    Column::new("last_capture_time", "INTEGER NOT NULL"),
];

pub struct TransactionTypeDao {
    data_source: Arc<DataSource>,
    // update-then-insert must not race with itself
    upsert_lock: Mutex<()>,
}

impl TransactionTypeDao {
    pub fn new(data_source: Arc<DataSource>) -> Result<Self> {
        data_source.sync_table(TABLE, COLUMNS)?;
        data_source.sync_index(TABLE, "transaction_type_idx", &["transaction_type"], true)?;
        Ok(Self {
            data_source,
            upsert_lock: Mutex::new(()),
        })
    }

    /// Record that `transaction_type` is referenced at `capture_time`. The
    /// stored time only moves forward.
    pub fn update_last_capture_time(&self, transaction_type: &str, capture_time: i64) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        let _guard = self.upsert_lock.lock()?;
        let updated = self.data_source.execute(
            "UPDATE transaction_type SET last_capture_time = max(last_capture_time, ?2) \
             WHERE transaction_type = ?1",
            params![transaction_type, capture_time],
        )?;
        if updated == 0 {
            self.data_source.execute(
                "INSERT INTO transaction_type (transaction_type, last_capture_time) VALUES (?1, ?2)",
                params![transaction_type, capture_time],
            )?;
        }
        Ok(())
    }

    /// Closing sentinel: empty list.
    pub fn read_transaction_types(&self) -> Result<Vec<String>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        self.data_source.query(
            "SELECT transaction_type FROM transaction_type ORDER BY transaction_type",
            [],
            |row| row.get(0),
        )
    }

    pub fn delete_before(&self, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        self.data_source.execute(
            "DELETE FROM transaction_type WHERE last_capture_time < ?1",
            [capture_time],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dao() -> TransactionTypeDao {
        TransactionTypeDao::new(Arc::new(DataSource::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn test_upsert_keeps_one_row() {
        let dao = dao();
        dao.update_last_capture_time("Web", 1_000).unwrap();
        dao.update_last_capture_time("Web", 2_000).unwrap();
        dao.update_last_capture_time("Background", 1_000).unwrap();
        assert_eq!(dao.read_transaction_types().unwrap(), vec!["Background", "Web"]);
    }

    #[test]
    fn test_last_capture_time_only_moves_forward() {
        let dao = dao();
        dao.update_last_capture_time("Web", 60_000).unwrap();
        dao.update_last_capture_time("Web", 1_000).unwrap();
        assert_eq!(dao.delete_before(30_000).unwrap(), 0);
        assert_eq!(dao.delete_before(60_001).unwrap(), 1);
        assert!(dao.read_transaction_types().unwrap().is_empty());
    }

    #[test]
    fn test_closing_returns_sentinels() {
        let dao = dao();
        dao.update_last_capture_time("Web", 1_000).unwrap();
        dao.data_source.close();
        assert!(dao.read_transaction_types().unwrap().is_empty());
        assert_eq!(dao.delete_before(i64::MAX).unwrap(), 0);
    }
}
