//! Trace attribute name lookup table, per transaction type

use super::data_source::{Column, DataSource};
use crate::error::Result;
use rusqlite::params;
use std::sync::{Arc, Mutex};

const TABLE: &str = "trace_attribute_name";

const COLUMNS: &[Column] = &[
    Column::new("transaction_type", "TEXT NOT NULL"),
    Column::new("trace_attribute_name", "TEXT NOT NULL"),
    Column::new("last_capture_time", "INTEGER NOT NULL"),
];

pub struct TraceAttributeNameDao {
    data_source: Arc<DataSource>,
    upsert_lock: Mutex<()>,
}

impl TraceAttributeNameDao {
    pub fn new(data_source: Arc<DataSource>) -> Result<Self> {
        data_source.sync_table(TABLE, COLUMNS)?;
        data_source.sync_index(
            TABLE,
            "trace_attribute_name_idx",
            &["transaction_type", "trace_attribute_name"],
            true,
        )?;
        Ok(Self {
            data_source,
            upsert_lock: Mutex::new(()),
        })
    }

    pub fn update_last_capture_time(
        &self,
        transaction_type: &str,
        trace_attribute_name: &str,
        capture_time: i64,
    ) -> Result<()> {
        let _guard = self.upsert_lock.lock()?;
        let updated = self.data_source.execute(
            "UPDATE trace_attribute_name SET last_capture_time = max(last_capture_time, ?3) \
             WHERE transaction_type = ?1 AND trace_attribute_name = ?2",
            params![transaction_type, trace_attribute_name, capture_time],
        )?;
        if updated == 0 {
            self.data_source.execute(
                "INSERT INTO trace_attribute_name \
                 (transaction_type, trace_attribute_name, last_capture_time) VALUES (?1, ?2, ?3)",
                params![transaction_type, trace_attribute_name, capture_time],
            )?;
        }
        Ok(())
    }

    /// Closing sentinel: empty list.
    pub fn read_trace_attribute_names(&self, transaction_type: &str) -> Result<Vec<String>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        self.data_source.query(
            "SELECT trace_attribute_name FROM trace_attribute_name \
             WHERE transaction_type = ?1 ORDER BY trace_attribute_name",
            [transaction_type],
            |row| row.get(0),
        )
    }

    pub fn delete_before(&self, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        let _guard = self.upsert_lock.lock()?;
        self.data_source.execute(
            "DELETE FROM trace_attribute_name WHERE last_capture_time < ?1",
            [capture_time],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_per_transaction_type() {
        let dao =
            TraceAttributeNameDao::new(Arc::new(DataSource::open_in_memory().unwrap())).unwrap();
        dao.update_last_capture_time("Web", "user-id", 1_000).unwrap();
        dao.update_last_capture_time("Web", "region", 1_000).unwrap();
        dao.update_last_capture_time("Web", "region", 2_000).unwrap();
        dao.update_last_capture_time("Background", "job", 1_000).unwrap();
        assert_eq!(
            dao.read_trace_attribute_names("Web").unwrap(),
            vec!["region", "user-id"]
        );
        assert_eq!(dao.delete_before(1_500).unwrap(), 2);
        assert_eq!(dao.read_trace_attribute_names("Web").unwrap(), vec!["region"]);
    }
}
