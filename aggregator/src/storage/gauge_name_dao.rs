//! Gauge name lookup table
//!
//! Maps each gauge name to a stable integer id. `last_capture_time` is the
//! newest time any level references the gauge and is used for retention only.

use super::data_source::{Column, DataSource};
use crate::error::Result;
use rusqlite::params;
use std::sync::{Arc, Mutex};

const TABLE: &str = "gauge_name";

const COLUMNS: &[Column] = &[
    Column::new("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
    Column::new("gauge_name", "TEXT NOT NULL"),
    Column::new("last_capture_time", "INTEGER NOT NULL"),
];

pub struct GaugeNameDao {
    data_source: Arc<DataSource>,
    upsert_lock: Mutex<()>,
}

impl GaugeNameDao {
    pub fn new(data_source: Arc<DataSource>) -> Result<Self> {
        data_source.sync_table(TABLE, COLUMNS)?;
        data_source.sync_index(TABLE, "gauge_name_idx", &["gauge_name"], true)?;
        Ok(Self {
            data_source,
            upsert_lock: Mutex::new(()),
        })
    }

    /// Id for `gauge_name`, created on first use, with its last capture time
    /// advanced to at least `capture_time`.
    pub fn update_last_capture_time(&self, gauge_name: &str, capture_time: i64) -> Result<i64> {
        let _guard = self.upsert_lock.lock()?;
        let existing: Option<i64> = self.data_source.query_optional(
            "SELECT id FROM gauge_name WHERE gauge_name = ?1",
            [gauge_name],
            |row| row.get(0),
        )?;
        match existing {
            Some(id) => {
                self.touch(&[id], capture_time)?;
                Ok(id)
            }
            None => {
                self.data_source.execute(
                    "INSERT INTO gauge_name (gauge_name, last_capture_time) VALUES (?1, ?2)",
                    params![gauge_name, capture_time],
                )?;
                self.data_source.query_single(
                    "SELECT id FROM gauge_name WHERE gauge_name = ?1",
                    [gauge_name],
                    |row| row.get(0),
                )
            }
        }
    }

    /// Advance the last capture time of existing gauges (used by rollups).
    pub fn touch(&self, gauge_ids: &[i64], capture_time: i64) -> Result<()> {
        for id in gauge_ids {
            self.data_source.execute(
                "UPDATE gauge_name SET last_capture_time = max(last_capture_time, ?2) WHERE id = ?1",
                params![id, capture_time],
            )?;
        }
        Ok(())
    }

    /// Absent gauges are `None`, never an error.
    pub fn gauge_id(&self, gauge_name: &str) -> Result<Option<i64>> {
        if self.data_source.is_closing() {
            return Ok(None);
        }
        self.data_source.query_optional(
            "SELECT id FROM gauge_name WHERE gauge_name = ?1",
            [gauge_name],
            |row| row.get(0),
        )
    }

    /// Closing sentinel: empty list.
    pub fn read_gauge_names(&self) -> Result<Vec<String>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        self.data_source.query(
            "SELECT gauge_name FROM gauge_name ORDER BY gauge_name",
            [],
            |row| row.get(0),
        )
    }

    pub fn delete_before(&self, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        let _guard = self.upsert_lock.lock()?;
        self.data_source.execute(
            "DELETE FROM gauge_name WHERE last_capture_time < ?1",
            [capture_time],
        )
    }
}
