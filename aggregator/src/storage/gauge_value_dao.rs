//! Gauge value storage and rollup
//!
//! Same level structure as aggregates with one table per level,
//! `gauge_value_rollup_{level}`, and a weighted-mean merge. Gauge names map
//! to integer ids through [`GaugeNameDao`].

use super::data_source::{Column, DataSource};
use super::gauge_name_dao::GaugeNameDao;
use super::watermark;
use crate::config::{RollupConfig, StorageConfig};
use crate::error::{Result, StorageError};
use crate::merge::weighted_mean;
use crate::metrics;
use crate::rollup::{rollup_capture_time, safe_rollup_time};
use rusqlite::params;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use trellis_shared::GaugeValue;

const KIND: &str = "gauge";

const COLUMNS: &[Column] = &[
    Column::new("gauge_id", "INTEGER NOT NULL"),
    Column::new("capture_time", "INTEGER NOT NULL"),
    Column::new("value", "REAL NOT NULL"),
    Column::new("weight", "INTEGER NOT NULL"),
];

pub struct GaugeValueDao {
    data_source: Arc<DataSource>,
    gauge_names: Arc<GaugeNameDao>,
    rollups: Vec<RollupConfig>,
    tables: Vec<String>,
    last_rollup_times: Mutex<Vec<i64>>,
}

impl GaugeValueDao {
    pub fn new(
        data_source: Arc<DataSource>,
        gauge_names: Arc<GaugeNameDao>,
        config: &StorageConfig,
    ) -> Result<Self> {
        let tables: Vec<String> = (0..config.gauge_level_count())
            .map(|level| format!("gauge_value_rollup_{}", level))
            .collect();
        for table in &tables {
            data_source.sync_table(table, COLUMNS)?;
            data_source.sync_index(
                table,
                &format!("{}_idx", table),
                &["gauge_id", "capture_time"],
                true,
            )?;
        }
        watermark::sync_schema(&data_source)?;
        let last_rollup_times = watermark::initial_last_rollup_times(&data_source, KIND, &tables)?;
        tracing::info!(levels = tables.len(), ?last_rollup_times, "Gauge storage ready");

        Ok(Self {
            data_source,
            gauge_names,
            rollups: config.gauge_rollups.clone(),
            tables,
            last_rollup_times: Mutex::new(last_rollup_times),
        })
    }

    pub fn last_rollup_times(&self) -> Result<Vec<i64>> {
        Ok(self.last_rollup_times.lock()?.clone())
    }

    /// Persist raw gauge values at level 0, then roll up to the newest
    /// capture time in the batch.
    pub fn store(&self, values: &[GaugeValue]) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        let insert = format!(
            "INSERT OR REPLACE INTO {} (gauge_id, capture_time, value, weight) VALUES (?1, ?2, ?3, ?4)",
            self.tables[0]
        );
        for value in values {
            let gauge_id = self
                .gauge_names
                .update_last_capture_time(&value.gauge_name, value.capture_time)?;
            self.data_source.execute(
                &insert,
                params![gauge_id, value.capture_time, value.value, value.weight],
            )?;
        }
        metrics::GAUGE_VALUES_STORED.inc_by(values.len() as f64);
        match values.iter().map(|v| v.capture_time).max() {
            Some(capture_time) => self.rollup(capture_time),
            None => Ok(()),
        }
    }

    pub fn rollup(&self, capture_time: i64) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        let start = Instant::now();
        let mut last_rollup_times = self.last_rollup_times.lock()?;
        for level in 1..self.tables.len() {
            let interval = self.rollups[level].interval_millis;
            let safe_time = safe_rollup_time(capture_time, interval);
            let last = last_rollup_times[level];
            if safe_time <= last {
                continue;
            }
            let source_times: Vec<i64> = self.data_source.query(
                &format!(
                    "SELECT DISTINCT capture_time FROM {} WHERE capture_time > ?1 AND capture_time <= ?2",
                    self.tables[level - 1]
                ),
                [last, safe_time],
                |row| row.get(0),
            )?;
            let rollup_times: BTreeSet<i64> = source_times
                .into_iter()
                .map(|t| rollup_capture_time(t, interval))
                .collect();
            for rollup_time in rollup_times {
                self.rollup_one(level, rollup_time, interval)?;
            }
            last_rollup_times[level] = safe_time;
            watermark::write(&self.data_source, KIND, level, safe_time)?;
        }
        metrics::ROLLUP_DURATION
            .with_label_values(&[KIND])
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn rollup_one(&self, level: usize, rollup_time: i64, interval: i64) -> Result<()> {
        let rows: Vec<(i64, f64, i64)> = self.data_source.query(
            &format!(
                "SELECT gauge_id, value, weight FROM {} WHERE capture_time > ?1 AND capture_time <= ?2",
                self.tables[level - 1]
            ),
            [rollup_time - interval, rollup_time],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut by_gauge: BTreeMap<i64, Vec<(f64, i64)>> = BTreeMap::new();
        for (gauge_id, value, weight) in rows {
            by_gauge.entry(gauge_id).or_default().push((value, weight));
        }

        let insert = format!(
            "INSERT OR REPLACE INTO {} (gauge_id, capture_time, value, weight) VALUES (?1, ?2, ?3, ?4)",
            self.tables[level]
        );
        let gauge_ids: Vec<i64> = by_gauge.keys().copied().collect();
        for (gauge_id, values) in by_gauge {
            if let Some((value, weight)) = weighted_mean(values) {
                self.data_source
                    .execute(&insert, params![gauge_id, rollup_time, value, weight])?;
            }
        }
        self.gauge_names.touch(&gauge_ids, rollup_time)?;

        metrics::ROLLUPS_TOTAL
            .with_label_values(&[KIND, &level.to_string()])
            .inc();
        tracing::debug!(level, rollup_time, gauges = gauge_ids.len(), "Rolled up gauge values");
        Ok(())
    }

    /// Values of one gauge in `[from, to]`. An unknown gauge or a closing
    /// store yields an empty list.
    pub fn read_gauge_values(
        &self,
        gauge_name: &str,
        from: i64,
        to: i64,
        rollup_level: usize,
    ) -> Result<Vec<GaugeValue>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        let table = self.table(rollup_level)?;
        let Some(gauge_id) = self.gauge_names.gauge_id(gauge_name)? else {
            return Ok(Vec::new());
        };
        self.data_source.query(
            &format!(
                "SELECT capture_time, value, weight FROM {} \
                 WHERE gauge_id = ?1 AND capture_time >= ?2 AND capture_time <= ?3 \
                 ORDER BY capture_time",
                table
            ),
            [gauge_id, from, to],
            |row| {
                Ok(GaugeValue::new(
                    gauge_name,
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                ))
            },
        )
    }

    pub fn delete_before(&self, level: usize, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        let table = self.table(level)?;
        self.data_source.delete_before(table, capture_time)
    }

    fn table(&self, level: usize) -> Result<&str> {
        self.tables
            .get(level)
            .map(String::as_str)
            .ok_or_else(|| StorageError::Invariant(format!("gauge rollup level {} out of range", level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dao() -> GaugeValueDao {
        let data_source = Arc::new(DataSource::open_in_memory().unwrap());
        let names = Arc::new(GaugeNameDao::new(data_source.clone()).unwrap());
        GaugeValueDao::new(data_source, names, &StorageConfig::default()).unwrap()
    }

    #[test]
    fn test_store_and_read_raw() {
        let dao = dao();
        dao.store(&[
            GaugeValue::new("jvm/heap", 5_000, 100.0, 1),
            GaugeValue::new("jvm/heap", 10_000, 200.0, 1),
        ])
        .unwrap();
        let values = dao.read_gauge_values("jvm/heap", 5_000, 10_000, 0).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, 100.0);
        assert!(dao.read_gauge_values("missing", 0, 10_000, 0).unwrap().is_empty());
    }

    #[test]
    fn test_weighted_rollup() {
        let dao = dao();
        dao.store(&[
            GaugeValue::new("jvm/heap", 10_000, 10.0, 1),
            GaugeValue::new("jvm/heap", 20_000, 20.0, 3),
        ])
        .unwrap();
        dao.store(&[GaugeValue::new("jvm/heap", 65_000, 0.0, 1)]).unwrap();

        let rolled = dao.read_gauge_values("jvm/heap", 0, 60_000, 1).unwrap();
        assert_eq!(rolled, vec![GaugeValue::new("jvm/heap", 60_000, 17.5, 4)]);
        assert_eq!(dao.last_rollup_times().unwrap()[1], 60_000);
    }

    #[test]
    fn test_rollup_waits_for_window_to_close() {
        let dao = dao();
        dao.store(&[GaugeValue::new("jvm/heap", 10_000, 10.0, 1)]).unwrap();
        dao.rollup(60_000).unwrap();
        assert!(dao.read_gauge_values("jvm/heap", 0, i64::MAX, 1).unwrap().is_empty());
        dao.rollup(60_001).unwrap();
        assert_eq!(dao.read_gauge_values("jvm/heap", 0, i64::MAX, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_before() {
        let dao = dao();
        dao.store(&[
            GaugeValue::new("jvm/heap", 5_000, 1.0, 1),
            GaugeValue::new("jvm/heap", 10_000, 1.0, 1),
        ])
        .unwrap();
        assert_eq!(dao.delete_before(0, 10_000).unwrap(), 1);
    }
}
