//! Persisted rollup watermarks
//!
//! One row per (kind, level) holding the last completed rollup time. Written
//! after each level finishes so a restart repeats at most the unfinished
//! level, never skips one.

use super::data_source::{Column, DataSource};
use crate::error::Result;
use rusqlite::params;

const TABLE: &str = "rollup_watermark";

const COLUMNS: &[Column] = &[
    Column::new("kind", "TEXT NOT NULL"),
    Column::new("level", "INTEGER NOT NULL"),
    Column::new("last_rollup_time", "INTEGER NOT NULL"),
];

pub fn sync_schema(data_source: &DataSource) -> Result<()> {
    data_source.sync_table(TABLE, COLUMNS)?;
    data_source.sync_index(TABLE, "rollup_watermark_idx", &["kind", "level"], true)
}

pub fn read(data_source: &DataSource, kind: &str, level: usize) -> Result<Option<i64>> {
    data_source.query_optional(
        "SELECT last_rollup_time FROM rollup_watermark WHERE kind = ?1 AND level = ?2",
        params![kind, level as i64],
        |row| row.get(0),
    )
}

pub fn write(data_source: &DataSource, kind: &str, level: usize, last_rollup_time: i64) -> Result<()> {
    data_source.execute(
        "INSERT OR REPLACE INTO rollup_watermark (kind, level, last_rollup_time) VALUES (?1, ?2, ?3)",
        params![kind, level as i64, last_rollup_time],
    )?;
    Ok(())
}

/// Starting watermarks for every level. Level 0 holds raw data and is never
/// a rollup target, so it always starts at 0. Higher levels use the persisted
/// watermark, falling back to the newest row in `tables[level]`.
pub fn initial_last_rollup_times(
    data_source: &DataSource,
    kind: &str,
    tables: &[String],
) -> Result<Vec<i64>> {
    let mut times = vec![0; tables.len()];
    for (level, table) in tables.iter().enumerate().skip(1) {
        times[level] = match read(data_source, kind, level)? {
            Some(time) => time,
            None => data_source
                .query_single(
                    &format!("SELECT max(capture_time) FROM {}", table),
                    [],
                    |row| row.get::<_, Option<i64>>(0),
                )?
                .unwrap_or(0),
        };
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let ds = DataSource::open_in_memory().unwrap();
        sync_schema(&ds).unwrap();
        assert_eq!(read(&ds, "aggregate", 1).unwrap(), None);
        write(&ds, "aggregate", 1, 60_000).unwrap();
        write(&ds, "aggregate", 1, 120_000).unwrap();
        write(&ds, "gauge", 1, 5_000).unwrap();
        assert_eq!(read(&ds, "aggregate", 1).unwrap(), Some(120_000));
        assert_eq!(read(&ds, "gauge", 1).unwrap(), Some(5_000));
    }

    #[test]
    fn test_initial_times_fall_back_to_max_capture_time() {
        let ds = DataSource::open_in_memory().unwrap();
        sync_schema(&ds).unwrap();
        let tables: Vec<String> = (0..3).map(|l| format!("t_{}", l)).collect();
        for table in &tables {
            ds.sync_table(table, &[Column::new("capture_time", "INTEGER NOT NULL")])
                .unwrap();
        }
        ds.execute("INSERT INTO t_0 (capture_time) VALUES (500)", []).unwrap();
        ds.execute("INSERT INTO t_1 (capture_time) VALUES (60000)", []).unwrap();
        write(&ds, "aggregate", 2, 300_000).unwrap();

        let times = initial_last_rollup_times(&ds, "aggregate", &tables).unwrap();
        assert_eq!(times, vec![0, 60_000, 300_000]);
    }
}
