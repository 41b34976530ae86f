//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use trellis_aggregator::config::{RollupConfig, StorageConfig};
use trellis_aggregator::query::AggregateQuery;
use trellis_aggregator::storage::{DataSource, Storage};
use trellis_shared::{
    Aggregate, DurationHistogram, Query, Timer, TransactionNameAggregate,
    TransactionTypeAggregates,
};

pub const HOUR: i64 = 3_600_000;

/// Raw level every second, level 1 every minute.
pub fn two_level_config(data_dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        data_dir: data_dir.to_path_buf(),
        aggregate_rollups: vec![
            RollupConfig::new(1_000, HOUR),
            RollupConfig::new(60_000, 8 * HOUR),
        ],
        aggregate_retention_hours: vec![24, 48],
        rollup_capped_store_sizes_mb: vec![1, 1],
        trace_capped_store_size_mb: 1,
        ..Default::default()
    }
}

pub fn open_in_memory(dir: &TempDir, config: &StorageConfig) -> Arc<Storage> {
    Arc::new(
        Storage::open_with(config, DataSource::open_in_memory().unwrap(), dir.path()).unwrap(),
    )
}

pub fn aggregate(duration: f64, count: u64) -> Aggregate {
    let mut histogram = DurationHistogram::new();
    histogram.record(duration as u64);
    Aggregate {
        total_duration_nanos: duration,
        transaction_count: count,
        duration_histogram: histogram,
        main_thread_root_timers: vec![Timer::new("http request", duration, count)],
        queries: vec![Query::new("SQL", "select * from orders", duration / 2.0, count)],
        ..Default::default()
    }
}

pub fn group(transaction_type: &str, name: &str, duration: f64, count: u64) -> TransactionTypeAggregates {
    TransactionTypeAggregates {
        transaction_type: transaction_type.to_string(),
        overall: aggregate(duration, count),
        transactions: vec![TransactionNameAggregate {
            transaction_name: name.to_string(),
            aggregate: aggregate(duration, count),
        }],
    }
}

pub fn series(transaction_type: &str, from: i64, to: i64, level: usize) -> AggregateQuery {
    AggregateQuery {
        transaction_type: transaction_type.to_string(),
        transaction_name: None,
        from,
        to,
        rollup_level: level,
    }
}
