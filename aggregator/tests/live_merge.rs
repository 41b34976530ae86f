//! Reads combining persisted rows with not-yet-flushed live intervals

mod common;

use common::*;
use std::sync::Arc;
use tempfile::TempDir;
use trellis_aggregator::config::StorageConfig;
use trellis_aggregator::live::{AggregateRepository, LiveBuffer};
use trellis_aggregator::merge::MergeLimits;
use trellis_aggregator::query::{AggregateQuery, SummaryQuery};
use trellis_aggregator::rollup::RollupLevelService;
use trellis_aggregator::storage::Storage;

struct Fixture {
    _dir: TempDir,
    storage: Arc<Storage>,
    live: Arc<LiveBuffer>,
    repository: AggregateRepository,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config: StorageConfig = two_level_config(dir.path());
    let storage = open_in_memory(&dir, &config);
    let limits = MergeLimits::new(500, 500);
    let live = Arc::new(LiveBuffer::new(60, limits));
    let repository = AggregateRepository::new(
        storage.aggregates.clone(),
        live.clone(),
        RollupLevelService::new(&config),
        limits,
    );
    Fixture {
        _dir: dir,
        storage,
        live,
        repository,
    }
}

#[test]
fn live_intervals_extend_series_without_double_counting() {
    let f = fixture();
    f.storage.aggregates.store(1_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    f.storage.aggregates.store(2_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    // 2000 is both persisted and still live, as after an interrupted flush
    f.live.push(2_000, vec![group("Web", "/a", 10.0, 1)]).unwrap();
    f.live.push(3_000, vec![group("Web", "/a", 10.0, 1)]).unwrap();

    let points = f
        .repository
        .read_throughput_aggregates(&series("Web", 0, 4_000, 0))
        .unwrap();
    let times: Vec<(i64, u64)> = points.iter().map(|p| (p.capture_time, p.transaction_count)).collect();
    assert_eq!(times, vec![(1_000, 1), (2_000, 1), (3_000, 1)]);

    let summary = f
        .repository
        .read_overall_summary(&SummaryQuery {
            transaction_type: "Web".to_string(),
            from: 0,
            to: 4_000,
            rollup_level: 0,
        })
        .unwrap();
    assert_eq!(summary.transaction_count, 3);
    assert_eq!(summary.last_capture_time, 3_000);
}

#[test]
fn live_points_group_into_rollup_buckets() {
    let f = fixture();
    f.live.push(61_000, vec![group("Web", "/a", 10.0, 1)]).unwrap();
    f.live.push(62_000, vec![group("Web", "/b", 30.0, 3)]).unwrap();

    let points = f
        .repository
        .read_overview_aggregates(&series("Web", 0, 200_000, 1))
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].capture_time, 120_000);
    assert_eq!(points[0].transaction_count, 4);
    assert_eq!(points[0].total_duration_nanos, 40.0);
    assert_eq!(points[0].root_timers.main_thread[0].count, 4);

    let percentiles = f
        .repository
        .read_percentile_aggregates(&series("Web", 0, 200_000, 1))
        .unwrap();
    assert_eq!(percentiles[0].duration_histogram.len(), 2);
}

#[test]
fn transaction_name_filter_applies_to_live_data() {
    let f = fixture();
    f.live.push(1_000, vec![group("Web", "/a", 10.0, 1)]).unwrap();
    f.live.push(2_000, vec![group("Web", "/b", 10.0, 1)]).unwrap();

    let query = AggregateQuery {
        transaction_name: Some("/b".to_string()),
        ..series("Web", 0, 4_000, 0)
    };
    let points = f.repository.read_throughput_aggregates(&query).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].capture_time, 2_000);
}

#[test]
fn queries_merge_persisted_and_live() {
    let f = fixture();
    f.storage.aggregates.store(1_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    f.live.push(2_000, vec![group("Web", "/a", 20.0, 2)]).unwrap();

    let queries = f.repository.read_queries(&series("Web", 0, 4_000, 0)).unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].execution_count, 3);
    assert_eq!(queries[0].total_duration_nanos, 15.0);
}

#[test]
fn coarser_reads_include_rows_awaiting_rollup() {
    let f = fixture();
    f.storage.aggregates.store(30_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    // Closes the 60000 window; 61000 stays at level 0 until 120000 closes.
    f.storage.aggregates.store(61_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    f.live.push(62_000, vec![group("Web", "/a", 10.0, 1)]).unwrap();
    assert_eq!(f.storage.aggregates.last_rollup_time(1).unwrap(), 60_000);

    let points: Vec<(i64, u64)> = f
        .repository
        .read_throughput_aggregates(&series("Web", 0, 200_000, 1))
        .unwrap()
        .iter()
        .map(|p| (p.capture_time, p.transaction_count))
        .collect();
    assert_eq!(points, vec![(60_000, 1), (120_000, 2)]);

    let percentiles = f
        .repository
        .read_percentile_aggregates(&series("Web", 60_001, 200_000, 1))
        .unwrap();
    assert_eq!(percentiles.len(), 1);
    assert_eq!(percentiles[0].duration_histogram.len(), 2);

    let summary = f
        .repository
        .read_overall_summary(&SummaryQuery {
            transaction_type: "Web".to_string(),
            from: 0,
            to: 200_000,
            rollup_level: 1,
        })
        .unwrap();
    assert_eq!(summary.transaction_count, 3);
    assert_eq!(summary.last_capture_time, 62_000);

    let queries = f.repository.read_queries(&series("Web", 0, 200_000, 1)).unwrap();
    assert_eq!(queries[0].execution_count, 3);
}

#[test]
fn coarser_reads_skip_tail_once_rolled_up() {
    let f = fixture();
    f.storage.aggregates.store(61_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    f.storage.aggregates.store(125_000, &[]).unwrap();
    assert_eq!(f.storage.aggregates.last_rollup_time(1).unwrap(), 120_000);

    let points: Vec<(i64, u64)> = f
        .repository
        .read_throughput_aggregates(&series("Web", 0, 200_000, 1))
        .unwrap()
        .iter()
        .map(|p| (p.capture_time, p.transaction_count))
        .collect();
    assert_eq!(points, vec![(120_000, 1)]);
}
