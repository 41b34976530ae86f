//! Retention sweeps across aggregate, gauge and trace storage

mod common;

use common::*;
use tempfile::TempDir;
use trellis_aggregator::config::RollupConfig;
use trellis_aggregator::reaper::Reaper;
use trellis_shared::{GaugeValue, Trace, TraceHeader};

const NOW: i64 = 10 * HOUR;

fn trace(id: &str, capture_time: i64) -> Trace {
    Trace {
        id: id.to_string(),
        header: TraceHeader {
            slow: true,
            capture_time,
            duration_nanos: 2_000_000_000,
            transaction_type: "Web".to_string(),
            transaction_name: "/checkout".to_string(),
            ..Default::default()
        },
        entries: Vec::new(),
        main_thread_profile: None,
        aux_thread_profile: None,
    }
}

#[test]
fn sweep_applies_per_level_retention_and_prunes_lookups() {
    let dir = TempDir::new().unwrap();
    let mut config = two_level_config(dir.path());
    config.aggregate_rollups = vec![
        RollupConfig::new(60_000, HOUR),
        RollupConfig::new(300_000, 8 * HOUR),
    ];
    config.aggregate_retention_hours = vec![1, 2];
    config.trace_retention_hours = 1;
    let storage = open_in_memory(&dir, &config);

    storage.aggregates.store(7 * HOUR, &[group("Ancient", "/a", 10.0, 1)]).unwrap();
    storage.aggregates.store(8 * HOUR + HOUR / 2, &[group("Old", "/a", 10.0, 1)]).unwrap();
    storage.aggregates.store(NOW, &[]).unwrap();
    storage
        .gauge_values
        .store(&[GaugeValue::new("jvm/heap", 5 * HOUR, 1.0, 1)])
        .unwrap();
    storage.gauge_values.rollup(NOW).unwrap();
    storage.traces.store(&trace("t-old", 8 * HOUR)).unwrap();
    storage.traces.store(&trace("t-new", NOW - 1_000)).unwrap();

    let report = Reaper::new(storage.clone(), &config).run_once(NOW);
    assert_eq!(report.failures, 0);
    assert!(report.rows_deleted > 0);

    // level 0 keeps one hour, level 1 keeps two
    assert!(storage
        .aggregates
        .read_throughput_aggregates(&series("Old", 0, NOW, 0))
        .unwrap()
        .is_empty());
    assert_eq!(
        storage
            .aggregates
            .read_throughput_aggregates(&series("Old", 0, NOW, 1))
            .unwrap()
            .len(),
        1
    );
    assert!(storage
        .aggregates
        .read_throughput_aggregates(&series("Ancient", 0, NOW, 1))
        .unwrap()
        .is_empty());

    // "Old" is still referenced by level 1, "Ancient" by nothing
    assert_eq!(storage.transaction_types.read_transaction_types().unwrap(), vec!["Old"]);

    // raw gauge values expire after 4 hours, the gauge name lives on
    assert!(storage
        .gauge_values
        .read_gauge_values("jvm/heap", 0, NOW, 0)
        .unwrap()
        .is_empty());
    assert_eq!(
        storage.gauge_values.read_gauge_values("jvm/heap", 0, NOW, 1).unwrap().len(),
        1
    );
    assert_eq!(storage.gauge_names.read_gauge_names().unwrap(), vec!["jvm/heap"]);

    assert!(storage.traces.read_header("t-old").unwrap().is_none());
    assert!(storage.traces.read_header("t-new").unwrap().is_some());
}

#[test]
fn sweep_on_closing_storage_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = two_level_config(dir.path());
    let storage = open_in_memory(&dir, &config);
    storage.aggregates.store(1_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    storage.close();

    let report = Reaper::new(storage.clone(), &config).run_once(i64::MAX / 2);
    assert_eq!(report.rows_deleted, 0);
    assert_eq!(report.failures, 0);
}
