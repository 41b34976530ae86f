//! Rows outliving their capped payloads

mod common;

use common::*;
use std::sync::Arc;
use tempfile::TempDir;
use trellis_aggregator::merge::QueryCollector;
use trellis_aggregator::storage::{AggregateDao, CappedStore, DataSource, TransactionTypeDao};

const RING_BYTES: u64 = 4096;

fn small_ring_dao(dir: &TempDir) -> AggregateDao {
    let config = two_level_config(dir.path());
    let data_source = Arc::new(DataSource::open_in_memory().unwrap());
    let stores = (0..2)
        .map(|l| {
            CappedStore::open(&dir.path().join(format!("rollup-{}.capped", l)), RING_BYTES).unwrap()
        })
        .collect();
    let types = Arc::new(TransactionTypeDao::new(data_source.clone()).unwrap());
    AggregateDao::new(data_source, stores, types, &config).unwrap()
}

#[test]
fn expired_payloads_read_as_empty() {
    let dir = TempDir::new().unwrap();
    let dao = small_ring_dao(&dir);
    for i in 1..=60 {
        dao.store(i * 1_000, &[group("Web", "/a", 10.0, 1)]).unwrap();
    }
    assert!(dao.capped_store(0).unwrap().smallest_non_expired_id().unwrap() > 0);

    let points = dao
        .read_overview_aggregates(&series("Web", 0, 60_000, 0))
        .unwrap();
    assert_eq!(points.len(), 60);
    // scalars survive, the oldest nested payloads are gone
    assert!(points.iter().all(|p| p.transaction_count == 1));
    assert!(points[0].root_timers.is_empty());
    assert_eq!(points[59].root_timers.main_thread.len(), 1);

    let percentiles = dao
        .read_percentile_aggregates(&series("Web", 0, 60_000, 0))
        .unwrap();
    assert!(percentiles[0].duration_histogram.is_empty());
    assert_eq!(percentiles[59].duration_histogram.len(), 1);

    // only the retained query payloads contribute
    let mut collector = QueryCollector::new(500);
    dao.merge_in_queries(&series("Web", 0, 60_000, 0), &mut collector)
        .unwrap();
    let queries = collector.into_entries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].execution_count >= 1);
    assert!(queries[0].execution_count < 60);
}
