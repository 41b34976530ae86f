//! Aggregate merge engine
//!
//! [`MutableAggregate`] accumulates any number of same-key aggregates and
//! finalizes into a plain [`Aggregate`]. Every field merges through the free
//! functions in the submodules, so merge order only affects histogram
//! approximation and the order of detail entries.

pub mod detail;
pub mod gauge;
pub mod profile;
pub mod thread_stats;
pub mod timers;

pub use detail::{DetailCollector, DetailEntry, QueryCollector, ServiceCallCollector, LIMIT_EXCEEDED_BUCKET};
pub use gauge::weighted_mean;
pub use profile::{merge_optional_profile, merge_profile};
pub use thread_stats::merge_thread_stats;
pub use timers::{merge_root_timers, merge_timers};

use std::collections::BTreeMap;
use trellis_shared::{
    Aggregate, DurationHistogram, HistogramError, Profile, Query, RootTimers, ServiceCall,
    ThreadStats, TransactionNameAggregate, TransactionTypeAggregates,
};

/// Caps applied to the detail tables while merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_queries_per_type: usize,
    pub max_service_calls_per_type: usize,
}

impl MergeLimits {
    pub fn new(max_queries_per_type: usize, max_service_calls_per_type: usize) -> Self {
        Self {
            max_queries_per_type,
            max_service_calls_per_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutableAggregate {
    total_duration_nanos: f64,
    transaction_count: u64,
    error_count: u64,
    async_transactions: bool,
    root_timers: RootTimers,
    main_thread_stats: Option<ThreadStats>,
    aux_thread_stats: Option<ThreadStats>,
    duration_histogram: DurationHistogram,
    queries: QueryCollector,
    service_calls: ServiceCallCollector,
    main_thread_profile: Option<Profile>,
    aux_thread_profile: Option<Profile>,
}

impl MutableAggregate {
    pub fn new(limits: MergeLimits) -> Self {
        Self {
            total_duration_nanos: 0.0,
            transaction_count: 0,
            error_count: 0,
            async_transactions: false,
            root_timers: RootTimers::default(),
            main_thread_stats: None,
            aux_thread_stats: None,
            duration_histogram: DurationHistogram::new(),
            queries: QueryCollector::new(limits.max_queries_per_type),
            service_calls: ServiceCallCollector::new(limits.max_service_calls_per_type),
            main_thread_profile: None,
            aux_thread_profile: None,
        }
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    /// Merge every field of `aggregate`.
    pub fn merge_aggregate(&mut self, aggregate: &Aggregate) -> Result<(), HistogramError> {
        self.add_counts(
            aggregate.total_duration_nanos,
            aggregate.transaction_count,
            aggregate.error_count,
            aggregate.async_transactions,
        );
        merge_timers(&mut self.root_timers.main_thread, &aggregate.main_thread_root_timers);
        merge_timers(&mut self.root_timers.aux_thread, &aggregate.aux_thread_root_timers);
        merge_timers(&mut self.root_timers.async_timers, &aggregate.async_timers);
        self.merge_main_thread_stats(aggregate.main_thread_stats);
        self.merge_aux_thread_stats(aggregate.aux_thread_stats);
        self.merge_histogram(&aggregate.duration_histogram)?;
        self.merge_queries(&aggregate.queries);
        self.merge_service_calls(&aggregate.service_calls);
        self.merge_main_thread_profile(aggregate.main_thread_profile.as_ref());
        self.merge_aux_thread_profile(aggregate.aux_thread_profile.as_ref());
        Ok(())
    }

    /// Sum the scalar fields; the async flag is sticky.
    pub fn add_counts(
        &mut self,
        total_duration_nanos: f64,
        transaction_count: u64,
        error_count: u64,
        async_transactions: bool,
    ) {
        self.total_duration_nanos += total_duration_nanos;
        self.transaction_count += transaction_count;
        self.error_count += error_count;
        self.async_transactions |= async_transactions;
    }

    pub fn merge_root_timers(&mut self, timers: &RootTimers) {
        merge_root_timers(&mut self.root_timers, timers);
    }

    pub fn merge_main_thread_stats(&mut self, stats: Option<ThreadStats>) {
        self.main_thread_stats = merge_thread_stats(self.main_thread_stats, stats);
    }

    pub fn merge_aux_thread_stats(&mut self, stats: Option<ThreadStats>) {
        self.aux_thread_stats = merge_thread_stats(self.aux_thread_stats, stats);
    }

    pub fn merge_histogram(&mut self, histogram: &DurationHistogram) -> Result<(), HistogramError> {
        if histogram.is_empty() {
            return Ok(());
        }
        self.duration_histogram.merge(histogram)
    }

    pub fn merge_queries(&mut self, queries: &[Query]) {
        self.queries.merge(queries);
    }

    pub fn merge_service_calls(&mut self, service_calls: &[ServiceCall]) {
        self.service_calls.merge(service_calls);
    }

    pub fn merge_main_thread_profile(&mut self, profile: Option<&Profile>) {
        merge_optional_profile(&mut self.main_thread_profile, profile);
    }

    pub fn merge_aux_thread_profile(&mut self, profile: Option<&Profile>) {
        merge_optional_profile(&mut self.aux_thread_profile, profile);
    }

    pub fn to_aggregate(self) -> Aggregate {
        Aggregate {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timers: self.root_timers.main_thread,
            aux_thread_root_timers: self.root_timers.aux_thread,
            async_timers: self.root_timers.async_timers,
            main_thread_stats: self.main_thread_stats,
            aux_thread_stats: self.aux_thread_stats,
            duration_histogram: self.duration_histogram,
            queries: self.queries.into_entries(),
            service_calls: self.service_calls.into_entries(),
            main_thread_profile: self.main_thread_profile,
            aux_thread_profile: self.aux_thread_profile,
        }
    }
}

/// Merge two batches of per-type aggregates captured in the same interval.
pub fn merge_transaction_type_aggregates(
    target: Vec<TransactionTypeAggregates>,
    source: &[TransactionTypeAggregates],
    limits: MergeLimits,
) -> Result<Vec<TransactionTypeAggregates>, HistogramError> {
    struct TypeAccumulator {
        overall: MutableAggregate,
        transactions: BTreeMap<String, MutableAggregate>,
    }

    let mut by_type: BTreeMap<String, TypeAccumulator> = BTreeMap::new();
    for group in target.iter().chain(source.iter()) {
        let acc = by_type
            .entry(group.transaction_type.clone())
            .or_insert_with(|| TypeAccumulator {
                overall: MutableAggregate::new(limits),
                transactions: BTreeMap::new(),
            });
        acc.overall.merge_aggregate(&group.overall)?;
        for tx in &group.transactions {
            acc.transactions
                .entry(tx.transaction_name.clone())
                .or_insert_with(|| MutableAggregate::new(limits))
                .merge_aggregate(&tx.aggregate)?;
        }
    }

    Ok(by_type
        .into_iter()
        .map(|(transaction_type, acc)| TransactionTypeAggregates {
            transaction_type,
            overall: acc.overall.to_aggregate(),
            transactions: acc
                .transactions
                .into_iter()
                .map(|(transaction_name, m)| TransactionNameAggregate {
                    transaction_name,
                    aggregate: m.to_aggregate(),
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_shared::Timer;

    fn limits() -> MergeLimits {
        MergeLimits::new(500, 500)
    }

    fn aggregate(duration: f64, count: u64, errors: u64) -> Aggregate {
        let mut histogram = DurationHistogram::new();
        for _ in 0..count {
            histogram.record((duration / count as f64) as u64);
        }
        Aggregate {
            total_duration_nanos: duration,
            transaction_count: count,
            error_count: errors,
            duration_histogram: histogram,
            main_thread_root_timers: vec![Timer::new("http request", duration, count)],
            ..Default::default()
        }
    }

    fn merge_all(aggregates: &[&Aggregate]) -> Aggregate {
        let mut m = MutableAggregate::new(limits());
        for a in aggregates {
            m.merge_aggregate(a).unwrap();
        }
        m.to_aggregate()
    }

    #[test]
    fn test_mean_preserved() {
        let a = aggregate(10.0, 1, 0);
        let b = aggregate(20.0, 2, 0);
        let c = aggregate(30.0, 3, 0);
        let merged = merge_all(&[&a, &b, &c]);
        assert_eq!(merged.total_duration_nanos, 60.0);
        assert_eq!(merged.transaction_count, 6);
        assert_eq!(merged.mean_duration_nanos(), 10.0);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = aggregate(100.0, 1, 1);
        let b = aggregate(250.0, 5, 0);
        let c = aggregate(75.0, 3, 2);
        let left = merge_all(&[&merge_all(&[&a, &b]), &c]);
        let right = merge_all(&[&a, &merge_all(&[&b, &c])]);
        assert_eq!(left.total_duration_nanos, right.total_duration_nanos);
        assert_eq!(left.transaction_count, right.transaction_count);
        assert_eq!(left.error_count, right.error_count);
        assert_eq!(left.duration_histogram.len(), right.duration_histogram.len());
        assert_eq!(left.main_thread_root_timers, right.main_thread_root_timers);
    }

    #[test]
    fn test_async_flag_is_sticky() {
        let mut async_aggregate = aggregate(1.0, 1, 0);
        async_aggregate.async_transactions = true;
        let merged = merge_all(&[&async_aggregate, &aggregate(1.0, 1, 0)]);
        assert!(merged.async_transactions);
        assert!(!merge_all(&[&aggregate(1.0, 1, 0)]).async_transactions);
    }

    #[test]
    fn test_aux_thread_stats_come_from_aux_source() {
        let main = ThreadStats {
            cpu_nanos: 1.0,
            blocked_nanos: 1.0,
            waited_nanos: 1.0,
            allocated_bytes: 1.0,
        };
        let aux = ThreadStats {
            cpu_nanos: 9.0,
            ..main
        };
        let a = Aggregate {
            main_thread_stats: Some(main),
            aux_thread_stats: Some(aux),
            ..Default::default()
        };
        let merged = merge_all(&[&a]);
        assert_eq!(merged.main_thread_stats, Some(main));
        assert_eq!(merged.aux_thread_stats, Some(aux));
    }

    #[test]
    fn test_empty_accumulator_finalizes_to_default() {
        let merged = MutableAggregate::new(limits()).to_aggregate();
        assert_eq!(merged, Aggregate::default());
    }

    #[test]
    fn test_merge_transaction_type_aggregates() {
        let first = vec![TransactionTypeAggregates {
            transaction_type: "Web".to_string(),
            overall: aggregate(10.0, 1, 0),
            transactions: vec![TransactionNameAggregate {
                transaction_name: "/checkout".to_string(),
                aggregate: aggregate(10.0, 1, 0),
            }],
        }];
        let second = vec![
            TransactionTypeAggregates {
                transaction_type: "Web".to_string(),
                overall: aggregate(30.0, 2, 1),
                transactions: vec![TransactionNameAggregate {
                    transaction_name: "/cart".to_string(),
                    aggregate: aggregate(30.0, 2, 1),
                }],
            },
            TransactionTypeAggregates {
                transaction_type: "Background".to_string(),
                overall: aggregate(5.0, 1, 0),
                transactions: vec![],
            },
        ];
        let merged = merge_transaction_type_aggregates(first, &second, limits()).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].transaction_type, "Background");
        let web = &merged[1];
        assert_eq!(web.overall.transaction_count, 3);
        assert_eq!(web.overall.error_count, 1);
        assert_eq!(web.transactions.len(), 2);
        assert_eq!(web.transactions[0].transaction_name, "/cart");
    }
}
