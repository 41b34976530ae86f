//! Live (collected but not yet flushed) aggregates
//!
//! [`LiveBuffer`] holds one entry per capture interval until the collector
//! flushes it. [`AggregateRepository`] answers reads by combining the
//! persisted rows with these live intervals; the historical range is cut off
//! just before the earliest live capture time so nothing is counted twice.

use crate::error::Result;
use crate::merge::{
    merge_profile, merge_transaction_type_aggregates, MergeLimits, MutableAggregate,
    QueryCollector, ServiceCallCollector,
};
use crate::metrics;
use crate::query::{
    AggregateQuery, OverallErrorSummary, OverallSummary, OverviewAggregate, PercentileAggregate,
    SummaryQuery, ThroughputAggregate,
};
use crate::rollup::{rollup_capture_time, RollupLevelService};
use crate::storage::AggregateDao;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};
use trellis_shared::{Aggregate, Profile, Query, ServiceCall, TransactionTypeAggregates};

/// All aggregates collected for one capture interval
#[derive(Debug, Clone, PartialEq)]
pub struct LiveInterval {
    pub capture_time: i64,
    pub groups: Vec<TransactionTypeAggregates>,
}

impl LiveInterval {
    fn aggregate(&self, transaction_type: &str, transaction_name: Option<&str>) -> Option<&Aggregate> {
        let group = self
            .groups
            .iter()
            .find(|g| g.transaction_type == transaction_type)?;
        match transaction_name {
            None => Some(&group.overall),
            Some(name) => group
                .transactions
                .iter()
                .find(|t| t.transaction_name == name)
                .map(|t| &t.aggregate),
        }
    }
}

/// Bounded, capture-time ordered buffer of live intervals. Thread-safe.
#[derive(Debug)]
pub struct LiveBuffer {
    max_intervals: usize,
    limits: MergeLimits,
    intervals: RwLock<VecDeque<LiveInterval>>,
}

impl LiveBuffer {
    pub fn new(max_intervals: usize, limits: MergeLimits) -> Self {
        Self {
            max_intervals: max_intervals.max(1),
            limits,
            intervals: RwLock::new(VecDeque::with_capacity(max_intervals.min(4096))),
        }
    }

    /// Add aggregates for `capture_time`, merging into an interval already
    /// buffered for that time. Drops the oldest intervals when full.
    pub fn push(&self, capture_time: i64, groups: Vec<TransactionTypeAggregates>) -> Result<()> {
        let mut intervals = self.intervals.write()?;
        match intervals.iter().position(|i| i.capture_time >= capture_time) {
            Some(idx) if intervals[idx].capture_time == capture_time => {
                let existing = std::mem::take(&mut intervals[idx].groups);
                intervals[idx].groups =
                    merge_transaction_type_aggregates(existing, &groups, self.limits)?;
            }
            Some(idx) => intervals.insert(idx, LiveInterval { capture_time, groups }),
            None => intervals.push_back(LiveInterval { capture_time, groups }),
        }

        let mut drops = 0u64;
        while intervals.len() > self.max_intervals {
            if let Some(dropped) = intervals.pop_front() {
                tracing::warn!(
                    capture_time = dropped.capture_time,
                    "Live buffer full, dropping unflushed interval"
                );
            }
            drops += 1;
        }
        metrics::LIVE_PENDING_INTERVALS.set(intervals.len() as f64);
        if drops > 0 {
            metrics::LIVE_DROPS.inc_by(drops as f64);
        }
        Ok(())
    }

    /// Intervals whose capture time is at or before `now`, oldest first.
    pub fn completed(&self, now: i64) -> Result<Vec<LiveInterval>> {
        let intervals = self.intervals.read()?;
        Ok(intervals
            .iter()
            .take_while(|i| i.capture_time <= now)
            .cloned()
            .collect())
    }

    /// Remove every interval at or before `capture_time`.
    pub fn remove_through(&self, capture_time: i64) -> Result<usize> {
        let mut intervals = self.intervals.write()?;
        let before = intervals.len();
        intervals.retain(|i| i.capture_time > capture_time);
        metrics::LIVE_PENDING_INTERVALS.set(intervals.len() as f64);
        Ok(before - intervals.len())
    }

    pub fn earliest_capture_time(&self) -> Result<Option<i64>> {
        Ok(self.intervals.read()?.front().map(|i| i.capture_time))
    }

    /// Intervals in `(from, to]`, or `[from, to]` when `from_inclusive`.
    pub fn intervals_in(&self, from: i64, to: i64, from_inclusive: bool) -> Result<Vec<LiveInterval>> {
        let intervals = self.intervals.read()?;
        Ok(intervals
            .iter()
            .filter(|i| {
                let after_from = if from_inclusive {
                    i.capture_time >= from
                } else {
                    i.capture_time > from
                };
                after_from && i.capture_time <= to
            })
            .cloned()
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.intervals.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Read side combining persisted and live aggregates.
///
/// Above level 0 a read also covers rows already flushed to level 0 but not
/// yet rolled up: persisted data at the query's level stops at that level's
/// last rollup time and the raw rows after it are merged in.
pub struct AggregateRepository {
    aggregates: Arc<AggregateDao>,
    live: Arc<LiveBuffer>,
    rollup_levels: RollupLevelService,
    limits: MergeLimits,
}

/// One persisted part of a read: rows of `level` captured after `after`,
/// up to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    level: usize,
    after: i64,
    to: i64,
}

impl Segment {
    fn summary_query(&self, query: &SummaryQuery) -> SummaryQuery {
        SummaryQuery {
            from: query.from.max(self.after),
            to: self.to,
            rollup_level: self.level,
            ..query.clone()
        }
    }

    /// `(from, to]` bounds, for detail merges.
    fn detail_query(&self, query: &AggregateQuery) -> AggregateQuery {
        AggregateQuery {
            from: query.from.max(self.after),
            to: self.to,
            rollup_level: self.level,
            ..query.clone()
        }
    }

    /// `[from, to]` bounds, for point series.
    fn series_query(&self, query: &AggregateQuery) -> AggregateQuery {
        AggregateQuery {
            from: query.from.max(self.after.saturating_add(1)),
            to: self.to,
            rollup_level: self.level,
            ..query.clone()
        }
    }
}

/// Persisted parts of a read: the query's own level, then the raw tail.
struct Segments {
    rolled: Segment,
    tail: Option<Segment>,
}

impl Segments {
    fn iter(&self) -> impl Iterator<Item = &Segment> {
        std::iter::once(&self.rolled).chain(self.tail.iter())
    }
}

impl AggregateRepository {
    pub fn new(
        aggregates: Arc<AggregateDao>,
        live: Arc<LiveBuffer>,
        rollup_levels: RollupLevelService,
        limits: MergeLimits,
    ) -> Self {
        Self {
            aggregates,
            live,
            rollup_levels,
            limits,
        }
    }

    pub fn rollup_levels(&self) -> &RollupLevelService {
        &self.rollup_levels
    }

    /// Upper bound for the persisted part of a read ending at `to`.
    fn historical_to(&self, to: i64) -> Result<i64> {
        Ok(match self.live.earliest_capture_time()? {
            Some(earliest) => to.min(earliest - 1),
            None => to,
        })
    }

    fn segments(&self, level: usize, to: i64) -> Result<Segments> {
        let historical_to = self.historical_to(to)?;
        if level == 0 {
            return Ok(Segments {
                rolled: Segment { level, after: i64::MIN, to: historical_to },
                tail: None,
            });
        }
        let last = self.aggregates.last_rollup_time(level)?;
        Ok(Segments {
            rolled: Segment { level, after: i64::MIN, to: historical_to.min(last) },
            tail: (historical_to > last).then_some(Segment {
                level: 0,
                after: last,
                to: historical_to,
            }),
        })
    }

    pub fn read_overall_summary(&self, query: &SummaryQuery) -> Result<OverallSummary> {
        let mut summary = OverallSummary::default();
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            let part = self.aggregates.read_overall_summary(&segment.summary_query(query))?;
            summary.total_duration_nanos += part.total_duration_nanos;
            summary.transaction_count += part.transaction_count;
            summary.last_capture_time = summary.last_capture_time.max(part.last_capture_time);
        }
        for interval in self.live.intervals_in(query.from, query.to, false)? {
            if let Some(aggregate) = interval.aggregate(&query.transaction_type, None) {
                summary.total_duration_nanos += aggregate.total_duration_nanos;
                summary.transaction_count += aggregate.transaction_count;
                summary.last_capture_time = summary.last_capture_time.max(interval.capture_time);
            }
        }
        Ok(summary)
    }

    pub fn read_overall_error_summary(&self, query: &SummaryQuery) -> Result<OverallErrorSummary> {
        let mut summary = OverallErrorSummary::default();
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            let part = self
                .aggregates
                .read_overall_error_summary(&segment.summary_query(query))?;
            summary.error_count += part.error_count;
            summary.transaction_count += part.transaction_count;
            summary.last_capture_time = summary.last_capture_time.max(part.last_capture_time);
        }
        for interval in self.live.intervals_in(query.from, query.to, false)? {
            if let Some(aggregate) = interval.aggregate(&query.transaction_type, None) {
                summary.error_count += aggregate.error_count;
                summary.transaction_count += aggregate.transaction_count;
                summary.last_capture_time = summary.last_capture_time.max(interval.capture_time);
            }
        }
        Ok(summary)
    }

    pub fn read_overview_aggregates(&self, query: &AggregateQuery) -> Result<Vec<OverviewAggregate>> {
        let segments = self.segments(query.rollup_level, query.to)?;
        let mut points = self
            .aggregates
            .read_overview_aggregates(&segments.rolled.series_query(query))?;
        for (capture_time, aggregate) in self.recent_points(query, &segments)? {
            points.push(OverviewAggregate {
                capture_time,
                total_duration_nanos: aggregate.total_duration_nanos,
                transaction_count: aggregate.transaction_count,
                async_transactions: aggregate.async_transactions,
                root_timers: aggregate.root_timers(),
                main_thread_stats: aggregate.main_thread_stats,
                aux_thread_stats: aggregate.aux_thread_stats,
            });
        }
        Ok(points)
    }

    pub fn read_percentile_aggregates(&self, query: &AggregateQuery) -> Result<Vec<PercentileAggregate>> {
        let segments = self.segments(query.rollup_level, query.to)?;
        let mut points = self
            .aggregates
            .read_percentile_aggregates(&segments.rolled.series_query(query))?;
        for (capture_time, aggregate) in self.recent_points(query, &segments)? {
            points.push(PercentileAggregate {
                capture_time,
                total_duration_nanos: aggregate.total_duration_nanos,
                transaction_count: aggregate.transaction_count,
                duration_histogram: aggregate.duration_histogram,
            });
        }
        Ok(points)
    }

    pub fn read_throughput_aggregates(&self, query: &AggregateQuery) -> Result<Vec<ThroughputAggregate>> {
        let segments = self.segments(query.rollup_level, query.to)?;
        let mut points = self
            .aggregates
            .read_throughput_aggregates(&segments.rolled.series_query(query))?;
        for (capture_time, aggregate) in self.recent_points(query, &segments)? {
            points.push(ThroughputAggregate {
                capture_time,
                transaction_count: aggregate.transaction_count,
            });
        }
        Ok(points)
    }

    /// Queries over `(from, to]`, live intervals included.
    pub fn read_queries(&self, query: &AggregateQuery) -> Result<Vec<Query>> {
        let mut collector = QueryCollector::new(self.limits.max_queries_per_type);
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            self.aggregates
                .merge_in_queries(&segment.detail_query(query), &mut collector)?;
        }
        for aggregate in self.live_aggregates(query)? {
            collector.merge(&aggregate.queries);
        }
        Ok(collector.into_entries())
    }

    /// Service calls over `(from, to]`, live intervals included.
    pub fn read_service_calls(&self, query: &AggregateQuery) -> Result<Vec<ServiceCall>> {
        let mut collector = ServiceCallCollector::new(self.limits.max_service_calls_per_type);
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            self.aggregates
                .merge_in_service_calls(&segment.detail_query(query), &mut collector)?;
        }
        for aggregate in self.live_aggregates(query)? {
            collector.merge(&aggregate.service_calls);
        }
        Ok(collector.into_entries())
    }

    /// Main thread profile over `(from, to]`, live intervals included.
    pub fn read_main_thread_profile(&self, query: &AggregateQuery) -> Result<Profile> {
        let mut profile = Profile::new();
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            self.aggregates
                .merge_in_main_thread_profiles(&segment.detail_query(query), &mut profile)?;
        }
        for aggregate in self.live_aggregates(query)? {
            if let Some(live) = &aggregate.main_thread_profile {
                merge_profile(&mut profile, live);
            }
        }
        Ok(profile)
    }

    /// Aux thread profile over `(from, to]`, live intervals included.
    pub fn read_aux_thread_profile(&self, query: &AggregateQuery) -> Result<Profile> {
        let mut profile = Profile::new();
        for segment in self.segments(query.rollup_level, query.to)?.iter() {
            self.aggregates
                .merge_in_aux_thread_profiles(&segment.detail_query(query), &mut profile)?;
        }
        for aggregate in self.live_aggregates(query)? {
            if let Some(live) = &aggregate.aux_thread_profile {
                merge_profile(&mut profile, live);
            }
        }
        Ok(profile)
    }

    fn live_aggregates(&self, query: &AggregateQuery) -> Result<Vec<Aggregate>> {
        Ok(self
            .live
            .intervals_in(query.from, query.to, false)?
            .iter()
            .filter_map(|i| {
                i.aggregate(&query.transaction_type, query.transaction_name.as_deref())
                    .cloned()
            })
            .collect())
    }

    /// Raw rows not yet rolled up and live intervals in `[from, to]`, merged
    /// into data points of the query's rollup level.
    fn recent_points(&self, query: &AggregateQuery, segments: &Segments) -> Result<Vec<(i64, Aggregate)>> {
        let interval = self.rollup_levels.data_point_interval_millis(query.rollup_level);
        let point_time = |capture_time: i64| {
            if query.rollup_level == 0 {
                capture_time
            } else {
                rollup_capture_time(capture_time, interval)
            }
        };
        let mut buckets: BTreeMap<i64, MutableAggregate> = BTreeMap::new();
        if let Some(tail) = &segments.tail {
            for (capture_time, aggregate) in
                self.aggregates.read_aggregates(&tail.series_query(query))?
            {
                buckets
                    .entry(point_time(capture_time))
                    .or_insert_with(|| MutableAggregate::new(self.limits))
                    .merge_aggregate(&aggregate)?;
            }
        }
        for live in self.live.intervals_in(query.from, query.to, true)? {
            let Some(aggregate) =
                live.aggregate(&query.transaction_type, query.transaction_name.as_deref())
            else {
                continue;
            };
            buckets
                .entry(point_time(live.capture_time))
                .or_insert_with(|| MutableAggregate::new(self.limits))
                .merge_aggregate(aggregate)?;
        }
        Ok(buckets
            .into_iter()
            .map(|(capture_time, m)| (capture_time, m.to_aggregate()))
            .collect())
    }
}
