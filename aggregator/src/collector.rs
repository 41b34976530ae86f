//! Collection interface entry point
//!
//! Aggregates are buffered per capture interval in the [`LiveBuffer`] and
//! persisted by [`Collector::flush`]; gauge values and traces go straight to
//! storage and roll up from their own capture times.

use crate::error::Result;
use crate::live::LiveBuffer;
use crate::storage::{AggregateDao, GaugeValueDao, TraceDao};
use std::sync::Arc;
use trellis_shared::utils::time::format_capture_time;
use trellis_shared::{GaugeValue, Trace, TransactionTypeAggregates};

pub struct Collector {
    aggregates: Arc<AggregateDao>,
    gauge_values: Arc<GaugeValueDao>,
    traces: Arc<TraceDao>,
    live: Arc<LiveBuffer>,
    /// How long an interval may arrive after its capture time and still be
    /// part of its rollup window.
    rollup_grace_millis: i64,
}

impl Collector {
    pub fn new(
        aggregates: Arc<AggregateDao>,
        gauge_values: Arc<GaugeValueDao>,
        traces: Arc<TraceDao>,
        live: Arc<LiveBuffer>,
        rollup_grace_millis: i64,
    ) -> Self {
        Self {
            aggregates,
            gauge_values,
            traces,
            live,
            rollup_grace_millis: rollup_grace_millis.max(0),
        }
    }

    pub fn live(&self) -> &Arc<LiveBuffer> {
        &self.live
    }

    /// Buffer one interval's aggregate groups until the next flush.
    pub fn collect_aggregates(
        &self,
        capture_time: i64,
        groups: Vec<TransactionTypeAggregates>,
    ) -> Result<()> {
        tracing::trace!(capture_time, groups = groups.len(), "Collected aggregates");
        self.live.push(capture_time, groups)
    }

    pub fn collect_gauge_values(&self, values: &[GaugeValue]) -> Result<()> {
        self.gauge_values.store(values)
    }

    pub fn collect_trace(&self, trace: &Trace) -> Result<()> {
        self.traces.store(trace)
    }

    /// Persist every live interval captured at or before `now`, oldest
    /// first. Each store rolls up to its own capture time. Coarser levels
    /// are then advanced to `now - rollup_grace_millis`, never to `now`
    /// itself, so an interval still in flight keeps its window open.
    ///
    /// An interval leaves the live buffer only after it is stored, so a
    /// failed store is retried on the next flush.
    pub fn flush(&self, now: i64) -> Result<usize> {
        let completed = self.live.completed(now)?;
        let flushed = completed.len();
        for interval in completed {
            self.aggregates.store(interval.capture_time, &interval.groups)?;
            self.live.remove_through(interval.capture_time)?;
            tracing::debug!(
                capture_time = %format_capture_time(interval.capture_time),
                groups = interval.groups.len(),
                "Flushed live interval"
            );
        }
        self.aggregates
            .rollup(now.saturating_sub(self.rollup_grace_millis))?;
        Ok(flushed)
    }
}
