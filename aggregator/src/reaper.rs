//! Retention sweep
//!
//! Deletes rows older than each level's retention. Name lookups are pruned at
//! the minimum cutoff across levels, so a name stays as long as any level may
//! still reference it. Failures are logged and counted, never returned.

use crate::audit;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::metrics;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Instant;
use trellis_shared::utils::time::format_capture_time;

const MILLIS_PER_HOUR: i64 = 3_600_000;

pub struct Reaper {
    storage: Arc<Storage>,
    aggregate_retention_hours: Vec<u64>,
    gauge_retention_hours: Vec<u64>,
    trace_retention_hours: u64,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rows_deleted: usize,
    pub failures: usize,
}

impl Reaper {
    pub fn new(storage: Arc<Storage>, config: &StorageConfig) -> Self {
        Self {
            storage,
            aggregate_retention_hours: config.aggregate_retention_hours.clone(),
            gauge_retention_hours: config.gauge_retention_hours.clone(),
            trace_retention_hours: config.trace_retention_hours,
        }
    }

    pub fn run_once(&self, now: i64) -> SweepReport {
        if self.storage.is_closing() {
            return SweepReport::default();
        }
        let start = Instant::now();
        let mut report = SweepReport::default();

        let aggregates = &self.storage.aggregates;
        let aggregate_cutoff = self.sweep_levels(
            &mut report,
            "aggregate",
            &self.aggregate_retention_hours,
            now,
            |level, cutoff| aggregates.delete_before(level, cutoff),
        );
        let gauge_values = &self.storage.gauge_values;
        let gauge_cutoff = self.sweep_levels(
            &mut report,
            "gauge",
            &self.gauge_retention_hours,
            now,
            |level, cutoff| gauge_values.delete_before(level, cutoff),
        );
        let trace_cutoff = cutoff(now, self.trace_retention_hours);
        record(&mut report, "trace", self.storage.traces.delete_before(trace_cutoff));

        if let Some(cutoff) = aggregate_cutoff {
            record(
                &mut report,
                "transaction_type",
                self.storage.transaction_types.delete_before(cutoff),
            );
        }
        if let Some(cutoff) = gauge_cutoff {
            record(&mut report, "gauge_name", self.storage.gauge_names.delete_before(cutoff));
        }
        record(
            &mut report,
            "trace_attribute_name",
            self.storage.trace_attribute_names.delete_before(trace_cutoff),
        );

        let status = if report.failures == 0 { "ok" } else { "partial" };
        metrics::REAPER_RUNS.with_label_values(&[status]).inc();
        metrics::REAPER_ROWS_DELETED.inc_by(report.rows_deleted as f64);
        audit::retention_sweep(report.rows_deleted, report.failures);
        tracing::debug!(
            now = %format_capture_time(now),
            rows_deleted = report.rows_deleted,
            failures = report.failures,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retention sweep finished"
        );
        report
    }

    /// Sweep every level and return the minimum cutoff across them.
    fn sweep_levels<F>(
        &self,
        report: &mut SweepReport,
        kind: &str,
        retention_hours: &[u64],
        now: i64,
        delete: F,
    ) -> Option<i64>
    where
        F: Fn(usize, i64) -> Result<usize>,
    {
        let mut min_cutoff: Option<i64> = None;
        for (level, hours) in retention_hours.iter().enumerate() {
            let cutoff = cutoff(now, *hours);
            min_cutoff = Some(min_cutoff.map_or(cutoff, |m| m.min(cutoff)));
            match delete(level, cutoff) {
                Ok(rows) => report.rows_deleted += rows,
                Err(e) => {
                    tracing::error!(kind, level, error = %e, "Retention delete failed");
                    report.failures += 1;
                }
            }
        }
        min_cutoff
    }
}

fn cutoff(now: i64, retention_hours: u64) -> i64 {
    now.saturating_sub((retention_hours as i64).saturating_mul(MILLIS_PER_HOUR))
}

fn record(report: &mut SweepReport, table: &str, result: Result<usize>) {
    match result {
        Ok(rows) => report.rows_deleted += rows,
        Err(e) => {
            tracing::error!(table, error = %e, "Retention delete failed");
            report.failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff() {
        assert_eq!(cutoff(10 * MILLIS_PER_HOUR, 4), 6 * MILLIS_PER_HOUR);
        assert_eq!(cutoff(0, 1), -MILLIS_PER_HOUR);
        assert_eq!(cutoff(i64::MIN + 1, 24), i64::MIN);
    }

    #[test]
    fn test_record_counts_failures() {
        let mut report = SweepReport::default();
        record(&mut report, "t", Ok(3));
        record(
            &mut report,
            "t",
            Err(crate::error::StorageError::Invariant("boom".to_string())),
        );
        assert_eq!(report, SweepReport { rows_deleted: 3, failures: 1 });
    }
}
