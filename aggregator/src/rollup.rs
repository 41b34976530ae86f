//! Rollup time alignment and rollup level selection

use crate::config::{RollupConfig, StorageConfig};

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Latest interval-aligned boundary strictly before `current_time`.
///
/// All finer-grained data at or before the returned time has arrived, so it is
/// both the exclusive upper bound of a rollup's source window and the capture
/// time of the produced rollup row.
pub fn safe_rollup_time(current_time: i64, interval_millis: i64) -> i64 {
    if interval_millis <= 0 {
        return current_time;
    }
    (current_time - 1).div_euclid(interval_millis) * interval_millis
}

/// The rollup row a capture time belongs to: rows captured in
/// `(T - interval, T]` roll up into `T`.
pub fn rollup_capture_time(capture_time: i64, interval_millis: i64) -> i64 {
    if interval_millis <= 0 {
        return capture_time;
    }
    let aligned = capture_time.div_euclid(interval_millis) * interval_millis;
    if aligned == capture_time {
        capture_time
    } else {
        aligned + interval_millis
    }
}

/// Chooses which rollup level should serve a query range.
#[derive(Debug, Clone)]
pub struct RollupLevelService {
    aggregate_rollups: Vec<RollupConfig>,
    aggregate_retention_hours: Vec<u64>,
    gauge_rollups: Vec<RollupConfig>,
    gauge_retention_hours: Vec<u64>,
}

impl RollupLevelService {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            aggregate_rollups: config.aggregate_rollups.clone(),
            aggregate_retention_hours: config.aggregate_retention_hours.clone(),
            gauge_rollups: config.gauge_rollups.clone(),
            gauge_retention_hours: config.gauge_retention_hours.clone(),
        }
    }

    /// Lowest aggregate level whose view threshold covers the range and whose
    /// retention still covers `from`; the coarsest level otherwise.
    pub fn rollup_level_for_view(&self, from: i64, to: i64, now: i64) -> usize {
        level_for_view(
            &self.aggregate_rollups,
            &self.aggregate_retention_hours,
            from,
            to,
            now,
        )
    }

    pub fn gauge_rollup_level_for_view(&self, from: i64, to: i64, now: i64) -> usize {
        level_for_view(&self.gauge_rollups, &self.gauge_retention_hours, from, to, now)
    }

    /// Width of one data point at an aggregate level
    pub fn data_point_interval_millis(&self, level: usize) -> i64 {
        self.aggregate_rollups
            .get(level)
            .or_else(|| self.aggregate_rollups.last())
            .map(|r| r.interval_millis)
            .unwrap_or(0)
    }

    pub fn gauge_data_point_interval_millis(&self, level: usize) -> i64 {
        self.gauge_rollups
            .get(level)
            .or_else(|| self.gauge_rollups.last())
            .map(|r| r.interval_millis)
            .unwrap_or(0)
    }
}

fn level_for_view(
    rollups: &[RollupConfig],
    retention_hours: &[u64],
    from: i64,
    to: i64,
    now: i64,
) -> usize {
    let range = to - from;
    let age = now - from;
    let last = rollups.len().saturating_sub(1);
    for (level, rollup) in rollups.iter().enumerate().take(last) {
        let retention = retention_hours
            .get(level)
            .map(|h| *h as i64 * MILLIS_PER_HOUR)
            .unwrap_or(i64::MAX);
        if range <= rollup.view_threshold_millis && age < retention {
            return level;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_rollup_time() {
        assert_eq!(safe_rollup_time(125_000, 60_000), 120_000);
        assert_eq!(safe_rollup_time(65_000, 60_000), 60_000);
        assert_eq!(safe_rollup_time(60_000, 60_000), 0);
        assert_eq!(safe_rollup_time(60_001, 60_000), 60_000);
        assert_eq!(safe_rollup_time(1, 60_000), 0);
    }

    #[test]
    fn test_safe_rollup_time_is_strictly_before() {
        for t in [1, 59_999, 60_000, 60_001, 119_999, 120_000] {
            let safe = safe_rollup_time(t, 60_000);
            assert!(safe < t);
            assert_eq!(safe % 60_000, 0);
        }
    }

    #[test]
    fn test_rollup_capture_time() {
        assert_eq!(rollup_capture_time(1_000, 60_000), 60_000);
        assert_eq!(rollup_capture_time(60_000, 60_000), 60_000);
        assert_eq!(rollup_capture_time(60_001, 60_000), 120_000);
        assert_eq!(rollup_capture_time(0, 60_000), 0);
    }

    #[test]
    fn test_level_for_short_recent_range() {
        let service = RollupLevelService::new(&StorageConfig::default());
        let now = 100 * MILLIS_PER_HOUR;
        assert_eq!(service.rollup_level_for_view(now - MILLIS_PER_HOUR, now, now), 0);
    }

    #[test]
    fn test_level_for_wide_range() {
        let service = RollupLevelService::new(&StorageConfig::default());
        let now = 1000 * MILLIS_PER_HOUR;
        assert_eq!(
            service.rollup_level_for_view(now - 6 * MILLIS_PER_HOUR, now, now),
            1
        );
        assert_eq!(
            service.rollup_level_for_view(now - 40 * MILLIS_PER_HOUR, now, now),
            2
        );
        assert_eq!(
            service.rollup_level_for_view(now - 400 * MILLIS_PER_HOUR, now, now),
            3
        );
    }

    #[test]
    fn test_level_skips_expired_retention() {
        let service = RollupLevelService::new(&StorageConfig::default());
        let now = 10_000 * MILLIS_PER_HOUR;
        // short range but older than level 0 retention (3 days)
        let from = now - 100 * MILLIS_PER_HOUR;
        assert_eq!(service.rollup_level_for_view(from, from + 60_000, now), 1);
    }

    #[test]
    fn test_gauge_levels() {
        let service = RollupLevelService::new(&StorageConfig::default());
        let now = 1000 * MILLIS_PER_HOUR;
        assert_eq!(service.gauge_rollup_level_for_view(now - 600_000, now, now), 0);
        assert_eq!(
            service.gauge_rollup_level_for_view(now - 2 * MILLIS_PER_HOUR, now, now),
            2
        );
        assert_eq!(service.gauge_data_point_interval_millis(0), 5_000);
        assert_eq!(service.data_point_interval_millis(1), 300_000);
    }
}
