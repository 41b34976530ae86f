//! Query parameters and result rows for the read side
//!
//! Two range conventions are used: summary-style queries (summaries, error
//! summaries, merged detail tables) are `(from, to]`; point-series queries
//! (overview, percentile, throughput, gauge and trace points) are
//! `[from, to]`.

use serde::{Deserialize, Serialize};
use trellis_shared::{DurationHistogram, RootTimers, ThreadStats};

/// Summary-style query over one transaction type, `(from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryQuery {
    pub transaction_type: String,
    pub from: i64,
    pub to: i64,
    pub rollup_level: usize,
}

/// Point-series or detail query, optionally narrowed to one transaction name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub transaction_type: String,
    pub transaction_name: Option<String>,
    pub from: i64,
    pub to: i64,
    pub rollup_level: usize,
}

impl AggregateQuery {
    pub fn with_to(&self, to: i64) -> Self {
        Self {
            to,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummarySortOrder {
    TotalTime,
    AverageTime,
    Throughput,
}

impl SummarySortOrder {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            SummarySortOrder::TotalTime => "sum(total_duration_nanos) DESC",
            SummarySortOrder::AverageTime => {
                "sum(total_duration_nanos) / sum(transaction_count) DESC"
            }
            SummarySortOrder::Throughput => "sum(transaction_count) DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSummarySortOrder {
    ErrorCount,
    ErrorRate,
}

impl ErrorSummarySortOrder {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            ErrorSummarySortOrder::ErrorCount => "sum(error_count) DESC",
            ErrorSummarySortOrder::ErrorRate => {
                "CAST(sum(error_count) AS REAL) / sum(transaction_count) DESC"
            }
        }
    }
}

/// A limited result list. The closing sentinel is an empty page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub more_available: bool,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            more_available: false,
        }
    }
}

impl<T> Page<T> {
    /// Build from up to `limit + 1` fetched rows.
    pub fn from_overfetched(mut records: Vec<T>, limit: usize) -> Self {
        let more_available = records.len() > limit;
        records.truncate(limit);
        Self {
            records,
            more_available,
        }
    }
}

/// `last_capture_time` is 0 when no rows matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallSummary {
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub last_capture_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub transaction_name: String,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallErrorSummary {
    pub error_count: u64,
    pub transaction_count: u64,
    pub last_capture_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionErrorSummary {
    pub transaction_name: String,
    pub error_count: u64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverviewAggregate {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub async_transactions: bool,
    /// Empty when the timers have already expired from the capped store
    pub root_timers: RootTimers,
    pub main_thread_stats: Option<ThreadStats>,
    pub aux_thread_stats: Option<ThreadStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileAggregate {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    /// Empty when the histogram has already expired from the capped store
    pub duration_histogram: DurationHistogram,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputAggregate {
    pub capture_time: i64,
    pub transaction_count: u64,
}

/// Range query for trace points, `[from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePointQuery {
    pub transaction_type: String,
    pub transaction_name: Option<String>,
    pub from: i64,
    pub to: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub trace_id: String,
    pub capture_time: i64,
    pub duration_nanos: i64,
    pub partial: bool,
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_overfetched() {
        let page = Page::from_overfetched(vec![1, 2, 3], 2);
        assert_eq!(page.records, vec![1, 2]);
        assert!(page.more_available);
        let page = Page::from_overfetched(vec![1, 2], 2);
        assert!(!page.more_available);
    }

    #[test]
    fn test_with_to() {
        let query = AggregateQuery {
            transaction_type: "Web".to_string(),
            transaction_name: None,
            from: 0,
            to: 100,
            rollup_level: 0,
        };
        assert_eq!(query.with_to(50).to, 50);
        assert_eq!(query.with_to(50).from, 0);
    }
}
