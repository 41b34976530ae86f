//! Aggregate data structures
//!
//! One `Aggregate` summarizes every transaction of a given type (or type and
//! name) that completed during one capture interval. Durations are stored as
//! sums, never as averages, so that coarser rollups can re-average exactly.

use serde::{Deserialize, Serialize};

use super::histogram::DurationHistogram;
use super::profile::Profile;

/// Aggregated measurements for one transaction type (or type + name) over one
/// capture interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Sum of transaction durations in nanoseconds
    pub total_duration_nanos: f64,

    /// Number of transactions summarized
    pub transaction_count: u64,

    /// Number of transactions that ended in error
    pub error_count: u64,

    /// Whether any underlying transaction was asynchronous
    pub async_transactions: bool,

    /// Timer trees recorded on the main thread
    pub main_thread_root_timers: Vec<Timer>,

    /// Timer trees recorded on auxiliary threads
    pub aux_thread_root_timers: Vec<Timer>,

    /// Timers recorded by asynchronous work
    pub async_timers: Vec<Timer>,

    pub main_thread_stats: Option<ThreadStats>,

    pub aux_thread_stats: Option<ThreadStats>,

    /// Distribution of individual transaction durations (nanoseconds)
    pub duration_histogram: DurationHistogram,

    /// Per-query statistics, keyed by (query type, truncated text)
    pub queries: Vec<Query>,

    /// Per-service-call statistics, keyed by (service call type, text)
    pub service_calls: Vec<ServiceCall>,

    pub main_thread_profile: Option<Profile>,

    pub aux_thread_profile: Option<Profile>,
}

impl Aggregate {
    /// Mean transaction duration in nanoseconds (0.0 when empty)
    pub fn mean_duration_nanos(&self) -> f64 {
        if self.transaction_count == 0 {
            0.0
        } else {
            self.total_duration_nanos / self.transaction_count as f64
        }
    }

    /// Bundle the three timer forests into the unit persisted together.
    pub fn root_timers(&self) -> RootTimers {
        RootTimers {
            main_thread: self.main_thread_root_timers.clone(),
            aux_thread: self.aux_thread_root_timers.clone(),
            async_timers: self.async_timers.clone(),
        }
    }
}

/// The timer forests of an aggregate, persisted as a single payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootTimers {
    pub main_thread: Vec<Timer>,
    pub aux_thread: Vec<Timer>,
    pub async_timers: Vec<Timer>,
}

impl RootTimers {
    pub fn is_empty(&self) -> bool {
        self.main_thread.is_empty() && self.aux_thread.is_empty() && self.async_timers.is_empty()
    }
}

/// A named timer with nested child timers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub name: String,

    /// Timer was extended across thread boundaries
    pub extended: bool,

    pub total_nanos: f64,

    pub count: u64,

    /// At least one instance was still running when captured
    pub active: bool,

    pub child_timers: Vec<Timer>,
}

impl Timer {
    pub fn new(name: impl Into<String>, total_nanos: f64, count: u64) -> Self {
        Self {
            name: name.into(),
            total_nanos,
            count,
            ..Default::default()
        }
    }

    pub fn with_child(mut self, child: Timer) -> Self {
        self.child_timers.push(child);
        self
    }
}

/// Per-thread resource usage. Each field uses [`ThreadStats::NOT_AVAILABLE`]
/// when the platform could not measure it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThreadStats {
    pub cpu_nanos: f64,
    pub blocked_nanos: f64,
    pub waited_nanos: f64,
    pub allocated_bytes: f64,
}

impl ThreadStats {
    /// Sentinel for a measurement that the platform does not support.
    pub const NOT_AVAILABLE: f64 = -1.0;

    pub fn is_available(value: f64) -> bool {
        value != Self::NOT_AVAILABLE
    }
}

/// Statistics for one distinct query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// e.g. "SQL", "CQL", "Redis"
    pub query_type: String,

    /// Query text, truncated by the producer
    pub truncated_text: String,

    pub total_duration_nanos: f64,

    pub execution_count: u64,

    /// Total rows returned, `None` when any contributing execution did not report rows
    pub total_rows: Option<u64>,

    pub active: bool,
}

impl Query {
    pub fn new(
        query_type: impl Into<String>,
        truncated_text: impl Into<String>,
        total_duration_nanos: f64,
        execution_count: u64,
    ) -> Self {
        Self {
            query_type: query_type.into(),
            truncated_text: truncated_text.into(),
            total_duration_nanos,
            execution_count,
            total_rows: None,
            active: false,
        }
    }
}

/// Statistics for one distinct outbound service call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// e.g. "HTTP", "gRPC"
    pub service_call_type: String,

    pub text: String,

    pub total_duration_nanos: f64,

    pub execution_count: u64,
}

impl ServiceCall {
    pub fn new(
        service_call_type: impl Into<String>,
        text: impl Into<String>,
        total_duration_nanos: f64,
        execution_count: u64,
    ) -> Self {
        Self {
            service_call_type: service_call_type.into(),
            text: text.into(),
            total_duration_nanos,
            execution_count,
        }
    }
}

/// One transaction type's aggregates for a capture interval: the overall
/// aggregate plus one aggregate per transaction name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionTypeAggregates {
    pub transaction_type: String,
    pub overall: Aggregate,
    pub transactions: Vec<TransactionNameAggregate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionNameAggregate {
    pub transaction_name: String,
    pub aggregate: Aggregate,
}
