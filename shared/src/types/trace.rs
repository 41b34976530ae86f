//! Trace data structures
//!
//! A trace is the full detail of one slow or failed transaction.

use serde::{Deserialize, Serialize};

use super::profile::Profile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Unique trace id assigned by the producer
    pub id: String,

    pub header: TraceHeader,

    pub entries: Vec<TraceEntry>,

    pub main_thread_profile: Option<Profile>,

    pub aux_thread_profile: Option<Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    /// Transaction was still running when the trace was captured
    pub partial: bool,

    pub slow: bool,

    /// Milliseconds since Unix epoch
    pub start_time: i64,

    /// Milliseconds since Unix epoch
    pub capture_time: i64,

    pub duration_nanos: i64,

    pub transaction_type: String,

    pub transaction_name: String,

    pub headline: String,

    pub user: Option<String>,

    pub error_message: Option<String>,

    pub attributes: Vec<TraceAttribute>,

    pub entry_count: u64,
}

impl TraceHeader {
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceAttribute {
    pub name: String,
    pub values: Vec<String>,
}

/// One entry of the trace's timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Nesting depth, 0 for top-level entries
    pub depth: u32,

    /// Offset from the transaction start
    pub start_offset_nanos: i64,

    pub duration_nanos: i64,

    pub active: bool,

    pub message: String,

    pub error_message: Option<String>,
}
