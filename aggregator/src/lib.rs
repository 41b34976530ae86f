//! Trellis aggregation core
//!
//! Collected aggregates are buffered per capture interval, flushed into the
//! raw level and rolled up into coarser levels. Large nested payloads live in
//! capped ring stores referenced from the relational rows.

pub mod audit;
pub mod collector;
pub mod config;
pub mod error;
pub mod live;
pub mod merge;
pub mod metrics;
pub mod query;
pub mod reaper;
pub mod rollup;
pub mod scheduler;
pub mod server;
pub mod storage;

pub use error::{Result, StorageError};
