//! Shared types and utilities for Trellis
//!
//! This crate contains the data model delivered by the collection interface
//! (aggregates, gauge values, traces), the payload codec used by the capped
//! store, and small time helpers shared by the aggregator.

pub mod codec;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{aggregate::*, gauge::*, histogram::*, profile::*, trace::*};
