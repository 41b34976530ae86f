//! Utility functions and helpers

pub mod time;
