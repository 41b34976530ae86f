//! Gauge values

use serde::{Deserialize, Serialize};

/// One measurement of a named scalar metric.
///
/// `weight` makes every merge a weighted mean: for point-in-time gauges it is
/// the number of samples averaged into `value`, for counters it is the elapsed
/// interval in milliseconds that the rate covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub gauge_name: String,

    /// Milliseconds since Unix epoch
    pub capture_time: i64,

    pub value: f64,

    pub weight: i64,
}

impl GaugeValue {
    pub fn new(gauge_name: impl Into<String>, capture_time: i64, value: f64, weight: i64) -> Self {
        Self {
            gauge_name: gauge_name.into(),
            capture_time,
            value,
            weight,
        }
    }
}
