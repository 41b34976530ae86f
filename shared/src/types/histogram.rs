//! Mergeable duration histogram
//!
//! Thin wrapper over an HDR histogram with auto-resize enabled. Serialized
//! form is the compressed V2 HDR encoding, so merged histograms can be
//! persisted and re-merged at coarser rollup levels.

use hdrhistogram::serialization::{Deserializer, Serializer, V2DeflateSerializer};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Significant decimal digits kept per recorded value.
pub const SIGNIFICANT_DIGITS: u8 = 2;

#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("histogram encode failed: {0}")]
    Encode(String),
    #[error("histogram decode failed: {0}")]
    Decode(String),
    #[error("histogram merge failed: {0}")]
    Merge(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurationHistogram {
    inner: Histogram<u64>,
}

impl DurationHistogram {
    pub fn new() -> Self {
        let inner = Histogram::new(SIGNIFICANT_DIGITS)
            .expect("2 significant digits is within hdrhistogram bounds");
        Self { inner }
    }

    /// Record one duration in nanoseconds.
    pub fn record(&mut self, duration_nanos: u64) {
        self.inner.saturating_record(duration_nanos);
    }

    /// Add every recorded value of `other` into this histogram.
    pub fn merge(&mut self, other: &DurationHistogram) -> Result<(), HistogramError> {
        self.inner
            .add(&other.inner)
            .map_err(|e| HistogramError::Merge(format!("{:?}", e)))
    }

    /// Total number of recorded values
    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Value at the given percentile (0.0..=100.0), 0 when empty.
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        if self.inner.is_empty() {
            return 0;
        }
        self.inner.value_at_percentile(percentile)
    }

    pub fn encode(&self) -> Result<Vec<u8>, HistogramError> {
        let mut bytes = Vec::new();
        V2DeflateSerializer::new()
            .serialize(&self.inner, &mut bytes)
            .map_err(|e| HistogramError::Encode(format!("{:?}", e)))?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HistogramError> {
        let mut reader = bytes;
        let mut inner: Histogram<u64> = Deserializer::new()
            .deserialize(&mut reader)
            .map_err(|e| HistogramError::Decode(format!("{:?}", e)))?;
        // decoded histograms are sized to their contents; merges must be able to grow them
        inner.auto(true);
        Ok(Self { inner })
    }
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for DurationHistogram {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.encode().map_err(serde::ser::Error::custom)?;
        bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DurationHistogram {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::decode(&bytes).map_err(serde::de::Error::custom)
    }
}
