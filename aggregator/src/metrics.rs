//! Prometheus metrics for the aggregation core

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

// ── Ingest metrics ───────────────────────────────────────────────────────────

pub static AGGREGATE_GROUPS_STORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_aggregate_groups_stored_total",
        "Transaction type groups persisted at level 0"
    )
    .unwrap()
});

pub static GAUGE_VALUES_STORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_gauge_values_stored_total",
        "Gauge values persisted at level 0"
    )
    .unwrap()
});

pub static TRACES_STORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("trellis_traces_stored_total", "Traces persisted").unwrap()
});

// ── Rollup metrics ───────────────────────────────────────────────────────────

pub static ROLLUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trellis_rollups_total",
        "Rollup windows computed",
        &["kind", "level"]
    )
    .unwrap()
});

pub static ROLLUP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "trellis_rollup_duration_seconds",
        "Time spent rolling up all levels after one flush",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap()
});

// ── Capped store metrics ─────────────────────────────────────────────────────

pub static CAPPED_BYTES_WRITTEN: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_capped_bytes_written_total",
        "Bytes written to capped stores"
    )
    .unwrap()
});

pub static CAPPED_EXPIRED_READS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_capped_expired_reads_total",
        "Capped store reads that found the record already overwritten"
    )
    .unwrap()
});

// ── Live buffer metrics ──────────────────────────────────────────────────────

pub static LIVE_PENDING_INTERVALS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "trellis_live_pending_intervals",
        "Capture intervals collected but not yet flushed"
    )
    .unwrap()
});

pub static LIVE_DROPS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_live_drops_total",
        "Intervals dropped from the live buffer due to capacity"
    )
    .unwrap()
});

// ── Reaper metrics ───────────────────────────────────────────────────────────

pub static REAPER_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("trellis_reaper_runs_total", "Retention sweeps", &["status"]).unwrap()
});

pub static REAPER_ROWS_DELETED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "trellis_reaper_rows_deleted_total",
        "Rows deleted by retention sweeps"
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_registered_metrics() {
        ROLLUPS_TOTAL.with_label_values(&["aggregate", "1"]).inc();
        CAPPED_BYTES_WRITTEN.inc_by(10.0);
        let text = encode_metrics();
        assert!(text.contains("trellis_rollups_total"));
        assert!(text.contains("trellis_capped_bytes_written_total"));
    }
}
