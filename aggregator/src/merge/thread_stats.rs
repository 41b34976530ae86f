//! Thread stats merge

use trellis_shared::ThreadStats;

/// Field-wise sum. A missing side contributes nothing; a field that either
/// side could not measure stays [`ThreadStats::NOT_AVAILABLE`].
pub fn merge_thread_stats(
    target: Option<ThreadStats>,
    source: Option<ThreadStats>,
) -> Option<ThreadStats> {
    match (target, source) {
        (None, None) => None,
        (Some(stats), None) | (None, Some(stats)) => Some(stats),
        (Some(a), Some(b)) => Some(ThreadStats {
            cpu_nanos: sum_available(a.cpu_nanos, b.cpu_nanos),
            blocked_nanos: sum_available(a.blocked_nanos, b.blocked_nanos),
            waited_nanos: sum_available(a.waited_nanos, b.waited_nanos),
            allocated_bytes: sum_available(a.allocated_bytes, b.allocated_bytes),
        }),
    }
}

fn sum_available(a: f64, b: f64) -> f64 {
    if ThreadStats::is_available(a) && ThreadStats::is_available(b) {
        a + b
    } else {
        ThreadStats::NOT_AVAILABLE
    }
}
