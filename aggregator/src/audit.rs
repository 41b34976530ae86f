//! Audit logging for operational events.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) for audit pipelines.

use tracing::{info, warn};

const AUDIT_TARGET: &str = "trellis::audit";

/// Log admin HTTP request (sensitive endpoints: metrics, readiness).
pub fn admin_http_request(path: &str, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %status,
    );
}

/// Log a completed retention sweep.
pub fn retention_sweep(rows_deleted: usize, failures: usize) {
    if failures == 0 {
        info!(
            target: AUDIT_TARGET,
            event = "retention_sweep",
            result = "ok",
            rows_deleted,
        );
    } else {
        warn!(
            target: AUDIT_TARGET,
            event = "retention_sweep",
            result = "partial",
            rows_deleted,
            failures,
        );
    }
}

/// Log storage shutdown.
pub fn storage_closing() {
    info!(target: AUDIT_TARGET, event = "storage_closing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_target_is_static() {
        assert_eq!(AUDIT_TARGET, "trellis::audit");
    }
}
