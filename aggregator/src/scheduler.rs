//! Fixed-delay periodic tasks
//!
//! The next run is scheduled only after the previous one finished, so a slow
//! run never piles up. Task bodies are blocking and run on the blocking pool.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run `task` every `delay` until `cancel` fires. A panicking run is logged
/// and the schedule continues.
pub fn spawn_fixed_delay<F>(
    name: &'static str,
    delay: Duration,
    cancel: CancellationToken,
    task: Arc<F>,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    tokio::spawn(async move {
        tracing::info!(task = name, delay_ms = delay.as_millis() as u64, "Periodic task started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let task = task.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || (*task)()).await {
                tracing::error!(task = name, error = %e, "Periodic task run failed");
            }
        }
        tracing::info!(task = name, "Periodic task stopped");
    })
}

/// Wait for every task and log the ones that panicked or were aborted.
/// Returns the number of failed tasks.
pub async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Task failed during shutdown");
            failed += 1;
        }
    }
    failed
}
