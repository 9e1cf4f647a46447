//! Cron-driven duplicate cleanup for long-lived deployments. Commands run
//! one-shot by default; the scheduler is opt-in via configuration.

use std::sync::Arc;

use harvest_store::Store;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};

use crate::dedup::{run_duplicate_cleanup, CleanupOutcome, NoExternalReferences};

/// Build a scheduler that runs the cleanup pass on `cron` (six-field cron
/// with seconds). The caller starts and shuts it down.
pub async fn build_cleanup_scheduler(
    store: Arc<dyn Store>,
    cron: &str,
    window_days: u32,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(cron, move |_id, _lock| {
        let store = Arc::clone(&store);
        Box::pin(async move {
            info!("scheduled duplicate cleanup starting");
            match run_duplicate_cleanup(store, &NoExternalReferences, window_days, &[]).await {
                Ok(CleanupOutcome::Completed(report)) => {
                    info!(
                        removed = report.removed,
                        failed = report.failed.len(),
                        removal_error = report.removal_error.as_deref(),
                        "scheduled duplicate cleanup finished"
                    );
                }
                Ok(CleanupOutcome::Skipped(reason)) => {
                    info!(reason, "scheduled duplicate cleanup skipped");
                }
                Err(err) => {
                    error!(error = %err, "scheduled duplicate cleanup failed");
                }
            }
        })
    })?;
    scheduler.add(job).await?;
    Ok(scheduler)
}
