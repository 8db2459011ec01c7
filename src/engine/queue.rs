use tokio::sync::mpsc;

use crate::engine::dispatch::DispatchJob;
use crate::error::AppError;
use crate::observability::metrics::Metrics;

pub async fn enqueue_dispatch(
    tx: &mpsc::Sender<DispatchJob>,
    metrics: &Metrics,
    job: DispatchJob,
) -> Result<(), AppError> {
    tx.send(job)
        .await
        .map_err(|err| AppError::Internal(format!("dispatch queue send failed: {err}")))?;

    metrics.jobs_in_queue.inc();
    Ok(())
}
