//! Status polling against the history endpoint.
//!
//! Polling is the authoritative completion path for every job. The
//! push channel may only shorten a wait through the `wake` handle.

use std::time::Duration;

use imagegen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use imagegen_comfyui::history::{interpret_history, HistoryOutputs, JobOutcome};
use imagegen_core::retry::{retry_with_backoff, Backoff};
use tokio::sync::Notify;

use crate::error::GenerationError;

/// Delay between retries of a transiently failing history request.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retries of one history request on a transient status.
pub const TRANSIENT_MAX_RETRIES: u32 = 3;

/// Polling cadence and caps.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait between consecutive history requests.
    pub interval: Duration,
    /// History requests before giving up with a timeout.
    pub max_attempts: u32,
    /// Retry policy for transient statuses within one request.
    pub transient_retry: Backoff,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 150,
            transient_retry: Backoff::fixed(TRANSIENT_RETRY_DELAY, TRANSIENT_MAX_RETRIES),
        }
    }
}

/// Poll until the job completes, fails, or the attempt cap is hit.
///
/// A notification on `wake` cuts the current wait short so the next
/// history request goes out immediately. The result always comes from
/// a history response.
pub async fn poll_until_done(
    api: &ComfyUIApi,
    job_id: &str,
    config: &PollConfig,
    wake: Option<&Notify>,
) -> Result<HistoryOutputs, GenerationError> {
    for attempt in 1..=config.max_attempts {
        let history = retry_with_backoff(
            &config.transient_retry,
            ComfyUIApiError::is_transient,
            |_| api.get_history(job_id),
        )
        .await
        .map_err(|e| GenerationError::Fetch(e.to_string()))?;

        match interpret_history(&history, job_id) {
            JobOutcome::Completed(outputs) => {
                tracing::info!(job_id, attempt, nodes = outputs.len(), "Job completed");
                return Ok(outputs);
            }
            JobOutcome::Failed(reason) => {
                tracing::error!(job_id, attempt, reason = %reason, "Job failed on server");
                return Err(GenerationError::ExecutionFailure(reason));
            }
            JobOutcome::Running => {
                tracing::debug!(job_id, attempt, "Job still running");
            }
        }

        if attempt < config.max_attempts {
            wait(config.interval, wake).await;
        }
    }

    tracing::warn!(job_id, attempts = config.max_attempts, "Polling cap reached");
    Err(GenerationError::Timeout(
        config.interval * config.max_attempts,
    ))
}

async fn wait(interval: Duration, wake: Option<&Notify>) {
    let Some(wake) = wake else {
        tokio::time::sleep(interval).await;
        return;
    };
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = wake.notified() => {
            tracing::debug!("Poll wait cut short by push completion");
        }
    }
}
