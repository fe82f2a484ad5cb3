use std::time::Duration;

use imagegen_comfyui::api::ComfyUIApiError;
use imagegen_comfyui::workflow::WorkflowError;

/// Failure of one `generate` call. Exactly one is reported: the first
/// fatal condition encountered.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Bad configuration or template. Fix the input before retrying.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The server did not accept the job. Not retried, since a resubmit
    /// would queue a duplicate.
    #[error("Failed to submit prompt: {0}")]
    Submission(String),

    /// Status polling failed after its transient-retry budget.
    #[error("Failed to fetch history: {0}")]
    Fetch(String),

    /// The server reports that the job itself failed.
    #[error("{0}")]
    ExecutionFailure(String),

    /// The job did not finish within the wall-clock budget.
    #[error("Timeout: prompt did not complete within {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// Completion was observed but no artifact could be saved.
    #[error("No images generated from any node ({failed} download(s) failed)")]
    NothingProduced { failed: usize },
}

impl GenerationError {
    /// Whether simply trying again may succeed, as opposed to needing a
    /// change of input or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Fetch(_))
    }
}

impl From<WorkflowError> for GenerationError {
    fn from(err: WorkflowError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Classify a submission failure: a malformed endpoint is a validation
/// problem, everything else a rejected submission.
pub(crate) fn submission_error(err: ComfyUIApiError) -> GenerationError {
    match err {
        ComfyUIApiError::InvalidEndpoint(_) => GenerationError::Validation(err.to_string()),
        other => GenerationError::Submission(other.to_string()),
    }
}
