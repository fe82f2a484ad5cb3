//! End-to-end orchestration of one prompt.
//!
//! `generate` drives a job through submit, wait, and collect. Waiting
//! is done by the poll loop; for workflows whose only sinks are
//! previews the push channel runs alongside it to stream progress and
//! previews and to wake the poll loop as soon as the server signals
//! completion. The push channel is always shut down before `generate`
//! returns.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use imagegen_comfyui::api::ComfyUIApi;
use imagegen_comfyui::client::PushClient;
use imagegen_comfyui::events::PushEvent;
use imagegen_comfyui::push::PushChannel;
use imagegen_comfyui::workflow::{prepare, NodeRole, Workflow};
use imagegen_core::storage::{ArtifactSink, SavedArtifact};
use imagegen_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::collector::{collect, download_backoff};
use crate::config::GenerationConfig;
use crate::error::{submission_error, GenerationError};
use crate::poll::poll_until_done;

/// Live update for the caller while a job is running.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Fraction of the current node's work done, `value / max`.
    Progress(f64),
    /// Inline preview as a `data:image/...;base64,...` URL.
    Preview(String),
}

/// A submitted job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Server-assigned prompt ID.
    pub id: String,
    pub workflow: Workflow,
    pub submitted_at: Timestamp,
}

/// What a successful `generate` call produced.
#[derive(Debug)]
pub struct GenerationOutput {
    pub job: Job,
    /// Saved artifacts, sorted by path.
    pub artifacts: Vec<SavedArtifact>,
    /// Artifacts that could not be downloaded or stored.
    pub failed_downloads: usize,
}

impl GenerationOutput {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.artifacts.iter().map(|a| a.local_path.as_path())
    }
}

/// Generate images for `prompt` and hand them to `sink`.
///
/// Progress and preview updates go to `events` when given; the
/// receiver may be dropped at any time. Returns the first fatal error
/// encountered; no partial output is returned on error.
pub async fn generate(
    prompt: &str,
    config: &GenerationConfig,
    sink: &dyn ArtifactSink,
    events: Option<mpsc::UnboundedSender<GenerationEvent>>,
) -> Result<GenerationOutput, GenerationError> {
    let api = ComfyUIApi::new(&config.server_url).map_err(submission_error)?;
    let workflow = prepare(&config.workflow_template, prompt, &config.injection)?;

    let job_id = api
        .submit_workflow(&workflow, &config.client_tag, config.api_key.as_deref())
        .await
        .map_err(submission_error)?;
    let job = Job {
        id: job_id,
        workflow,
        submitted_at: Utc::now(),
    };
    tracing::info!(job_id = %job.id, server = %api.api_url(), "Prompt submitted");

    let outputs = wait_for_outputs(&api, &job, config, events.as_ref()).await?;

    let report = collect(
        &api,
        &job.workflow,
        &outputs,
        sink,
        job.submitted_at,
        &download_backoff(),
    )
    .await?;

    tracing::info!(
        job_id = %job.id,
        saved = report.saved.len(),
        failed = report.failed,
        "Generation finished",
    );
    Ok(GenerationOutput {
        job,
        artifacts: report.saved,
        failed_downloads: report.failed,
    })
}

/// Wait for the job's outputs under the absolute timeout, running the
/// push channel alongside the poll loop for preview-only workflows.
async fn wait_for_outputs(
    api: &ComfyUIApi,
    job: &Job,
    config: &GenerationConfig,
    events: Option<&mpsc::UnboundedSender<GenerationEvent>>,
) -> Result<imagegen_comfyui::history::HistoryOutputs, GenerationError> {
    let wake = Notify::new();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();

    let channel = if job.workflow.primary_output_role() == NodeRole::Preview {
        let preview_nodes: HashSet<String> = job
            .workflow
            .sink_ids(NodeRole::Preview)
            .into_iter()
            .map(String::from)
            .collect();
        tracing::debug!(job_id = %job.id, nodes = preview_nodes.len(), "Starting push channel");
        Some(PushChannel::spawn(
            PushClient::new(api.ws_url()),
            job.id.clone(),
            preview_nodes,
            push_tx,
        ))
    } else {
        drop(push_tx);
        None
    };

    let waiting = async {
        let poll = poll_until_done(api, &job.id, &config.poll, Some(&wake));
        tokio::pin!(poll);
        let mut forwarding = true;

        loop {
            tokio::select! {
                result = &mut poll => return result,
                event = push_rx.recv(), if forwarding => match event {
                    Some(PushEvent::Progress(ratio)) => emit(events, GenerationEvent::Progress(ratio)),
                    Some(PushEvent::Preview(url)) => emit(events, GenerationEvent::Preview(url)),
                    Some(PushEvent::Completed) => wake.notify_one(),
                    None => forwarding = false,
                },
            }
        }
    };

    let outcome = match tokio::time::timeout(config.timeout, waiting).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(job_id = %job.id, timeout_secs = config.timeout.as_secs(), "Job timed out");
            Err(GenerationError::Timeout(config.timeout))
        }
    };

    if let Some(channel) = channel {
        let state = channel.shutdown().await;
        tracing::debug!(job_id = %job.id, ?state, "Push channel shut down");
    }
    outcome
}

fn emit(events: Option<&mpsc::UnboundedSender<GenerationEvent>>, event: GenerationEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
