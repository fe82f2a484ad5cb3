//! Artifact discovery and download after completion.
//!
//! Every sink node in the completed job's outputs contributes one
//! artifact per image record. Downloads run with bounded concurrency;
//! a failed download is logged and counted but does not abort the
//! others.

use std::time::Duration;

use futures::StreamExt;
use imagegen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use imagegen_comfyui::history::{node_images, HistoryOutputs};
use imagegen_comfyui::workflow::{NodeRole, StorageCategory, Workflow};
use imagegen_core::error::CoreError;
use imagegen_core::naming::artifact_filename;
use imagegen_core::retry::{retry_with_backoff, Backoff};
use imagegen_core::storage::{ArtifactSink, SavedArtifact};
use imagegen_core::types::{NodeId, Timestamp};

use crate::error::GenerationError;

/// Downloads in flight at once.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Delay between retries of a transiently failing download.
pub const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retries of one download on a transient status.
pub const DOWNLOAD_MAX_RETRIES: u32 = 2;

/// The default download retry policy: two retries, one second apart.
pub fn download_backoff() -> Backoff {
    Backoff::fixed(DOWNLOAD_RETRY_DELAY, DOWNLOAD_MAX_RETRIES)
}

/// One artifact reported by a sink node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub owner_node_id: NodeId,
    /// Position within the owning node's `images` array.
    pub index: usize,
    pub filename: String,
    pub subfolder: String,
    pub category: StorageCategory,
}

/// Result of collecting a completed job's artifacts.
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub saved: Vec<SavedArtifact>,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] ComfyUIApiError),
    #[error(transparent)]
    Store(#[from] CoreError),
}

/// List the artifacts to download, in node order.
///
/// Output entries for nodes absent from the workflow or whose role is
/// not a sink are skipped, as are sinks with no image records.
pub fn discover_artifacts(workflow: &Workflow, outputs: &HistoryOutputs) -> Vec<ArtifactDescriptor> {
    let mut found = Vec::new();

    for (node_id, output) in outputs {
        let Some(category) = workflow
            .role_of(node_id)
            .and_then(NodeRole::storage_category)
        else {
            tracing::debug!(node_id = %node_id, "Skipping output of non-sink node");
            continue;
        };

        let images = node_images(output);
        if images.is_empty() {
            tracing::debug!(node_id = %node_id, "Sink node reported no images");
            continue;
        }

        found.extend(images.into_iter().map(|image| ArtifactDescriptor {
            owner_node_id: node_id.clone(),
            index: image.position,
            subfolder: image.subfolder().to_string(),
            filename: image.filename,
            category,
        }));
    }

    found
}

/// Download every discovered artifact into `sink`.
///
/// Returns [`GenerationError::NothingProduced`] when no artifact could
/// be saved, including when there was nothing to download.
pub async fn collect(
    api: &ComfyUIApi,
    workflow: &Workflow,
    outputs: &HistoryOutputs,
    sink: &dyn ArtifactSink,
    submitted_at: Timestamp,
    retry: &Backoff,
) -> Result<CollectionReport, GenerationError> {
    let descriptors = discover_artifacts(workflow, outputs);
    tracing::info!(artifacts = descriptors.len(), "Collecting artifacts");

    let timestamp_ms = submitted_at.timestamp_millis();
    let results: Vec<Result<SavedArtifact, DownloadError>> = futures::stream::iter(&descriptors)
        .map(|descriptor| download_one(api, descriptor, sink, timestamp_ms, retry))
        .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
        .collect()
        .await;

    let mut report = CollectionReport::default();
    for result in results {
        match result {
            Ok(saved) => report.saved.push(saved),
            Err(_) => report.failed += 1,
        }
    }
    report.saved.sort_by(|a, b| a.local_path.cmp(&b.local_path));

    if report.saved.is_empty() {
        return Err(GenerationError::NothingProduced {
            failed: report.failed,
        });
    }
    if report.failed > 0 {
        tracing::warn!(
            saved = report.saved.len(),
            failed = report.failed,
            "Some artifacts could not be downloaded",
        );
    }
    Ok(report)
}

async fn download_one(
    api: &ComfyUIApi,
    descriptor: &ArtifactDescriptor,
    sink: &dyn ArtifactSink,
    timestamp_ms: i64,
    retry: &Backoff,
) -> Result<SavedArtifact, DownloadError> {
    let result = async {
        let bytes = retry_with_backoff(retry, ComfyUIApiError::is_transient, |_| {
            api.view(&descriptor.filename, &descriptor.subfolder, descriptor.category)
        })
        .await?;

        let name = artifact_filename(
            timestamp_ms,
            &descriptor.owner_node_id,
            descriptor.index,
            &descriptor.filename,
        );
        Ok::<_, DownloadError>(sink.write(&name, &bytes).await?)
    }
    .await;

    match &result {
        Ok(saved) => tracing::debug!(
            node_id = %descriptor.owner_node_id,
            index = descriptor.index,
            path = %saved.local_path.display(),
            "Artifact saved",
        ),
        Err(e) => tracing::warn!(
            node_id = %descriptor.owner_node_id,
            index = descriptor.index,
            filename = %descriptor.filename,
            error = %e,
            "Artifact download failed",
        ),
    }
    result
}
