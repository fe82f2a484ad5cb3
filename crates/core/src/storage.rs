//! Durable byte sink for downloaded artifacts.
//!
//! The client never owns remote storage: artifacts are downloaded and
//! handed to an [`ArtifactSink`], which takes ownership of the bytes.
//! [`DirectorySink`] is the filesystem implementation used by the
//! worker binary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::CoreError;

/// A file written by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    /// Where the bytes ended up on the local machine.
    pub local_path: PathBuf,
}

/// Write-once storage addressed by a caller-chosen name.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist `bytes` under `name`. Writing a name twice is an error.
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<SavedArtifact, CoreError>;
}

/// Sink that writes each artifact as a file inside one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<SavedArtifact, CoreError> {
        validate_name(name)?;

        let storage_err = |source| CoreError::Storage {
            name: name.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(storage_err)?;

        let local_path = self.root.join(name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local_path)
            .await
            .map_err(storage_err)?;
        file.write_all(bytes).await.map_err(storage_err)?;
        file.flush().await.map_err(storage_err)?;

        tracing::debug!(path = %local_path.display(), size = bytes.len(), "Artifact written");

        Ok(SavedArtifact { local_path })
    }
}

/// Names must be a single plain path component.
fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation("Artifact name must not be empty".into()));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(CoreError::Validation(format!(
            "Artifact name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}
