//! Persistence of trained model artifacts, locally and optionally to remote storage.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use tracing::{event, instrument, Level};

use crate::{JobError, JobId};

/// Uploads artifacts to remote object storage.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Upload the file at `local_path` under `key` and return the URI of the remote copy.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, Report<JobError>>;
}

/// The result of trying to copy an artifact to remote storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// No remote storage is configured.
    Skipped,
    Uploaded { uri: String },
    /// The upload failed. This does not affect the job.
    Failed,
}

/// Owns the artifact files for all jobs. Artifacts are named `model_{job_id}.{extension}` inside
/// the working directory, and a completed artifact exists only for jobs that completed.
#[derive(Clone)]
pub struct ArtifactStore {
    work_dir: PathBuf,
    extension: String,
    key_prefix: String,
    replicator: Option<Arc<dyn Replicator>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("work_dir", &self.work_dir)
            .field("extension", &self.extension)
            .field("key_prefix", &self.key_prefix)
            .field("replicated", &self.replicator.is_some())
            .finish()
    }
}

impl ArtifactStore {
    pub fn new(work_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            extension: extension.into(),
            key_prefix: String::new(),
            replicator: None,
        }
    }

    /// Copy each saved artifact to remote storage, under keys starting with `key_prefix`.
    pub fn with_replicator(
        mut self,
        replicator: Arc<dyn Replicator>,
        key_prefix: impl Into<String>,
    ) -> Self {
        self.replicator = Some(replicator);
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn file_name(&self, job_id: JobId) -> String {
        format!("model_{job_id}.{}", self.extension)
    }

    /// Where the finished artifact for a job lives.
    pub fn artifact_path(&self, job_id: JobId) -> PathBuf {
        self.work_dir.join(self.file_name(job_id))
    }

    /// Where the training function should write its output. [ArtifactStore::save] moves it into
    /// place.
    pub fn staging_path(&self, job_id: JobId) -> PathBuf {
        self.work_dir.join(format!("{}.partial", self.file_name(job_id)))
    }

    /// The object key used for the remote copy of a job's artifact.
    pub fn remote_key(&self, job_id: JobId) -> String {
        format!("{}{}", self.key_prefix, self.file_name(job_id))
    }

    /// Create the working directory if it doesn't exist.
    pub async fn prepare(&self) -> Result<(), Report<JobError>> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .change_context(JobError::ArtifactPersist)
            .attach_printable_lazy(|| {
                format!("Creating working directory {}", self.work_dir.display())
            })
    }

    /// Move a staged artifact to its final location and return that location.
    #[instrument(level = "debug", skip(self))]
    pub async fn save(&self, job_id: JobId, staged: &Path) -> Result<PathBuf, Report<JobError>> {
        let target = self.artifact_path(job_id);
        tokio::fs::rename(staged, &target)
            .await
            .change_context(JobError::ArtifactPersist)
            .attach_printable_lazy(|| {
                format!("Moving {} to {}", staged.display(), target.display())
            })?;

        Ok(target)
    }

    /// Remove any staged or saved artifact for a job.
    pub async fn discard(&self, job_id: JobId) {
        for path in [self.staging_path(job_id), self.artifact_path(job_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    event!(Level::DEBUG, path = %path.display(), "Removed artifact file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    event!(
                        Level::WARN,
                        path = %path.display(),
                        error = %e,
                        "Failed to remove artifact file"
                    );
                }
            }
        }
    }

    /// Copy an artifact to remote storage. Failures are logged and reported in the outcome, but
    /// never returned as errors.
    #[instrument(level = "debug", skip(self))]
    pub async fn replicate(&self, local_path: &Path, remote_key: &str) -> ReplicationOutcome {
        let Some(replicator) = self.replicator.as_ref() else {
            return ReplicationOutcome::Skipped;
        };

        match replicator.upload(local_path, remote_key).await {
            Ok(uri) => {
                event!(Level::INFO, %uri, "Replicated artifact");
                ReplicationOutcome::Uploaded { uri }
            }
            Err(e) => {
                event!(Level::WARN, error = ?e, "Failed to replicate artifact");
                ReplicationOutcome::Failed
            }
        }
    }
}
