use marketsight_worker::TrainingError;
use thiserror::Error;

use crate::JobId;

/// The kinds of failure that can happen while submitting or running a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Dataset failed validation")]
    Validation,
    #[error("Training failed")]
    Training,
    #[error("Failed to persist the artifact")]
    ArtifactPersist,
    #[error("Failed to replicate the artifact to remote storage")]
    Replication,
    #[error("Job queue unavailable")]
    QueueUnavailable,
    #[error("Job store unavailable")]
    StoreUnavailable,
}

impl JobError {
    /// Infrastructure failures. These are surfaced to the caller instead of being recorded on a
    /// job, and stop the worker pool.
    pub fn is_fatal(&self) -> bool {
        match self {
            JobError::QueueUnavailable | JobError::StoreUnavailable => true,
            JobError::JobNotFound(_)
            | JobError::Validation
            | JobError::Training
            | JobError::ArtifactPersist
            | JobError::Replication => false,
        }
    }

    /// Per-job failures that move the job to [JobStatus::Failed](crate::JobStatus::Failed).
    pub fn fails_job(&self) -> bool {
        match self {
            JobError::Validation | JobError::Training | JobError::ArtifactPersist => true,
            JobError::JobNotFound(_)
            | JobError::Replication
            | JobError::QueueUnavailable
            | JobError::StoreUnavailable => false,
        }
    }
}

impl From<&TrainingError> for JobError {
    fn from(err: &TrainingError) -> Self {
        if err.is_validation() {
            JobError::Validation
        } else {
            JobError::Training
        }
    }
}
