//! Drives a single job through training to a terminal status.

use std::{path::PathBuf, sync::Arc, time::Duration};

use error_stack::{Report, ResultExt};
use marketsight_worker::{stats::track_system_stats, Trainer};
use tracing::{event, instrument, Level};

use crate::{
    ArtifactStore, Job, JobError, JobId, JobStatus, JobStore, ReplicationOutcome,
    ServiceContext, StatusCollector,
};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// What happened when a worker received a job ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job does not exist. Nothing was changed.
    NotFound,
    /// Another worker already claimed the job, or it was already finished. This happens when
    /// the queue delivers a job more than once. Contains the status the job was in.
    Skipped(JobStatus),
    Completed {
        artifact: PathBuf,
        replication: ReplicationOutcome,
    },
    /// The job was marked as failed.
    Failed(JobError),
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    trainer: Arc<dyn Trainer>,
    artifacts: ArtifactStore,
    status: Option<StatusCollector>,
}

impl Worker {
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            store: ctx.store.clone(),
            trainer: ctx.trainer.clone(),
            artifacts: ctx.artifacts.clone(),
            status: ctx.status.clone(),
        }
    }

    /// Process a job received from the queue.
    ///
    /// Per-job failures are recorded by moving the job to [JobStatus::Failed], and returned as
    /// [JobOutcome::Failed]. An `Err` is only returned for infrastructure failures, such as the
    /// job store becoming unavailable.
    #[instrument(skip(self), fields(%job_id))]
    pub async fn process(&self, job_id: JobId) -> Result<JobOutcome, Report<JobError>> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(e) if matches!(e.current_context(), JobError::JobNotFound(_)) => {
                event!(Level::WARN, "Job not found, dropping it");
                return Ok(JobOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        // Claiming is a conditional write, so only one worker can move the job out of Pending.
        if !self
            .transition(job_id, JobStatus::Pending, JobStatus::Processing)
            .await?
        {
            let current = self.store.get(job_id).await?.status;
            event!(Level::INFO, status = %current, "Job was already claimed, skipping");
            return Ok(JobOutcome::Skipped(current));
        }

        event!(Level::INFO, filename = %job.filename, "Training model");
        match self.execute(&job).await {
            Ok(artifact) => self.complete(job_id, artifact).await,
            Err(e) => match e.current_context().clone() {
                kind @ (JobError::Validation | JobError::Training | JobError::ArtifactPersist) => {
                    event!(Level::ERROR, error = ?e, "Job failed");
                    self.artifacts.discard(job_id).await;
                    self.fail(job_id, kind).await
                }
                JobError::QueueUnavailable
                | JobError::StoreUnavailable
                | JobError::Replication
                | JobError::JobNotFound(_) => {
                    // Infrastructure failure. The job stays in Processing.
                    self.artifacts.discard(job_id).await;
                    Err(e)
                }
            },
        }
    }

    /// Train the model and persist the artifact.
    async fn execute(&self, job: &Job) -> Result<PathBuf, Report<JobError>> {
        self.artifacts.prepare().await?;

        let staged = self.artifacts.staging_path(job.id);
        let trainer = self.trainer.clone();
        let input = job.file_path.clone();
        let output = staged.clone();

        let stats = track_system_stats(STATS_INTERVAL);
        let result = tokio::task::spawn_blocking(move || trainer.train(&input, &output)).await;
        if let Some(stats) = stats.finish().await {
            event!(Level::DEBUG, ?stats, "Training statistics");
        }

        let summary = result
            .change_context(JobError::Training)
            .attach_printable("Training function panicked")?
            .map_err(|e| {
                let kind = JobError::from(e.current_context());
                e.change_context(kind)
            })
            .attach_printable_lazy(|| format!("Training on {}", job.file_path.display()))?;

        event!(
            Level::INFO,
            rows = summary.rows,
            epochs = summary.epochs,
            final_loss = summary.final_loss,
            "Training finished"
        );

        self.artifacts.save(job.id, &staged).await
    }

    /// Record a saved artifact as completed. The remote copy is only made once the job is
    /// Completed, so neither copy outlives a failed completion write.
    async fn complete(
        &self,
        job_id: JobId,
        artifact: PathBuf,
    ) -> Result<JobOutcome, Report<JobError>> {
        let moved = match self
            .transition(job_id, JobStatus::Processing, JobStatus::Completed)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                self.artifacts.discard(job_id).await;
                return Err(e);
            }
        };

        if !moved {
            self.artifacts.discard(job_id).await;
            let current = self.store.get(job_id).await?.status;
            event!(
                Level::ERROR,
                status = %current,
                "Job left the processing state while it was running"
            );
            return Ok(JobOutcome::Skipped(current));
        }

        let replication = self
            .artifacts
            .replicate(&artifact, &self.artifacts.remote_key(job_id))
            .await;
        event!(Level::INFO, artifact = %artifact.display(), "Job completed");
        Ok(JobOutcome::Completed {
            artifact,
            replication,
        })
    }

    async fn fail(&self, job_id: JobId, kind: JobError) -> Result<JobOutcome, Report<JobError>> {
        if self
            .transition(job_id, JobStatus::Processing, JobStatus::Failed)
            .await?
        {
            Ok(JobOutcome::Failed(kind))
        } else {
            let current = self.store.get(job_id).await?.status;
            Ok(JobOutcome::Skipped(current))
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, Report<JobError>> {
        let moved = self.store.update_status(job_id, from, to).await?;
        if moved {
            event!(Level::DEBUG, %from, %to, "Updated job status");
            if let Some(status) = &self.status {
                status.add(job_id, to);
            }
        }

        Ok(moved)
    }
}
