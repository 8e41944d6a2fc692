//! The submission side of the pipeline.

use std::{path::PathBuf, sync::Arc};

use error_stack::{Report, ResultExt};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::{
    Job, JobError, JobId, JobStatus, JobStore, NewJob, Queue, ServiceContext, StatusCollector,
};

/// Records new jobs and hands them to the queue. Submitting never waits for a worker.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn Queue>,
    upload_dir: PathBuf,
    status: Option<StatusCollector>,
}

impl Enqueuer {
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            store: ctx.store.clone(),
            queue: ctx.queue.clone(),
            upload_dir: ctx.upload_dir.clone(),
            status: ctx.status.clone(),
        }
    }

    /// Send an existing job to the workers.
    #[instrument(level = "debug", skip(self))]
    pub async fn submit(&self, job_id: JobId) -> Result<(), Report<JobError>> {
        self.queue
            .push(job_id)
            .await
            .attach_printable_lazy(|| format!("Submitting job {job_id}"))?;
        event!(Level::DEBUG, %job_id, "Enqueued job");
        Ok(())
    }

    /// Create a job and send it to the workers. If the queue rejects the job, the error is
    /// returned and the job stays [JobStatus::Pending].
    #[instrument(skip(self))]
    pub async fn submit_new(&self, job: NewJob) -> Result<Job, Report<JobError>> {
        let job = self.create(job).await?;
        self.submit(job.id).await?;
        Ok(job)
    }

    async fn create(&self, job: NewJob) -> Result<Job, Report<JobError>> {
        let job = self.store.create(job).await?;
        event!(Level::INFO, job_id = %job.id, filename = %job.filename, "Created job");
        if let Some(status) = &self.status {
            status.add(job.id, JobStatus::Pending);
        }
        Ok(job)
    }

    /// Save an uploaded dataset into the upload directory, then create and submit a job for it.
    #[instrument(skip(self, contents), fields(bytes = contents.len()))]
    pub async fn submit_upload(
        &self,
        filename: &str,
        contents: &[u8],
    ) -> Result<Job, Report<JobError>> {
        let name = sanitize_filename(filename)
            .ok_or(JobError::Validation)
            .attach_printable_lazy(|| format!("Invalid upload filename {filename:?}"))?;

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .change_context(JobError::StoreUnavailable)
            .attach_printable_lazy(|| {
                format!("Creating upload directory {}", self.upload_dir.display())
            })?;

        // Uploads with the same name must not overwrite each other.
        let file_path = self.upload_dir.join(format!("{}-{name}", Uuid::now_v7()));
        tokio::fs::write(&file_path, contents)
            .await
            .change_context(JobError::StoreUnavailable)
            .attach_printable_lazy(|| format!("Writing upload {}", file_path.display()))?;

        let created = self
            .create(NewJob {
                filename: filename.to_string(),
                file_path: file_path.clone(),
            })
            .await;

        // Without a record nothing refers to the upload, so it is removed. After a queue failure
        // the Pending record still points at it.
        let job = match created {
            Ok(job) => job,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&file_path).await {
                    event!(
                        Level::WARN,
                        path = %file_path.display(),
                        error = %remove_err,
                        "Failed to remove orphaned upload"
                    );
                }
                return Err(e);
            }
        };

        self.submit(job.id).await?;
        Ok(job)
    }
}

/// Reduce an uploaded filename to its final path component.
fn sanitize_filename(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}
