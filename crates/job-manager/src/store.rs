//! Durable records of jobs and their status.

use async_trait::async_trait;
use error_stack::Report;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::{Job, JobError, JobId, JobStatus, NewJob};

/// Storage for [Job] records. The store is the only shared mutable state in the pipeline, and
/// every status change goes through [JobStore::update_status].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new job in [JobStatus::Pending] with a newly allocated ID.
    async fn create(&self, job: NewJob) -> Result<Job, Report<JobError>>;

    /// Fetch a job, or fail with [JobError::JobNotFound].
    async fn get(&self, id: JobId) -> Result<Job, Report<JobError>>;

    /// List jobs in creation order, skipping `offset` jobs and returning at most `limit`.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Job>, Report<JobError>>;

    /// Atomically move a job from `from` to `to` and record the update time. Returns false
    /// without writing anything if the job does not exist, is not currently in `from`, or the
    /// transition is not allowed.
    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, Report<JobError>>;
}

/// A [JobStore] that keeps jobs in memory. Useful for tests and single-process deployments that
/// don't need jobs to survive a restart.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(id: JobId) -> Option<usize> {
        usize::try_from(id.0).ok()?.checked_sub(1)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<Job, Report<JobError>> {
        let mut jobs = self.jobs.lock();
        let job = Job {
            id: JobId(jobs.len() as i64 + 1),
            filename: job.filename,
            file_path: job.file_path,
            status: JobStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
        };
        jobs.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, Report<JobError>> {
        let jobs = self.jobs.lock();
        Self::index(id)
            .and_then(|index| jobs.get(index))
            .cloned()
            .ok_or_else(|| Report::new(JobError::JobNotFound(id)))
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Job>, Report<JobError>> {
        let jobs = self.jobs.lock();
        Ok(jobs.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, Report<JobError>> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        let mut jobs = self.jobs.lock();
        let Some(job) = Self::index(id).and_then(|index| jobs.get_mut(index)) else {
            return Ok(false);
        };

        if job.status != from {
            return Ok(false);
        }

        job.updated_at = Some(job.next_update_time());
        job.status = to;
        Ok(true)
    }
}
