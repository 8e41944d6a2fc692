//! Transport of job IDs from the submission side to the worker pool.

use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use flume::{Receiver, Sender};
use parking_lot::Mutex;

use crate::{JobError, JobId};

/// A queue of job IDs waiting to be processed. Delivery is at-least-once: workers must tolerate
/// receiving the same ID more than once.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add a job to the queue. Fails with [JobError::QueueUnavailable] if the queue can not accept
    /// the job.
    async fn push(&self, job_id: JobId) -> Result<(), Report<JobError>>;

    /// Wait up to `wait` for the next job.
    ///
    /// Implementations must not hold on to a job when this returns [Delivery::Idle], so callers
    /// can check for shutdown between calls instead of cancelling one that is in flight.
    async fn receive(&self, wait: Duration) -> Result<Delivery, Report<JobError>>;

    /// Wait for the next job. Returns `None` once the queue has been closed and drained.
    async fn pop(&self) -> Result<Option<JobId>, Report<JobError>> {
        loop {
            match self.receive(Duration::from_secs(1)).await? {
                Delivery::Job(job_id) => return Ok(Some(job_id)),
                Delivery::Idle => {}
                Delivery::Closed => return Ok(None),
            }
        }
    }
}

/// The result of one [Queue::receive] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Job(JobId),
    /// Nothing arrived before the wait ran out.
    Idle,
    /// The queue was closed and every job in it has been delivered.
    Closed,
}

/// An in-process [Queue] backed by a channel.
pub struct MemoryQueue {
    tx: Mutex<Option<Sender<JobId>>>,
    rx: Receiver<JobId>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Stop accepting new jobs. Consumers receive the jobs already in the queue, and then `None`.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// The number of jobs waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, job_id: JobId) -> Result<(), Report<JobError>> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(Report::new(JobError::QueueUnavailable))
                .attach_printable("Queue is closed");
        };

        tx.send(job_id)
            .map_err(|_| Report::new(JobError::QueueUnavailable))
    }

    async fn receive(&self, wait: Duration) -> Result<Delivery, Report<JobError>> {
        // Dropping a flume receive future leaves any unclaimed message in the channel.
        match tokio::time::timeout(wait, self.rx.recv_async()).await {
            Ok(Ok(job_id)) => Ok(Delivery::Job(job_id)),
            Ok(Err(_)) => Ok(Delivery::Closed),
            Err(_) => Ok(Delivery::Idle),
        }
    }
}
