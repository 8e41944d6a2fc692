//! A fixed set of workers consuming jobs from the queue.

use std::{sync::Arc, time::Duration};

use error_stack::Report;
use tokio::{sync::watch, task::JoinSet};
use tracing::{event, instrument, Level};

use crate::{Delivery, JobError, JobOutcome, Queue, ServiceContext, Worker};

/// How long a worker waits on the queue before checking for shutdown again.
const RECEIVE_WAIT: Duration = Duration::from_millis(250);


/// Runs a number of workers, each handling one job at a time, so at most `num_workers` models
/// are trained at once.
pub struct WorkerPool {
    shutdown_tx: Arc<watch::Sender<bool>>,
    workers: JoinSet<Result<(), Report<JobError>>>,
}

impl WorkerPool {
    /// Start `num_workers` workers. This must be called from within a Tokio runtime.
    pub fn start(ctx: &ServiceContext, num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut workers = JoinSet::new();
        for index in 0..num_workers {
            workers.spawn(run_worker(
                index,
                Worker::new(ctx),
                ctx.queue.clone(),
                shutdown_tx.clone(),
            ));
        }

        event!(Level::INFO, num_workers, "Started worker pool");
        Self {
            shutdown_tx,
            workers,
        }
    }

    /// Ask the workers to stop. Each worker finishes the job it is working on, if any, and
    /// then exits without taking another job from the queue.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Shut down the pool when the process receives Ctrl+C.
    pub fn shutdown_on_ctrl_c(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                event!(Level::INFO, "Received Ctrl+C, shutting down workers");
                shutdown_tx.send_replace(true);
            }
        });
    }

    /// Wait for all the workers to exit. Workers exit after [WorkerPool::shutdown], when the
    /// queue is closed and drained, or when any worker hits an infrastructure failure. In the
    /// last case the first such error is returned.
    pub async fn wait(mut self) -> Result<(), Report<JobError>> {
        let mut first_error = None;
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        event!(Level::ERROR, error = ?e, "Additional worker failure");
                    }
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[instrument(level = "debug", skip(worker, queue, shutdown_tx))]
async fn run_worker(
    index: usize,
    worker: Worker,
    queue: Arc<dyn Queue>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> Result<(), Report<JobError>> {
    loop {
        if *shutdown_tx.borrow() {
            event!(Level::DEBUG, "Worker shutting down");
            return Ok(());
        }

        // A receive is never cancelled, so a job taken from the queue always reaches a worker.
        let job_id = match queue.receive(RECEIVE_WAIT).await {
            Ok(Delivery::Job(job_id)) => job_id,
            Ok(Delivery::Idle) => continue,
            Ok(Delivery::Closed) => {
                event!(Level::DEBUG, "Queue closed, worker exiting");
                return Ok(());
            }
            Err(e) => {
                event!(Level::ERROR, error = ?e, "Failed to read from queue");
                shutdown_tx.send_replace(true);
                return Err(e);
            }
        };

        match worker.process(job_id).await {
            Ok(JobOutcome::Completed { .. }) => {
                event!(Level::DEBUG, %job_id, "Job finished");
            }
            Ok(outcome) => {
                event!(Level::DEBUG, %job_id, ?outcome, "Job not completed");
            }
            Err(e) => {
                event!(Level::ERROR, %job_id, error = ?e, "Worker failed, stopping the pool");
                shutdown_tx.send_replace(true);
                return Err(e);
            }
        }
    }
}
