//! Job lifecycle management for MarketSight model training.
//!
//! A job is created by the [Enqueuer] when a dataset is submitted, and its ID is placed on a
//! [Queue]. Workers in a [WorkerPool] take IDs off the queue, claim the job, run the configured
//! [Trainer](marketsight_worker::Trainer) on the dataset, and record the final status in the
//! [JobStore]. Completed artifacts are saved locally by the [ArtifactStore] and optionally copied
//! to remote storage by a [Replicator].

mod artifact;
mod config;
mod context;
mod enqueuer;
mod error;
mod job;
mod pool;
mod queue;
mod status;
mod store;
#[cfg(test)]
mod test_util;
mod worker;

pub use artifact::{ArtifactStore, ReplicationOutcome, Replicator};
pub use config::{Config, ConfigError, ReplicationConfig};
pub use context::ServiceContext;
pub use enqueuer::Enqueuer;
pub use error::JobError;
pub use job::{Job, JobId, JobStatus, NewJob, UnknownStatus};
pub use pool::WorkerPool;
pub use queue::{Delivery, MemoryQueue, Queue};
pub use status::{StatusCollector, StatusUpdateItem};
pub use store::{JobStore, MemoryJobStore};
pub use worker::{JobOutcome, Worker};
