use std::{path::PathBuf, sync::Arc};

use marketsight_worker::Trainer;

use crate::{ArtifactStore, JobStore, Queue, StatusCollector};

/// The shared handles that the submission side and the workers operate on. Build this once at
/// startup and pass it to [Enqueuer::new](crate::Enqueuer::new),
/// [Worker::new](crate::Worker::new), and [WorkerPool::start](crate::WorkerPool::start).
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn Queue>,
    pub trainer: Arc<dyn Trainer>,
    pub artifacts: ArtifactStore,
    /// Where uploaded datasets are written.
    pub upload_dir: PathBuf,
    /// If set, every status change is also recorded here.
    pub status: Option<StatusCollector>,
}

impl ServiceContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn Queue>,
        trainer: Arc<dyn Trainer>,
        artifacts: ArtifactStore,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            queue,
            trainer,
            artifacts,
            upload_dir: upload_dir.into(),
            status: None,
        }
    }

    pub fn with_status_collector(mut self, status: StatusCollector) -> Self {
        self.status = Some(status);
        self
    }
}
