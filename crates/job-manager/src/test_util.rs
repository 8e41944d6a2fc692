use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use error_stack::Report;
use marketsight_worker::{LinearTrainer, Trainer, TrainingError, TrainingSummary};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    ArtifactStore, Delivery, Job, JobError, JobId, JobStatus, JobStore, MemoryJobStore, MemoryQueue,
    NewJob, Queue, Replicator, ServiceContext, StatusCollector,
};

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default().with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

pub const GOOD_HEADER: &str = "open,high,low,volume,close";

/// Write a CSV file with `rows` rows of plausible price data.
pub fn write_dataset(dir: &Path, name: &str, header: &str, rows: usize) -> PathBuf {
    let columns = header.split(',').count();
    let mut contents = format!("{header}\n");
    for i in 0..rows {
        let price = 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1;
        let values = (0..columns)
            .map(|c| format!("{:.3}", price + c as f64 * 0.25))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(contents, "{values}").unwrap();
    }

    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// A [Replicator] that remembers what it uploaded, and can be told to fail.
#[derive(Default)]
pub struct RecordingReplicator {
    fail: bool,
    attempts: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
}

impl RecordingReplicator {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().clone()
    }
}

#[async_trait]
impl Replicator for RecordingReplicator {
    async fn upload(&self, _local_path: &Path, key: &str) -> Result<String, Report<JobError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Report::new(JobError::Replication));
        }

        self.uploaded.lock().push(key.to_string());
        Ok(format!("memory://{key}"))
    }
}

/// Wraps a [Queue], failing every push after [FailingQueue::fail_pushes] is called. Also counts
/// receive calls, so tests can tell whether one was abandoned part way through.
pub struct FailingQueue<Q: Queue> {
    pub inner: Q,
    fail: AtomicBool,
    pub receives_started: AtomicUsize,
    pub receives_finished: AtomicUsize,
}

impl<Q: Queue> FailingQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            receives_started: AtomicUsize::new(0),
            receives_finished: AtomicUsize::new(0),
        }
    }

    pub fn fail_pushes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<Q: Queue> Queue for FailingQueue<Q> {
    async fn push(&self, job_id: JobId) -> Result<(), Report<JobError>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Report::new(JobError::QueueUnavailable));
        }
        self.inner.push(job_id).await
    }

    async fn receive(&self, wait: Duration) -> Result<Delivery, Report<JobError>> {
        self.receives_started.fetch_add(1, Ordering::SeqCst);
        let delivery = self.inner.receive(wait).await;
        self.receives_finished.fetch_add(1, Ordering::SeqCst);
        delivery
    }
}

/// Wraps a [JobStore], failing status updates to `fail_on` with [JobError::StoreUnavailable].
pub struct FailingStore<S: JobStore> {
    pub inner: S,
    fail_on: Option<JobStatus>,
    fail_creates: bool,
}

impl<S: JobStore> FailingStore<S> {
    pub fn new(inner: S, fail_on: Option<JobStatus>) -> Self {
        Self {
            inner,
            fail_on,
            fail_creates: false,
        }
    }

    /// A store that can not create any jobs.
    pub fn failing_creates(inner: S) -> Self {
        Self {
            fail_creates: true,
            ..Self::new(inner, None)
        }
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FailingStore<S> {
    async fn create(&self, job: NewJob) -> Result<Job, Report<JobError>> {
        if self.fail_creates {
            return Err(Report::new(JobError::StoreUnavailable));
        }
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Job, Report<JobError>> {
        self.inner.get(id).await
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Job>, Report<JobError>> {
        self.inner.list(offset, limit).await
    }

    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, Report<JobError>> {
        if self.fail_on == Some(to) {
            return Err(Report::new(JobError::StoreUnavailable));
        }
        self.inner.update_status(id, from, to).await
    }
}

/// Wraps a [Trainer] to count how many times it runs and how many runs overlapped.
pub struct CountingTrainer {
    inner: LinearTrainer,
    delay: Duration,
    running: AtomicUsize,
    pub runs: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl CountingTrainer {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: LinearTrainer::default(),
            delay,
            running: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }
}

impl Trainer for CountingTrainer {
    fn artifact_extension(&self) -> &str {
        self.inner.artifact_extension()
    }

    fn train(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<TrainingSummary, Report<TrainingError>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        let result = self.inner.train(input, output);

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A trainer that panics, to make sure a panic inside a training function fails the job.
pub struct PanickingTrainer;

impl Trainer for PanickingTrainer {
    fn artifact_extension(&self) -> &str {
        "bin"
    }

    fn train(
        &self,
        _input: &Path,
        _output: &Path,
    ) -> Result<TrainingSummary, Report<TrainingError>> {
        panic!("training exploded");
    }
}

/// Everything a pipeline test needs, built around in-memory components.
pub struct TestPipeline {
    pub dir: tempfile::TempDir,
    pub ctx: ServiceContext,
    pub queue: Arc<FailingQueue<MemoryQueue>>,
    pub status: StatusCollector,
}

impl TestPipeline {
    pub fn new(trainer: Arc<dyn Trainer>) -> Self {
        Self::build(Arc::new(MemoryJobStore::new()), trainer, None)
    }

    pub fn build(
        store: Arc<dyn JobStore>,
        trainer: Arc<dyn Trainer>,
        replicator: Option<Arc<dyn Replicator>>,
    ) -> Self {
        setup_test_tracing();

        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FailingQueue::new(MemoryQueue::new()));
        let status = StatusCollector::new(16);

        let mut artifacts =
            ArtifactStore::new(dir.path().join("models"), trainer.artifact_extension());
        if let Some(replicator) = replicator {
            artifacts = artifacts.with_replicator(replicator, "models/");
        }

        let ctx = ServiceContext::new(
            store,
            queue.clone(),
            trainer,
            artifacts,
            dir.path().join("uploads"),
        )
        .with_status_collector(status.clone());

        Self {
            dir,
            ctx,
            queue,
            status,
        }
    }

    /// Write a dataset into the test directory.
    pub fn dataset(&self, name: &str, header: &str, rows: usize) -> PathBuf {
        write_dataset(self.dir.path(), name, header, rows)
    }

    /// Stop accepting jobs so that a worker pool exits once the queue is drained.
    pub fn close_queue(&self) {
        self.queue.inner.close();
    }
}
