//! Train a model for each dataset given on the command line, using the full MarketSight pipeline
//! in a single process.
//!
//! Configuration is read from the environment (see [Config]), and can be overridden with
//! command line flags. Without `--queue-url` the queue lives in this process. With one, another
//! process can run workers against the same Redis queue and database.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use error_stack::Report;
use marketsight_aws_s3::S3Replicator;
use marketsight_job_manager::{
    ArtifactStore, Config, Enqueuer, Job, JobId, JobStatus, JobStore, MemoryQueue, Queue,
    ServiceContext, StatusCollector, WorkerPool,
};
use marketsight_redis::RedisQueue;
use marketsight_sqlite::SqliteJobStore;
use marketsight_worker::{LinearTrainer, Trainer};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
pub struct Cli {
    /// The number of models to train at once.
    #[clap(long)]
    workers: Option<usize>,

    /// Where trained models are written.
    #[clap(long)]
    work_dir: Option<PathBuf>,

    /// Where submitted datasets are copied.
    #[clap(long)]
    upload_dir: Option<PathBuf>,

    #[clap(long)]
    database_url: Option<String>,

    /// A Redis URL to use for the queue.
    #[clap(long)]
    queue_url: Option<String>,

    /// CSV files with open, high, low, volume, and close columns.
    #[clap(required = true)]
    files: Vec<PathBuf>,
}

fn to_eyre<C>(report: Report<C>) -> color_eyre::eyre::Report {
    eyre!("{report:?}")
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let mut config = Config::from_env().map_err(to_eyre)?;
    if let Some(workers) = args.workers {
        config.num_workers = workers.max(1);
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(upload_dir) = args.upload_dir {
        config.upload_dir = upload_dir;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if args.queue_url.is_some() {
        config.queue_url = args.queue_url;
    }

    let status = StatusCollector::new(args.files.len());
    let ctx = build_context(&config)
        .await?
        .with_status_collector(status.clone());

    let enqueuer = Enqueuer::new(&ctx);
    let mut submitted = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let contents = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("Reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| eyre!("{} is not a file", path.display()))?;

        let job = enqueuer
            .submit_upload(&filename, &contents)
            .await
            .map_err(to_eyre)?;
        submitted.push(job.id);
    }

    let pool = WorkerPool::start(&ctx, config.num_workers);
    pool.shutdown_on_ctrl_c();
    let pool_done = wait_for_jobs(ctx.store.as_ref(), &status, &submitted, pool).await;

    let mut jobs = Vec::with_capacity(submitted.len());
    for id in &submitted {
        jobs.push(ctx.store.get(*id).await.map_err(to_eyre)?);
    }
    print_summary(&ctx.artifacts, &jobs);

    pool_done.map_err(to_eyre)
}

async fn build_context(config: &Config) -> Result<ServiceContext> {
    let store = SqliteJobStore::connect(&config.database_url)
        .await
        .map_err(to_eyre)?;

    let queue: Arc<dyn Queue> = match &config.queue_url {
        Some(url) => Arc::new(
            RedisQueue::connect(url, &config.queue_name)
                .await
                .map_err(to_eyre)?,
        ),
        None => Arc::new(MemoryQueue::new()),
    };

    let trainer = LinearTrainer::default();
    let mut artifacts = ArtifactStore::new(&config.work_dir, trainer.artifact_extension());
    if let Some(replication) = &config.replication {
        event!(Level::INFO, bucket = %replication.bucket, "Replicating artifacts to S3");
        let replicator = S3Replicator::from_config(replication).await;
        artifacts = artifacts.with_replicator(Arc::new(replicator), &replication.prefix);
    }

    Ok(ServiceContext::new(
        Arc::new(store),
        queue,
        Arc::new(trainer),
        artifacts,
        &config.upload_dir,
    ))
}

/// Print status changes until every submitted job finishes or the pool stops, then shut the
/// pool down.
async fn wait_for_jobs(
    store: &dyn JobStore,
    status: &StatusCollector,
    submitted: &[JobId],
    pool: WorkerPool,
) -> Result<(), Report<marketsight_job_manager::JobError>> {
    let mut printed = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(200));

    let stopped_early = loop {
        interval.tick().await;

        let updates = status.read_from(printed).await;
        printed += updates.len();
        for update in updates {
            println!("{update}");
        }

        if pool.is_shutting_down() {
            break true;
        }

        let mut all_done = true;
        for id in submitted {
            if !store.get(*id).await?.status.is_terminal() {
                all_done = false;
                break;
            }
        }

        if all_done {
            break false;
        }
    };

    if stopped_early {
        event!(Level::WARN, "Worker pool stopped before all jobs finished");
    }

    pool.shutdown();
    pool.wait().await
}

fn print_summary(artifacts: &ArtifactStore, jobs: &[Job]) {
    println!();
    println!("{:>6}  {:<11}  {:<24}  artifact", "id", "status", "file");
    for job in jobs {
        let artifact = if job.status == JobStatus::Completed {
            artifacts.artifact_path(job.id).display().to_string()
        } else {
            String::new()
        };

        println!(
            "{:>6}  {:<11}  {:<24}  {}",
            job.id.to_string(),
            job.status.as_str(),
            job.filename,
            artifact
        );
    }
}
