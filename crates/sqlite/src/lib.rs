//! A [JobStore] backed by SQLite, so that jobs survive a restart of the service.
//!
//! ```rust,no_run
//! use marketsight_sqlite::SqliteJobStore;
//!
//! # async fn run() -> Result<(), error_stack::Report<marketsight_job_manager::JobError>> {
//! let store = SqliteJobStore::connect("sqlite://marketsight.db").await?;
//! # Ok(())
//! # }
//! ```

use std::{path::PathBuf, str::FromStr};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use marketsight_job_manager::{Job, JobError, JobId, JobStatus, JobStore, NewJob};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;
use tracing::{event, instrument, Level};

#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

/// A job as stored in the database. Timestamps are nanoseconds since the Unix epoch.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    filename: String,
    file_path: String,
    status: String,
    created_at: i64,
    updated_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, Report<JobError>> {
        let status = JobStatus::from_str(&self.status)
            .change_context(JobError::StoreUnavailable)
            .attach_printable_lazy(|| format!("Job {} has a corrupt status", self.id))?;

        Ok(Job {
            id: JobId(self.id),
            filename: self.filename,
            file_path: PathBuf::from(self.file_path),
            status,
            created_at: from_nanos(self.created_at)?,
            updated_at: self.updated_at.map(from_nanos).transpose()?,
        })
    }
}

fn to_nanos(time: OffsetDateTime) -> Result<i64, Report<JobError>> {
    i64::try_from(time.unix_timestamp_nanos())
        .change_context(JobError::StoreUnavailable)
        .attach_printable_lazy(|| format!("Timestamp {time} out of range"))
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime, Report<JobError>> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .change_context(JobError::StoreUnavailable)
        .attach_printable_lazy(|| format!("Invalid timestamp {nanos}"))
}

impl SqliteJobStore {
    /// Open the database at `database_url`, creating it and the schema if needed.
    ///
    /// The URL should look like `sqlite://path/to/jobs.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, Report<JobError>> {
        let options = SqliteConnectOptions::from_str(database_url)
            .change_context(JobError::StoreUnavailable)
            .attach_printable_lazy(|| format!("Invalid database URL {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // A single connection serializes writes, and keeps an in-memory database alive for the
        // life of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .change_context(JobError::StoreUnavailable)
            .attach_printable_lazy(|| format!("Connecting to {database_url}"))?;

        let store = Self { pool };
        store.init_tables().await?;
        event!(Level::INFO, %database_url, "Opened job store");
        Ok(store)
    }

    /// Create a store that lives only as long as this object. Useful for tests.
    pub async fn in_memory() -> Result<Self, Report<JobError>> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_tables(&self) -> Result<(), Report<JobError>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .change_context(JobError::StoreUnavailable)
        .attach_printable("Creating jobs table")?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(level = "debug", skip(self))]
    async fn create(&self, job: NewJob) -> Result<Job, Report<JobError>> {
        let created_at = OffsetDateTime::now_utc();
        let file_path = job
            .file_path
            .to_str()
            .ok_or(JobError::Validation)
            .attach_printable_lazy(|| {
                format!("File path {} is not valid UTF-8", job.file_path.display())
            })?;

        let result = sqlx::query(
            "INSERT INTO jobs (filename, file_path, status, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&job.filename)
        .bind(file_path)
        .bind(JobStatus::Pending.as_str())
        .bind(to_nanos(created_at)?)
        .execute(&self.pool)
        .await
        .change_context(JobError::StoreUnavailable)
        .attach_printable("Inserting job")?;

        Ok(Job {
            id: JobId(result.last_insert_rowid()),
            filename: job.filename,
            file_path: job.file_path,
            status: JobStatus::Pending,
            created_at,
            updated_at: None,
        })
    }

    async fn get(&self, id: JobId) -> Result<Job, Report<JobError>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, filename, file_path, status, created_at, updated_at FROM jobs WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .change_context(JobError::StoreUnavailable)
        .attach_printable_lazy(|| format!("Fetching job {id}"))?;

        row.ok_or_else(|| Report::new(JobError::JobNotFound(id)))?
            .into_job()
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Job>, Report<JobError>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"SELECT id, filename, file_path, status, created_at, updated_at
            FROM jobs
            ORDER BY id
            LIMIT ? OFFSET ?"#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .change_context(JobError::StoreUnavailable)
        .attach_printable("Listing jobs")?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, Report<JobError>> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        // The status check and the write happen in one statement, so two workers can not both
        // claim the same job. The timestamp never goes backwards.
        let now = to_nanos(OffsetDateTime::now_utc())?;
        let result = sqlx::query(
            r#"UPDATE jobs
            SET status = ?,
                updated_at = MAX(?, COALESCE(updated_at, created_at) + 1)
            WHERE id = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .change_context(JobError::StoreUnavailable)
        .attach_printable_lazy(|| format!("Updating job {id} from {from} to {to}"))?;

        Ok(result.rows_affected() == 1)
    }
}
