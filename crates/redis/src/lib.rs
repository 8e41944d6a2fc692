//! A [Queue] backed by a Redis list, so that the submission side and the workers can run in
//! different processes.
//!
//! Job IDs are pushed with `LPUSH` and taken with `BRPOP`, so jobs are delivered in the order they
//! were submitted.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use marketsight_job_manager::{Delivery, JobError, JobId, Queue};
use parking_lot::Mutex;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    AsyncCommands,
};
use tracing::{event, Level};

/// Prefix for all keys created by the queue.
const KEY_PREFIX: &str = "marketsight:queue:";

/// Redis treats a zero timeout as "block forever", so shorter waits are rounded up to this.
const MIN_BLOCK_SECS: f64 = 0.01;

#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    /// Connections for blocking pops, kept for reuse between calls.
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    key: String,
}

impl RedisQueue {
    /// Connect to the Redis server at `redis_url` and use the list for `queue_name`.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, Report<JobError>> {
        let client = redis::Client::open(redis_url)
            .change_context(JobError::QueueUnavailable)
            .attach_printable_lazy(|| format!("Invalid Redis URL {redis_url}"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .change_context(JobError::QueueUnavailable)
            .attach_printable_lazy(|| format!("Connecting to {redis_url}"))?;

        event!(Level::INFO, %redis_url, %queue_name, "Connected to Redis queue");
        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
            key: format!("{KEY_PREFIX}{queue_name}"),
        })
    }

    /// The Redis key of the list holding the queue.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The number of jobs waiting in the queue.
    pub async fn len(&self) -> Result<usize, Report<JobError>> {
        let mut conn = self.conn.clone();
        conn.llen(&self.key)
            .await
            .change_context(JobError::QueueUnavailable)
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, Report<JobError>> {
        let idle = self.blocking.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .change_context(JobError::QueueUnavailable)
                .attach_printable("Connecting to Redis"),
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push(&self, job_id: JobId) -> Result<(), Report<JobError>> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, job_id.0)
            .await
            .change_context(JobError::QueueUnavailable)
            .attach_printable_lazy(|| format!("Pushing job {job_id} to {}", self.key))?;
        Ok(())
    }

    /// Run one `BRPOP` for up to `wait`. A Redis queue is never closed, so this never returns
    /// [Delivery::Closed].
    async fn receive(&self, wait: Duration) -> Result<Delivery, Report<JobError>> {
        // BRPOP blocks the whole connection, so it runs on its own connection instead of
        // stalling pushes on the shared one.
        let mut conn = self.blocking_connection().await?;
        let popped: Option<(String, String)> = conn
            .brpop(&self.key, wait.as_secs_f64().max(MIN_BLOCK_SECS))
            .await
            .change_context(JobError::QueueUnavailable)
            .attach_printable_lazy(|| format!("Popping from {}", self.key))?;
        self.blocking.lock().push(conn);

        let Some((_, value)) = popped else {
            return Ok(Delivery::Idle);
        };

        match value.parse::<i64>() {
            Ok(id) => Ok(Delivery::Job(JobId(id))),
            Err(_) => {
                event!(Level::WARN, key = %self.key, %value, "Dropping malformed queue entry");
                Ok(Delivery::Idle)
            }
        }
    }
}
