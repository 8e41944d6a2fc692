use tokio::sync::oneshot;

use crate::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdateItem {
    pub job_id: JobId,
    pub status: JobStatus,
    pub timestamp: time::OffsetDateTime,
}

impl std::fmt::Display for StatusUpdateItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} job {}: {}", self.timestamp, self.job_id, self.status)
    }
}

enum StatusUpdateOp {
    Item(StatusUpdateItem),
    ReadFrom((oneshot::Sender<Vec<StatusUpdateItem>>, usize)),
    Take(oneshot::Sender<Vec<StatusUpdateItem>>),
}

/// Records every status change that the pipeline makes, in the order they happened. All clones
/// of a StatusCollector refer to the same list.
#[derive(Clone)]
pub struct StatusCollector {
    tx: flume::Sender<StatusUpdateOp>,
}

impl StatusCollector {
    pub fn new(estimated_num_jobs: usize) -> Self {
        let (tx, rx) = flume::unbounded();
        let collector = StatusCollector { tx };

        tokio::task::spawn(async move {
            // Each job goes through three statuses.
            let mut next_vec_size = estimated_num_jobs * 3;
            let mut items = Vec::with_capacity(next_vec_size);
            while let Ok(op) = rx.recv_async().await {
                match op {
                    StatusUpdateOp::Item(item) => {
                        items.push(item);
                    }
                    StatusUpdateOp::ReadFrom((tx, start)) => {
                        let start = start.min(items.len());
                        tx.send(items[start..].to_vec()).ok();
                    }
                    StatusUpdateOp::Take(tx) => {
                        next_vec_size =
                            std::cmp::max(16, next_vec_size.saturating_sub(items.len()));
                        let items =
                            std::mem::replace(&mut items, Vec::with_capacity(next_vec_size));
                        tx.send(items).ok();
                    }
                }
            }
        });

        collector
    }

    pub fn add(&self, job_id: JobId, status: JobStatus) {
        self.tx
            .send(StatusUpdateOp::Item(StatusUpdateItem {
                job_id,
                status,
                timestamp: time::OffsetDateTime::now_utc(),
            }))
            .ok();
    }

    pub async fn read(&self) -> Vec<StatusUpdateItem> {
        self.read_from(0).await
    }

    /// Read the items starting at index `start`. Polling callers can pass the number of items
    /// they have already seen.
    pub async fn read_from(&self, start: usize) -> Vec<StatusUpdateItem> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(StatusUpdateOp::ReadFrom((tx, start))).ok();
        rx.await.unwrap_or_default()
    }

    /// Remove and return all the items collected so far.
    pub async fn take(&self) -> Vec<StatusUpdateItem> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(StatusUpdateOp::Take(tx)).ok();
        rx.await.unwrap_or_default()
    }

    /// The statuses that a single job has gone through, in order.
    pub async fn sequence_for(&self, job_id: JobId) -> Vec<JobStatus> {
        self.read()
            .await
            .into_iter()
            .filter(|item| item.job_id == job_id)
            .map(|item| item.status)
            .collect()
    }
}
