use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// The unique ID of a job, assigned by the [JobStore](crate::JobStore) when the job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Error, Debug)]
#[error("Unknown job status {0:?}")]
pub struct UnknownStatus(pub String);

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Return true if a job in this status may move to `next`. Statuses only move forward, and
    /// a job can only finish after it has been claimed by a worker.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// The input needed to create a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// The name of the file as it was uploaded.
    pub filename: String,
    /// Where the dataset is stored.
    pub file_path: PathBuf,
}

/// A unit of work: one uploaded dataset and the state of training a model from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub filename: String,
    pub file_path: PathBuf,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time of the last status change. This is `None` until the job is claimed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Job {
    /// The time this job last changed.
    pub fn last_changed(&self) -> OffsetDateTime {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// The timestamp to record for the next status change. This is the current time, but always
    /// strictly later than [Job::last_changed] even if the clock moves backwards.
    pub fn next_update_time(&self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let last = self.last_changed();
        if now > last {
            now
        } else {
            last + Duration::nanoseconds(1)
        }
    }
}
