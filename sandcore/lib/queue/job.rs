use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Sandbox, SpawnOptions};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Error recorded on jobs cancelled while queued.
pub const CANCELLED_MESSAGE: &str = "Cancelled";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A queued request to spawn one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnJob {
    /// The job id.
    pub id: String,

    /// What to spawn.
    pub options: SpawnOptions,

    /// Where the job is in its lifecycle.
    pub status: JobStatus,

    /// The spawned sandbox, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Sandbox>,

    /// The final error, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of retries performed so far, not counting the first attempt. A job that failed
    /// every attempt ends with `max_retries` here and `max_retries + 1` handler calls behind it.
    pub retry_count: u32,
}

/// The status of a spawn job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a free slot.
    Queued,

    /// The spawn pipeline is running.
    Running,

    /// The sandbox was spawned.
    Completed,

    /// Every attempt failed, or the job was cancelled.
    Failed,
}

/// Counters over the jobs the queue currently remembers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs waiting for a slot.
    pub queued: usize,

    /// Jobs being spawned.
    pub running: usize,

    /// Jobs that completed.
    pub completed: usize,

    /// Jobs that failed or were cancelled.
    pub failed: usize,

    /// The concurrency limit.
    pub max_concurrent: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SpawnJob {
    pub(crate) fn new(id: String, options: SpawnOptions) -> Self {
        Self {
            id,
            options,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    /// Whether the job will not change anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the job was cancelled before it started.
    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Failed && self.error.as_deref() == Some(CANCELLED_MESSAGE)
    }
}
