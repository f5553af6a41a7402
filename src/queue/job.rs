use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of deferred work. The payload is the JSON the producer handed to `add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Ulid,
    pub queue: String,
    pub payload: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: Ms,
}

/// Per-queue journal records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEvent {
    Enqueued {
        id: Ulid,
        payload: String,
        enqueued_at: Ms,
        /// Attempts already spent; non-zero only in compacted journals.
        attempts: u32,
    },
    Started {
        id: Ulid,
        attempt: u32,
    },
    Completed {
        id: Ulid,
    },
    Failed {
        id: Ulid,
        attempt: u32,
        error: String,
        terminal: bool,
    },
}

/// Why a handler gave up on a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// Never retried: the same bytes will not parse next time either.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Executes jobs of one queue.
///
/// Handlers may see the same job more than once: after a retry, or after a
/// restart that interrupted it. They should tolerate that.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue key this handler serves.
    fn key(&self) -> &'static str;

    async fn handle(&self, payload: Value) -> Result<(), JobError>;
}

/// Final result of a job, reported on the channel returned by `JobQueue::process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        queue: &'static str,
        job_id: Ulid,
        attempts: u32,
    },
    /// Retries exhausted or payload unusable.
    Failed {
        queue: &'static str,
        job_id: Ulid,
        attempts: u32,
        error: String,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> Ulid {
        match self {
            JobOutcome::Completed { job_id, .. } | JobOutcome::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            JobOutcome::Completed { queue, .. } | JobOutcome::Failed { queue, .. } => queue,
        }
    }
}
