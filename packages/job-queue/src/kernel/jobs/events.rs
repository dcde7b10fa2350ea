use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{FailureType, JobId, JobType};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Job lifecycle events.
///
/// These are facts about what already happened to a job, published after the
/// corresponding store transition succeeded. Observers that fall behind lose
/// the oldest events (broadcast semantics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job row was inserted.
    Enqueued {
        job_id: JobId,
        job_type: JobType,
        parent_job_id: Option<JobId>,
    },

    /// Job execution started.
    Started {
        job_id: JobId,
        job_type: JobType,
        worker_id: String,
        attempt: i32,
    },

    /// Job completed successfully.
    Succeeded {
        job_id: JobId,
        job_type: JobType,
        duration_ms: u64,
    },

    /// Job execution failed.
    Failed {
        job_id: JobId,
        job_type: JobType,
        error: String,
        failure_type: FailureType,
        attempt: i32,
        will_retry: bool,
    },

    /// Job moved to dead letter (exhausted retries or non-retryable error).
    DeadLettered {
        job_id: JobId,
        job_type: JobType,
        total_attempts: i32,
        reason: String,
    },

    /// Job was cancelled.
    Cancelled { job_id: JobId, job_type: JobType },

    /// A running job with no recent heartbeat was returned to pending.
    Recovered { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::DeadLettered { job_id, .. }
            | JobEvent::Cancelled { job_id, .. }
            | JobEvent::Recovered { job_id } => *job_id,
        }
    }
}

/// Broadcast hub for [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct JobEvents {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl JobEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
