//! Error types for the job queue.
//!
//! [`QueueError`] is returned by stores and the service facade. [`JobError`]
//! is what job handlers return when they want to control how a failure is
//! classified for retry.

use thiserror::Error;

use crate::kernel::jobs::{FailureType, JobId, JobStatus};
use crate::kernel::scheduler::TaskId;

/// Errors surfaced by the store, the service facade and the scheduler.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("scheduled task {0} not found")]
    TaskNotFound(TaskId),

    /// A guarded transition was attempted from a state that does not allow it.
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("parent job {0} does not exist")]
    UnknownParent(JobId),

    #[error("no callback registered under name '{0}'")]
    UnknownCallback(String),

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("invalid schedule for task '{task}': {reason}")]
    InvalidSchedule { task: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether this error is a rejected state transition.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Typed failure a job handler can return (inside `anyhow::Error`) to pick
/// its failure classification explicitly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Network or IO hiccup, safe to retry as-is
    #[error("transient failure: {0}")]
    Transient(String),

    /// Target resource is in use by someone else
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// The payload is malformed; retrying cannot help
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

impl JobError {
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Transient(_) => FailureType::Transient,
            Self::ResourceLocked(_) => FailureType::ResourceLocked,
            Self::Validation(_) => FailureType::Validation,
            Self::Timeout { .. } => FailureType::Timeout,
        }
    }
}
