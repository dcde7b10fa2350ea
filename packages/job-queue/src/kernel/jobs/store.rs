//! Storage traits for jobs and scheduled tasks.
//!
//! Every state-changing method is a single guarded transition: it only
//! applies when the row is in an allowed prior state, and otherwise returns
//! [`QueueError::InvalidStateTransition`] (or [`QueueError::NotFound`]).
//!
//! [`QueueError::InvalidStateTransition`]: crate::error::QueueError::InvalidStateTransition
//! [`QueueError::NotFound`]: crate::error::QueueError::NotFound

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{Job, JobFailure, JobFilter, JobId, NewJob};
use crate::error::Result;
use crate::kernel::scheduler::{NewScheduledTask, ScheduledTask, TaskId};

/// Durable record of job state. Owns atomic claim and transition operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` row and return its id.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId>;

    /// Atomically claim the highest-priority, oldest eligible job.
    ///
    /// Eligible means `pending`, or `retrying` with `next_retry_at <= now`.
    /// At most one concurrent caller can claim a given row.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// `running -> completed`.
    async fn mark_completed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()>;

    /// `running -> failed` (terminal).
    async fn mark_failed(&self, job_id: JobId, failure: &JobFailure, now: DateTime<Utc>)
        -> Result<()>;

    /// `running -> retrying`, incrementing `retry_count`.
    ///
    /// Rejected when the retry budget is already spent.
    async fn mark_retrying(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `running | failed -> dead_letter`.
    async fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `pending | retrying | running -> cancelled`.
    async fn mark_cancelled(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()>;

    /// Set the advisory cancellation flag on a running job.
    ///
    /// Returns `false` when the job is not running.
    async fn request_cancel(&self, job_id: JobId) -> Result<bool>;

    /// Refresh liveness of a running job. Returns whether cancellation was requested.
    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool>;

    async fn update_progress(
        &self,
        job_id: JobId,
        progress: f32,
        message: Option<&str>,
    ) -> Result<()>;

    /// Return running jobs whose last heartbeat (or start) predates `cutoff` to `pending`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn count_children(&self, parent_job_id: JobId) -> Result<i64>;

    /// Completed jobs carrying a durable callback that has not fired yet.
    async fn find_undelivered_callbacks(&self, limit: i64) -> Result<Vec<Job>>;

    async fn mark_callback_fired(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()>;
}

/// Storage for recurring task definitions and the scheduler lease.
#[async_trait]
pub trait ScheduledTaskStore: Send + Sync {
    /// Insert or replace a task by its unique name.
    ///
    /// Replacing a task clears `next_run_at` so the schedule is recomputed.
    async fn upsert_task(&self, task: NewScheduledTask, now: DateTime<Utc>)
        -> Result<ScheduledTask>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<ScheduledTask>>;

    async fn list_tasks(&self, enabled_only: bool) -> Result<Vec<ScheduledTask>>;

    async fn set_task_enabled(&self, task_id: TaskId, enabled: bool, now: DateTime<Utc>)
        -> Result<()>;

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Claim a due window: sets `last_run_at` and `next_run_at` only if
    /// `next_run_at` still equals `expected`. Returns whether this caller won.
    async fn record_task_run(
        &self,
        task_id: TaskId,
        expected: Option<DateTime<Utc>>,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Undo a claimed window whose job could not be created: restores
    /// `last_run_at` and `next_run_at` only if `next_run_at` still equals `claimed`.
    async fn rollback_task_run(
        &self,
        task_id: TaskId,
        claimed: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Acquire or renew a named lease. Returns whether `holder` owns it afterwards.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
