//! In-memory store for tests and embedded use.
//!
//! Implements the same guarded transitions as the Postgres store. All state
//! lives behind one mutex, which makes every operation atomic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{Job, JobFailure, JobFilter, JobId, JobStatus, NewJob};
use super::store::{lease_expiry, JobStore, ScheduledTaskStore};
use crate::error::{QueueError, Result};
use crate::kernel::scheduler::{NewScheduledTask, ScheduledTask, TaskId};

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    next_job_id: JobId,
    tasks: BTreeMap<TaskId, ScheduledTask>,
    next_task_id: TaskId,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl State {
    /// Fetch a job for a transition to `to`, checking its current status is in `allowed`.
    fn guarded(&mut self, job_id: JobId, allowed: &[JobStatus], to: JobStatus) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if !allowed.contains(&job.status) {
            return Err(QueueError::InvalidStateTransition {
                job_id,
                from: job.status,
                to,
            });
        }
        Ok(job)
    }
}

fn record_failure(job: &mut Job, failure: &JobFailure) {
    job.failure_type = Some(failure.failure_type);
    job.last_error_message = Some(failure.message.clone());
    job.last_error_traceback = failure.traceback.clone();
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every job, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    /// Overwrite a stored job. Lets tests stage states the public API cannot reach directly.
    pub fn put(&self, job: Job) {
        let mut state = self.state();
        state.next_job_id = state.next_job_id.max(job.id);
        state.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobId> {
        let mut state = self.state();
        if let Some(parent) = new.parent_job_id {
            if !state.jobs.contains_key(&parent) {
                return Err(QueueError::UnknownParent(parent));
            }
        }

        state.next_job_id += 1;
        let id = state.next_job_id;
        state.jobs.insert(id, Job::from_new(id, new, now));
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state();
        let next = state
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .max_by_key(|job| (job.priority, Reverse(job.created_at), Reverse(job.id)))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.next_retry_at = None;
        job.cancel_requested = false;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let job = state.guarded(job_id, &[JobStatus::Running], JobStatus::Completed)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.progress = Some(100.0);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state.guarded(job_id, &[JobStatus::Running], JobStatus::Failed)?;
        job.status = JobStatus::Failed;
        record_failure(job, failure);
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state.guarded(job_id, &[JobStatus::Running], JobStatus::Retrying)?;
        if job.retry_count >= job.max_retries {
            return Err(QueueError::InvalidStateTransition {
                job_id,
                from: job.status,
                to: JobStatus::Retrying,
            });
        }
        job.status = JobStatus::Retrying;
        job.retry_count += 1;
        job.next_retry_at = Some(next_retry_at);
        record_failure(job, failure);
        job.worker_id = None;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state.guarded(
            job_id,
            &[JobStatus::Running, JobStatus::Failed],
            JobStatus::DeadLetter,
        )?;
        job.status = JobStatus::DeadLetter;
        record_failure(job, failure);
        job.dead_letter_reason = Some(reason.to_string());
        job.moved_to_dead_letter_at = Some(now);
        job.completed_at.get_or_insert(now);
        job.next_retry_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_cancelled(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let job = state.guarded(
            job_id,
            &[JobStatus::Pending, JobStatus::Retrying, JobStatus::Running],
            JobStatus::Cancelled,
        )?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.next_retry_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn request_cancel(&self, job_id: JobId) -> Result<bool> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.cancel_requested = true;
        Ok(true)
    }

    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                job.heartbeat_at = Some(now);
                Ok(job.cancel_requested)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        progress: f32,
        message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if job.status == JobStatus::Running {
            job.progress = Some(progress.clamp(0.0, 100.0));
            if let Some(message) = message {
                job.progress_message = Some(message.to_string());
            }
        }
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.state();
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            let last_seen = job.heartbeat_at.or(job.started_at);
            if job.status == JobStatus::Running && last_seen.map_or(true, |at| at < cutoff) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.heartbeat_at = None;
                job.cancel_requested = false;
                job.updated_at = Utc::now();
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state();
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|job| filter.matches(job))
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_children(&self, parent_job_id: JobId) -> Result<i64> {
        let state = self.state();
        Ok(state
            .jobs
            .values()
            .filter(|job| job.parent_job_id == Some(parent_job_id))
            .count() as i64)
    }

    async fn find_undelivered_callbacks(&self, limit: i64) -> Result<Vec<Job>> {
        let state = self.state();
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.callback_name.is_some()
                    && job.callback_fired_at.is_none()
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_callback_fired(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.callback_fired_at.get_or_insert(now);
        Ok(())
    }
}

#[async_trait]
impl ScheduledTaskStore for MemoryJobStore {
    async fn upsert_task(
        &self,
        new: NewScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask> {
        let mut state = self.state();
        let existing = state
            .tasks
            .values()
            .find(|task| task.name == new.name)
            .map(|task| (task.id, task.created_at, task.last_run_at));

        let task = match existing {
            Some((id, created_at, last_run_at)) => {
                let mut task = ScheduledTask::from_new(id, new, now);
                task.created_at = created_at;
                task.last_run_at = last_run_at;
                task
            }
            None => {
                state.next_task_id += 1;
                ScheduledTask::from_new(state.next_task_id, new, now)
            }
        };

        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<ScheduledTask>> {
        Ok(self.state().tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self, enabled_only: bool) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .state()
            .tasks
            .values()
            .filter(|task| !enabled_only || task.enabled)
            .cloned()
            .collect())
    }

    async fn set_task_enabled(
        &self,
        task_id: TaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        task.enabled = enabled;
        if !enabled {
            task.next_run_at = None;
        }
        task.updated_at = now;
        Ok(())
    }

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        task.next_run_at = next_run_at;
        task.updated_at = now;
        Ok(())
    }

    async fn record_task_run(
        &self,
        task_id: TaskId,
        expected: Option<DateTime<Utc>>,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        if task.next_run_at != expected {
            return Ok(false);
        }
        task.last_run_at = Some(ran_at);
        task.next_run_at = next_run_at;
        task.updated_at = ran_at;
        Ok(true)
    }

    async fn rollback_task_run(
        &self,
        task_id: TaskId,
        claimed: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        if task.next_run_at != claimed {
            return Ok(false);
        }
        task.last_run_at = last_run_at;
        task.next_run_at = next_run_at;
        task.updated_at = now;
        Ok(true)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let expires_at = lease_expiry(now, ttl);
        let lease = state
            .leases
            .entry(name.to_string())
            .or_insert_with(|| (holder.to_string(), expires_at));
        if lease.0 != holder && lease.1 >= now {
            return Ok(false);
        }
        *lease = (holder.to_string(), expires_at);
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.state();
        if state
            .leases
            .get(name)
            .is_some_and(|(current, _)| current == holder)
        {
            state.leases.remove(name);
        }
        Ok(())
    }
}
