//! `JobQueueService` - the entry point collaborators use to submit and inspect jobs.
//!
//! The service is a cheap `Clone` handle over shared state: the store, the
//! callback dispatcher, the in-process table of running jobs and the event hub.
//! Worker pools and the recurring scheduler hold a clone and go through it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::error::{QueueError, Result};
use crate::kernel::jobs::{
    CallbackDispatcher, CallbackRef, Job, JobCallback, JobEvent, JobEvents, JobFilter, JobId,
    JobPriority, JobStatus, JobStatusView, JobStore, JobSummary, JobType, NewJob, RunningJobs,
    DEFAULT_MAX_RETRIES,
};

/// Number of undelivered durable callbacks examined per recovery pass.
const REDELIVERY_BATCH: i64 = 100;

/// A request to create one job.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRequest {
    pub job_type: JobType,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub payload: serde_json::Value,
    /// Process-local completion callback.
    #[builder(default, setter(strip_option))]
    pub callback: Option<Arc<dyn JobCallback>>,
    /// Durable callback, stored on the row and redelivered after a restart.
    #[builder(default, setter(strip_option))]
    pub callback_ref: Option<CallbackRef>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub timeout_seconds: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<JobId>,
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("payload", &self.payload)
            .field("callback", &self.callback.is_some())
            .field("callback_ref", &self.callback_ref)
            .field("max_retries", &self.max_retries)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("parent_job_id", &self.parent_job_id)
            .finish()
    }
}

/// Result of a startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale running jobs returned to pending
    pub requeued: Vec<JobId>,
    /// Durable callbacks that were fired again
    pub callbacks_redelivered: usize,
}

struct Inner {
    store: Arc<dyn JobStore>,
    callbacks: CallbackDispatcher,
    running: RunningJobs,
    events: JobEvents,
    wake: Notify,
}

#[derive(Clone)]
pub struct JobQueueService {
    inner: Arc<Inner>,
}

impl JobQueueService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                callbacks: CallbackDispatcher::new(),
                running: RunningJobs::default(),
                events: JobEvents::default(),
                wake: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn callbacks(&self) -> &CallbackDispatcher {
        &self.inner.callbacks
    }

    pub fn events(&self) -> &JobEvents {
        &self.inner.events
    }

    pub(crate) fn running(&self) -> &RunningJobs {
        &self.inner.running
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.inner.wake
    }

    /// Register a durable callback that job requests can reference by name.
    pub fn register_callback(&self, name: impl Into<String>, callback: Arc<dyn JobCallback>) {
        self.inner.callbacks.register_named(name, callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and durably insert a job. Returns as soon as the row exists.
    pub async fn create_and_add_job(&self, request: JobRequest) -> Result<JobId> {
        let max_retries = request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries < 0 {
            return Err(QueueError::InvalidRequest(format!(
                "max_retries must be >= 0, got {max_retries}"
            )));
        }
        if let Some(timeout) = request.timeout_seconds {
            if timeout <= 0 {
                return Err(QueueError::InvalidRequest(format!(
                    "timeout_seconds must be positive, got {timeout}"
                )));
            }
        }
        if let Some(reference) = &request.callback_ref {
            if !self.inner.callbacks.has_named(&reference.name) {
                return Err(QueueError::UnknownCallback(reference.name.clone()));
            }
        }
        if let Some(parent) = request.parent_job_id {
            if self.inner.store.get(parent).await?.is_none() {
                return Err(QueueError::UnknownParent(parent));
            }
        }

        let new = NewJob {
            job_type: request.job_type,
            priority: request.priority,
            payload: request.payload,
            max_retries,
            timeout_seconds: request.timeout_seconds,
            parent_job_id: request.parent_job_id,
            callback: request.callback_ref,
        };

        let now = Utc::now();
        let job_id = match request.callback {
            Some(callback) => {
                self.inner
                    .callbacks
                    .register_during(callback, self.inner.store.enqueue(new, now))
                    .await?
            }
            None => self.inner.store.enqueue(new, now).await?,
        };

        info!(
            job_id,
            job_type = %request.job_type,
            priority = %request.priority,
            parent_job_id = ?request.parent_job_id,
            "job enqueued"
        );
        self.inner.events.publish(JobEvent::Enqueued {
            job_id,
            job_type: request.job_type,
            parent_job_id: request.parent_job_id,
        });
        self.inner.wake.notify_waiters();

        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let job = self.get_job(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let jobs = self.inner.store.list(filter).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// Cancel a job.
    ///
    /// Pending and retrying jobs are cancelled immediately. For a running job
    /// cancellation is advisory: the flag is set and the handler's token is
    /// cancelled, and `true` is returned. Jobs already in a terminal state
    /// return `false`.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        // A pending job can be claimed between the read and the update; re-read and retry.
        for _ in 0..3 {
            let job = self.get_job(job_id).await?;
            match job.status {
                JobStatus::Pending | JobStatus::Retrying => {
                    match self.inner.store.mark_cancelled(job_id, Utc::now()).await {
                        Ok(()) => {
                            self.inner.callbacks.discard(job_id).await;
                            info!(job_id, "job cancelled");
                            self.inner.events.publish(JobEvent::Cancelled {
                                job_id,
                                job_type: job.job_type,
                            });
                            return Ok(true);
                        }
                        Err(e) if e.is_invalid_transition() => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Running => {
                    let flagged = self.inner.store.request_cancel(job_id).await?;
                    let signalled = self.inner.running.cancel(job_id);
                    info!(job_id, flagged, signalled, "cancellation requested for running job");
                    if flagged || signalled {
                        return Ok(true);
                    }
                }
                _ => return Ok(false),
            }
        }

        warn!(job_id, "job kept changing state while cancelling");
        Ok(false)
    }

    /// Return running jobs with no liveness since `now - stale_after` to pending.
    ///
    /// Jobs still executing in this process are heartbeated first and never requeued.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<JobId>> {
        for job_id in self.inner.running.ids() {
            if self.inner.store.heartbeat(job_id, now).await? {
                self.inner.running.cancel(job_id);
            }
        }

        let cutoff = now
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let requeued = self.inner.store.requeue_stale(cutoff).await?;

        for job_id in &requeued {
            warn!(job_id, "stale running job returned to pending");
            self.inner
                .events
                .publish(JobEvent::Recovered { job_id: *job_id });
        }
        if !requeued.is_empty() {
            self.inner.wake.notify_waiters();
        }
        Ok(requeued)
    }

    /// Startup recovery: sweep stale running jobs and redeliver durable callbacks.
    pub async fn recover(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<RecoveryReport> {
        let requeued = self.sweep_stale(now, stale_after).await?;
        let callbacks_redelivered = self
            .inner
            .callbacks
            .redeliver(self, REDELIVERY_BATCH)
            .await?;

        if !requeued.is_empty() || callbacks_redelivered > 0 {
            info!(
                requeued = requeued.len(),
                callbacks_redelivered, "recovery pass complete"
            );
        }
        Ok(RecoveryReport {
            requeued,
            callbacks_redelivered,
        })
    }
}
