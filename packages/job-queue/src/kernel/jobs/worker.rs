//! Worker pool executing queued jobs.
//!
//! The `WorkerPool` is a long-running service that:
//! - Runs N slots, each polling the store for the next eligible job
//! - Dispatches the payload to the handler registered for its job type
//! - Enforces per-job timeouts and advisory cancellation
//! - Applies the retry policy to failures (retry, dead letter or fail)
//! - Fires completion callbacks on terminal outcomes
//! - Sends heartbeats for running jobs and sweeps stale ones
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► slot 0..N: claim_next ─► handler.execute(payload, JobContext)
//!     │        │                       ├─► ok       ─► mark_completed ─► fire(success)
//!     │        │                       ├─► error    ─► RetryPolicy.decide
//!     │        │                       │                 ├─► mark_retrying
//!     │        │                       │                 ├─► mark_dead_letter ─► fire(failure)
//!     │        │                       │                 └─► mark_failed      ─► fire(failure)
//!     │        │                       └─► cancelled ─► mark_cancelled
//!     │        └─► idle: back off min..max poll interval (woken on enqueue)
//!     └─► sweeper: requeue_stale every stale_sweep_interval
//! ```
//!
//! # Shutdown
//!
//! Cancelling the shutdown token stops claiming. In-flight handlers get
//! `drain_timeout` to finish; whatever is still running afterwards is
//! abandoned and reported as orphaned. Those rows stay `running` and are
//! returned to `pending` by the next stale sweep.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::JobEvent;
use super::job::{FailureType, Job, JobFailure, JobId, JobStatus};
use super::registry::{JobContext, JobHandler, SharedJobRegistry};
use super::retry::{RetryDecision, RetryPolicy};
use crate::error::{JobError, QueueError};
use crate::kernel::service_host::Service;
use crate::service::JobQueueService;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent execution slots
    pub max_concurrent_workers: usize,
    /// Poll interval right after finding work
    pub min_poll_interval: Duration,
    /// Poll interval ceiling while the queue stays empty
    pub max_poll_interval: Duration,
    /// Timeout for jobs without their own `timeout_seconds`
    pub default_timeout: Duration,
    /// How long shutdown waits for in-flight handlers
    pub drain_timeout: Duration,
    /// How often to send heartbeats for running jobs
    pub heartbeat_interval: Duration,
    /// Running jobs without liveness for this long are requeued
    pub stale_after: Duration,
    pub stale_sweep_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(3600),
            drain_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            stale_sweep_interval: Duration::from_secs(60),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// What happened to a pool when it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs in flight at shutdown that finished within the drain timeout
    pub drained: usize,
    /// Jobs abandoned while still running
    pub orphaned: Vec<JobId>,
}

/// Cancellation tokens of jobs executing in this process.
#[derive(Clone, Default)]
pub struct RunningJobs {
    tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl RunningJobs {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, job_id: JobId, token: CancellationToken) {
        self.lock().insert(job_id, token);
    }

    pub(crate) fn remove(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    /// Cancel one job's token. Returns whether the job runs here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

}

/// Aborts the task when dropped, so abandoning a future also abandons its work.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Outcome {
    Succeeded,
    Cancelled,
    Failed(JobFailure),
}

/// Bounded pool of execution slots.
pub struct WorkerPool {
    queue: JobQueueService,
    registry: SharedJobRegistry,
    retry: RetryPolicy,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(queue: JobQueueService, registry: SharedJobRegistry) -> Self {
        Self::with_config(queue, registry, WorkerPoolConfig::default(), RetryPolicy::default())
    }

    pub fn with_config(
        queue: JobQueueService,
        registry: SharedJobRegistry,
        config: WorkerPoolConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            registry,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled, then drain.
    pub async fn run_until(self, shutdown: CancellationToken) -> ShutdownReport {
        let pool = Arc::new(self);
        let slots = pool.config.max_concurrent_workers.max(1);
        info!(
            worker_id = %pool.config.worker_id,
            slots,
            registered = pool.registry.registered_types().len(),
            "worker pool starting"
        );

        if let Err(e) = pool
            .queue
            .recover(Utc::now(), pool.config.stale_after)
            .await
        {
            error!(error = %e, "startup recovery failed");
        }

        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let slot_id = format!("{}-{}", pool.config.worker_id, slot);
            let span = info_span!("worker_slot", slot = %slot_id);
            let pool = Arc::clone(&pool);
            let stop = shutdown.clone();
            handles.push(tokio::spawn(
                async move { pool.slot_loop(slot_id, stop).await }.instrument(span),
            ));
        }

        let sweeper = AbortOnDrop(tokio::spawn({
            let pool = Arc::clone(&pool);
            let stop = shutdown.clone();
            async move { pool.sweep_loop(stop).await }
        }));

        shutdown.cancelled().await;

        let in_flight = pool.queue.running().len();
        info!(
            worker_id = %pool.config.worker_id,
            in_flight,
            "worker pool stopping, draining in-flight jobs"
        );

        let drained = tokio::time::timeout(
            pool.config.drain_timeout,
            join_all(handles.iter_mut()),
        )
        .await
        .is_ok();
        drop(sweeper);

        let orphaned = if drained {
            Vec::new()
        } else {
            // Job tokens stay untouched so abandoned rows remain `running`
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }
            // A slot aborted before recording its outcome leaves its id behind
            let orphaned = pool.queue.running().ids();
            for job_id in &orphaned {
                pool.queue.running().remove(*job_id);
            }
            warn!(
                count = orphaned.len(),
                jobs = ?orphaned,
                "drain timeout elapsed; abandoning running jobs"
            );
            orphaned
        };

        info!(worker_id = %pool.config.worker_id, "worker pool stopped");
        ShutdownReport {
            drained: in_flight.saturating_sub(orphaned.len()),
            orphaned,
        }
    }

    async fn slot_loop(&self, slot_id: String, shutdown: CancellationToken) {
        let mut idle = self.config.min_poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = self.queue.store().claim_next(&slot_id, Utc::now()).await;
            match claimed {
                Ok(Some(job)) => {
                    idle = self.config.min_poll_interval;
                    self.process(job, &slot_id).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim job"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
                _ = self.queue.wake().notified() => {}
            }
            idle = (idle * 2).min(self.config.max_poll_interval);
        }

        debug!("worker slot stopped");
    }

    async fn sweep_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.stale_sweep_interval);
        interval.tick().await; // Startup recovery already swept

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.queue.sweep_stale(Utc::now(), self.config.stale_after).await {
                        warn!(error = %e, "stale job sweep failed");
                    }
                }
            }
        }
    }

    /// Execute one claimed job and record its outcome.
    async fn process(&self, job: Job, slot_id: &str) {
        let job_id = job.id;
        let started = Instant::now();
        let token = CancellationToken::new();
        self.queue.running().insert(job_id, token.clone());

        debug!(job_id, job_type = %job.job_type, attempt = job.attempt(), "job started");
        self.queue.events().publish(JobEvent::Started {
            job_id,
            job_type: job.job_type,
            worker_id: slot_id.to_string(),
            attempt: job.attempt(),
        });

        let outcome = match self.registry.get(job.job_type) {
            Some(handler) => self.execute(&job, handler, token).await,
            None => Outcome::Failed(JobFailure::new(
                FailureType::Validation,
                format!("no handler registered for job type {}", job.job_type),
            )),
        };

        match outcome {
            Outcome::Succeeded => self.on_success(&job, started.elapsed()).await,
            Outcome::Cancelled => self.on_cancelled(&job).await,
            Outcome::Failed(failure) => self.on_failure(&job, failure).await,
        }
        // Stays registered until the outcome is recorded
        self.queue.running().remove(job_id);
    }

    /// Run the handler in its own task, racing it against timeout and cancellation.
    async fn execute(
        &self,
        job: &Job,
        handler: Arc<dyn JobHandler>,
        token: CancellationToken,
    ) -> Outcome {
        let timeout = job.timeout(self.config.default_timeout);
        let ctx = JobContext::new(job, token.clone(), Arc::clone(self.queue.store()));
        let payload = job.payload.clone();

        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.execute(payload, ctx).await
        }));
        let _heartbeat = self.spawn_heartbeat(job.id, token.clone());

        tokio::select! {
            biased;

            result = &mut task.0 => match result {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(_)) if token.is_cancelled() => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(JobFailure::from_error(&e)),
                Err(e) if e.is_panic() => Outcome::Failed(JobFailure::new(
                    FailureType::Unknown,
                    format!("handler panicked: {}", panic_message(e.into_panic())),
                )),
                Err(e) => Outcome::Failed(JobFailure::new(
                    FailureType::Unknown,
                    format!("handler task ended unexpectedly: {e}"),
                )),
            },
            _ = token.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                let error = JobError::Timeout { seconds: timeout.as_secs() };
                Outcome::Failed(JobFailure::new(FailureType::Timeout, error.to_string()))
            }
        }
    }

    /// Refresh liveness while the job runs and forward cancellation requests to `token`.
    fn spawn_heartbeat(&self, job_id: JobId, token: CancellationToken) -> AbortOnDrop<()> {
        let store = Arc::clone(self.queue.store());
        let heartbeat_interval = self.config.heartbeat_interval;

        AbortOnDrop(tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match store.heartbeat(job_id, Utc::now()).await {
                            Ok(true) => {
                                info!(job_id, "cancellation requested; signalling handler");
                                token.cancel();
                            }
                            Ok(false) => {}
                            Err(e) => warn!(job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        }))
    }

    async fn on_success(&self, job: &Job, elapsed: Duration) {
        if let Err(e) = self.queue.store().mark_completed(job.id, Utc::now()).await {
            error!(job_id = job.id, error = %e, "failed to mark job as completed");
            self.queue.callbacks().discard(job.id).await;
            return;
        }

        let duration_ms = elapsed.as_millis() as u64;
        info!(job_id = job.id, job_type = %job.job_type, duration_ms, "job completed");
        self.queue.events().publish(JobEvent::Succeeded {
            job_id: job.id,
            job_type: job.job_type,
            duration_ms,
        });
        self.queue
            .callbacks()
            .fire(&self.queue, job, true, None)
            .await;
    }

    async fn on_cancelled(&self, job: &Job) {
        self.queue.callbacks().discard(job.id).await;
        match self.queue.store().mark_cancelled(job.id, Utc::now()).await {
            Ok(()) => {
                info!(job_id = job.id, job_type = %job.job_type, "running job cancelled");
                self.queue.events().publish(JobEvent::Cancelled {
                    job_id: job.id,
                    job_type: job.job_type,
                });
            }
            Err(e) => warn!(job_id = job.id, error = %e, "failed to mark job as cancelled"),
        }
    }

    async fn on_failure(&self, job: &Job, failure: JobFailure) {
        let now = Utc::now();

        match self.retry.decide(job, &failure) {
            RetryDecision::Retry { delay } => {
                let next_retry_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                match self
                    .queue
                    .store()
                    .mark_retrying(job.id, next_retry_at, &failure, now)
                    .await
                {
                    Ok(()) => {
                        warn!(
                            job_id = job.id,
                            job_type = %job.job_type,
                            failure_type = %failure.failure_type,
                            retry_count = job.retry_count + 1,
                            next_retry_at = %next_retry_at,
                            error = %failure.message,
                            "job failed, retry scheduled"
                        );
                        self.publish_failed(job, &failure, true);
                    }
                    Err(QueueError::InvalidStateTransition {
                        from: JobStatus::Running,
                        ..
                    }) => {
                        self.dead_letter(job, "retry budget exhausted", &failure)
                            .await;
                    }
                    Err(e) => error!(job_id = job.id, error = %e, "failed to schedule retry"),
                }
            }
            RetryDecision::DeadLetter { reason } => {
                self.dead_letter(job, &reason, &failure).await;
            }
            RetryDecision::PermanentFailure => {
                if let Err(e) = self.queue.store().mark_failed(job.id, &failure, now).await {
                    error!(job_id = job.id, error = %e, "failed to mark job as failed");
                    return;
                }
                warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    failure_type = %failure.failure_type,
                    error = %failure.message,
                    "job failed permanently"
                );
                self.publish_failed(job, &failure, false);
                self.queue
                    .callbacks()
                    .fire(&self.queue, job, false, Some(failure.message))
                    .await;
            }
        }
    }

    async fn dead_letter(&self, job: &Job, reason: &str, failure: &JobFailure) {
        if let Err(e) = self
            .queue
            .store()
            .mark_dead_letter(job.id, reason, failure, Utc::now())
            .await
        {
            error!(job_id = job.id, error = %e, "failed to move job to dead letter");
            return;
        }

        error!(
            job_id = job.id,
            job_type = %job.job_type,
            failure_type = %failure.failure_type,
            reason,
            "job moved to dead letter"
        );
        self.publish_failed(job, failure, false);
        self.queue.events().publish(JobEvent::DeadLettered {
            job_id: job.id,
            job_type: job.job_type,
            total_attempts: job.attempt(),
            reason: reason.to_string(),
        });
        self.queue
            .callbacks()
            .fire(&self.queue, job, false, Some(failure.message.clone()))
            .await;
    }

    fn publish_failed(&self, job: &Job, failure: &JobFailure, will_retry: bool) {
        self.queue.events().publish(JobEvent::Failed {
            job_id: job.id,
            job_type: job.job_type,
            error: failure.message.clone(),
            failure_type: failure.failure_type,
            attempt: job.attempt(),
            will_retry,
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait::async_trait]
impl Service for WorkerPool {
    fn name(&self) -> &'static str {
        "job-worker-pool"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let report = self.run_until(shutdown).await;
        if !report.orphaned.is_empty() {
            warn!(orphaned = ?report.orphaned, "jobs left running will be requeued by the next stale sweep");
        }
        Ok(())
    }
}
