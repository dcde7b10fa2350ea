//! Recurring scheduler service.
//!
//! On every tick the scheduler:
//! 1. Acquires (or renews) the scheduler lease; non-leaders do nothing
//! 2. Computes `next_run_at` for enabled tasks that have none yet
//! 3. For each due task, claims the window with a compare-and-set on
//!    `next_run_at`, then creates the job through [`JobQueueService`]
//!
//! Missed windows are coalesced: a task that was due several times while no
//! scheduler ran fires once and is rescheduled from the current tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::task::{NewScheduledTask, ScheduledTask, TaskId};
use crate::error::{QueueError, Result};
use crate::kernel::jobs::{JobId, ScheduledTaskStore};
use crate::kernel::service_host::Service;
use crate::service::{JobQueueService, JobRequest};

/// Configuration for the recurring scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Lease lifetime; must comfortably exceed `tick_interval`
    pub lease_ttl: Duration,
    /// Identity recorded as the lease holder
    pub instance_id: String,
    pub lease_name: String,
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(90),
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
            lease_name: "recurring-scheduler".to_string(),
            enabled: true,
        }
    }
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether this instance held the lease for the tick
    pub leader: bool,
    /// Tasks fired during the tick and the jobs they created
    pub fired: Vec<(TaskId, JobId)>,
}

pub struct RecurringScheduler {
    tasks: Arc<dyn ScheduledTaskStore>,
    queue: JobQueueService,
    config: SchedulerConfig,
}

impl RecurringScheduler {
    pub fn new(tasks: Arc<dyn ScheduledTaskStore>, queue: JobQueueService) -> Self {
        Self::with_config(tasks, queue, SchedulerConfig::default())
    }

    pub fn with_config(
        tasks: Arc<dyn ScheduledTaskStore>,
        queue: JobQueueService,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create or replace a task definition by name.
    ///
    /// The schedule and timezone are validated up front; replacing a task
    /// recomputes its next run on the following tick.
    pub async fn register_task(&self, task: NewScheduledTask) -> Result<ScheduledTask> {
        let now = Utc::now();
        let candidate = ScheduledTask::from_new(0, task.clone(), now);
        candidate.schedule()?;
        candidate.tz()?;
        if task.max_retries < 0 {
            return Err(QueueError::InvalidSchedule {
                task: task.name,
                reason: format!("max_retries must be >= 0, got {}", task.max_retries),
            });
        }

        let stored = self.tasks.upsert_task(task, now).await?;
        info!(
            task_id = stored.id,
            task = %stored.name,
            kind = %stored.schedule_kind,
            enabled = stored.enabled,
            "scheduled task registered"
        );
        Ok(stored)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.tasks.list_tasks(false).await
    }

    /// Enable or disable a task. Disabling clears `next_run_at`.
    pub async fn set_enabled(&self, task_id: TaskId, enabled: bool) -> Result<()> {
        self.tasks.set_task_enabled(task_id, enabled, Utc::now()).await
    }

    /// Evaluate every enabled task once at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let leader = self
            .tasks
            .try_acquire_lease(
                &self.config.lease_name,
                &self.config.instance_id,
                self.config.lease_ttl,
                now,
            )
            .await?;
        if !leader {
            debug!("not the scheduler leader; skipping tick");
            return Ok(TickReport::default());
        }

        let mut fired = Vec::new();
        for task in self.tasks.list_tasks(true).await? {
            match self.evaluate(&task, now).await {
                Ok(Some(job_id)) => fired.push((task.id, job_id)),
                Ok(None) => {}
                Err(e) => warn!(task_id = task.id, task = %task.name, error = %e, "skipping scheduled task"),
            }
        }

        Ok(TickReport {
            leader: true,
            fired,
        })
    }

    async fn evaluate(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<Option<JobId>> {
        let due_at = match task.next_run_at {
            Some(at) => at,
            None => {
                let at = task.first_run_at(now)?;
                self.tasks.set_next_run_at(task.id, Some(at), now).await?;
                debug!(task_id = task.id, next_run_at = %at, "computed first run");
                at
            }
        };
        if due_at > now {
            return Ok(None);
        }

        let next_run_at = task.next_run_after_fire(now)?;
        let claimed = self
            .tasks
            .record_task_run(task.id, Some(due_at), now, Some(next_run_at))
            .await?;
        if !claimed {
            debug!(task_id = task.id, "window already fired elsewhere");
            return Ok(None);
        }

        let created = self
            .queue
            .create_and_add_job(
                JobRequest::builder()
                    .job_type(task.task_type)
                    .priority(task.priority)
                    .payload(task.params.clone())
                    .max_retries(task.max_retries)
                    .build(),
            )
            .await;
        let job_id = match created {
            Ok(job_id) => job_id,
            Err(e) => {
                // Hand the window back so a later tick fires it
                let restored = self
                    .tasks
                    .rollback_task_run(
                        task.id,
                        Some(next_run_at),
                        task.last_run_at,
                        Some(due_at),
                        now,
                    )
                    .await?;
                if !restored {
                    warn!(task_id = task.id, "window changed before it could be restored");
                }
                return Err(e);
            }
        };

        info!(
            task_id = task.id,
            task = %task.name,
            job_id,
            next_run_at = %next_run_at,
            "scheduled task fired"
        );
        Ok(Some(job_id))
    }
}

#[async_trait::async_trait]
impl Service for RecurringScheduler {
    fn name(&self) -> &'static str {
        "recurring-scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            instance_id = %self.config.instance_id,
            tick_secs = self.config.tick_interval.as_secs(),
            "recurring scheduler starting"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    let span = info_span!("scheduler_tick", at = %now);
                    match self.tick(now).instrument(span).await {
                        Ok(report) if !report.fired.is_empty() => {
                            debug!(fired = report.fired.len(), "scheduler tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }

        if let Err(e) = self
            .tasks
            .release_lease(&self.config.lease_name, &self.config.instance_id)
            .await
        {
            warn!(error = %e, "failed to release scheduler lease");
        }
        info!("recurring scheduler stopped");
        Ok(())
    }
}
