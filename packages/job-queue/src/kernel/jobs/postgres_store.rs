//! PostgreSQL-backed job store.
//!
//! Every transition is a single `UPDATE ... WHERE id = $1 AND status IN (...)`.
//! When no row matches, the current row is read back to tell a missing job
//! apart from an illegal transition. Claims use `FOR UPDATE SKIP LOCKED` so
//! concurrent pollers never receive the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::job::{Job, JobFailure, JobFilter, JobId, JobStatus, NewJob};
use super::store::{lease_expiry, JobStore, ScheduledTaskStore};
use crate::error::{QueueError, Result};
use crate::kernel::scheduler::{NewScheduledTask, ScheduleColumns, ScheduledTask, TaskId};

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, status, priority,
    created_at, started_at, completed_at, updated_at,
    retry_count, max_retries, failure_type, last_error_message, last_error_traceback, next_retry_at,
    dead_letter_reason, moved_to_dead_letter_at,
    worker_id, heartbeat_at, cancel_requested, timeout_seconds, progress, progress_message,
    parent_job_id, callback_name, callback_params, callback_fired_at
"#;

const TASK_COLUMNS: &str = r#"
    id, name, task_type, enabled,
    schedule_kind, schedule_time, schedule_days, interval_minutes, cron_expr, timezone,
    params, priority, max_retries,
    last_run_at, next_run_at, created_at, updated_at
"#;

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations (`job_queue`, `scheduled_tasks`, `scheduler_leases`).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("job queue migrations applied");
        Ok(())
    }

    /// Explain why a guarded update touched no rows.
    async fn rejected(&self, job_id: JobId, to: JobStatus) -> QueueError {
        let current = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM job_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;

        match current {
            Ok(Some(from)) => QueueError::InvalidStateTransition { job_id, from, to },
            Ok(None) => QueueError::NotFound(job_id),
            Err(e) => QueueError::Database(e),
        }
    }

    async fn exists(&self, job_id: JobId) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT id FROM job_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId> {
        let parent_job_id = job.parent_job_id;
        let (callback_name, callback_params) = match job.callback {
            Some(callback) => (Some(callback.name), callback.params),
            None => (None, None),
        };

        let inserted = sqlx::query_scalar::<_, JobId>(
            r#"
            INSERT INTO job_queue (
                job_type, payload, status, priority, created_at, updated_at,
                max_retries, timeout_seconds, parent_job_id, callback_name, callback_params
            )
            VALUES ($1, $2, 'pending', $3, $4, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(now)
        .bind(job.max_retries)
        .bind(job.timeout_seconds)
        .bind(parent_job_id)
        .bind(callback_name)
        .bind(callback_params)
        .fetch_one(&self.pool)
        .await;

        match (inserted, parent_job_id) {
            (Ok(id), _) => Ok(id),
            (Err(sqlx::Error::Database(db)), Some(parent)) if db.is_foreign_key_violation() => {
                Err(QueueError::UnknownParent(parent))
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                   OR (status = 'retrying' AND next_retry_at <= $2)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue
            SET status = 'running',
                started_at = $2,
                heartbeat_at = $2,
                worker_id = $1,
                next_retry_at = NULL,
                cancel_requested = FALSE,
                updated_at = $2
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn mark_completed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'completed',
                completed_at = $2,
                progress = 100,
                updated_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failed',
                failure_type = $2,
                last_error_message = $3,
                last_error_traceback = $4,
                completed_at = $5,
                updated_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(failure.failure_type)
        .bind(&failure.message)
        .bind(&failure.traceback)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_retrying(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'retrying',
                retry_count = retry_count + 1,
                next_retry_at = $2,
                failure_type = $3,
                last_error_message = $4,
                last_error_traceback = $5,
                worker_id = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'running' AND retry_count < max_retries
            "#,
        )
        .bind(job_id)
        .bind(next_retry_at)
        .bind(failure.failure_type)
        .bind(&failure.message)
        .bind(&failure.traceback)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobStatus::Retrying).await);
        }
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'dead_letter',
                dead_letter_reason = $2,
                failure_type = $3,
                last_error_message = $4,
                last_error_traceback = $5,
                moved_to_dead_letter_at = $6,
                completed_at = COALESCE(completed_at, $6),
                next_retry_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status IN ('running', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .bind(failure.failure_type)
        .bind(&failure.message)
        .bind(&failure.traceback)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobStatus::DeadLetter).await);
        }
        Ok(())
    }

    async fn mark_cancelled(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'cancelled',
                completed_at = $2,
                next_retry_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'retrying', 'running')
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobStatus::Cancelled).await);
        }
        Ok(())
    }

    async fn request_cancel(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET cancel_requested = TRUE
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.exists(job_id).await? {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let cancel_requested = sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE job_queue
            SET heartbeat_at = $2
            WHERE id = $1 AND status = 'running'
            RETURNING cancel_requested
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cancel_requested.unwrap_or(false))
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        progress: f32,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET progress = $2,
                progress_message = COALESCE($3, progress_message)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(progress.clamp(0.0, 100.0))
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, JobId>(
            r#"
            UPDATE job_queue
            SET status = 'pending',
                worker_id = NULL,
                heartbeat_at = NULL,
                cancel_requested = FALSE,
                updated_at = NOW()
            WHERE status = 'running'
              AND COALESCE(heartbeat_at, started_at, updated_at) < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE TRUE"));

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if let Some(job_type) = filter.job_type {
            query.push(" AND job_type = ").push_bind(job_type);
        }
        if let Some(parent) = filter.parent_job_id {
            query.push(" AND parent_job_id = ").push_bind(parent);
        }

        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.max(0))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let jobs = query.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn count_children(&self, parent_job_id: JobId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM job_queue WHERE parent_job_id = $1",
        )
        .bind(parent_job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_undelivered_callbacks(&self, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM job_queue
            WHERE status = 'completed'
              AND callback_name IS NOT NULL
              AND callback_fired_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn mark_callback_fired(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET callback_fired_at = COALESCE(callback_fired_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledTaskStore for PostgresJobStore {
    async fn upsert_task(
        &self,
        task: NewScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask> {
        let columns = ScheduleColumns::from(&task.schedule);
        let sql = format!(
            r#"
            INSERT INTO scheduled_tasks (
                name, task_type, enabled, schedule_kind, schedule_time, schedule_days,
                interval_minutes, cron_expr, timezone, params, priority, max_retries,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT (name) DO UPDATE SET
                task_type = EXCLUDED.task_type,
                enabled = EXCLUDED.enabled,
                schedule_kind = EXCLUDED.schedule_kind,
                schedule_time = EXCLUDED.schedule_time,
                schedule_days = EXCLUDED.schedule_days,
                interval_minutes = EXCLUDED.interval_minutes,
                cron_expr = EXCLUDED.cron_expr,
                timezone = EXCLUDED.timezone,
                params = EXCLUDED.params,
                priority = EXCLUDED.priority,
                max_retries = EXCLUDED.max_retries,
                next_run_at = NULL,
                updated_at = EXCLUDED.updated_at
            RETURNING {TASK_COLUMNS}
            "#
        );

        let task = sqlx::query_as::<_, ScheduledTask>(&sql)
            .bind(&task.name)
            .bind(task.task_type)
            .bind(task.enabled)
            .bind(task.schedule.kind())
            .bind(columns.time)
            .bind(&columns.days)
            .bind(columns.interval_minutes)
            .bind(&columns.cron_expr)
            .bind(&task.timezone)
            .bind(&task.params)
            .bind(task.priority)
            .bind(task.max_retries)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<ScheduledTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = $1");
        let task = sqlx::query_as::<_, ScheduledTask>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    async fn list_tasks(&self, enabled_only: bool) -> Result<Vec<ScheduledTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE enabled OR NOT $1 ORDER BY id"
        );
        let tasks = sqlx::query_as::<_, ScheduledTask>(&sql)
            .bind(enabled_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn set_task_enabled(
        &self,
        task_id: TaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET enabled = $2,
                next_run_at = CASE WHEN $2 THEN next_run_at ELSE NULL END,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET next_run_at = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(task_id)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn record_task_run(
        &self,
        task_id: TaskId,
        expected: Option<DateTime<Utc>>,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET last_run_at = $3,
                next_run_at = $4,
                updated_at = $3
            WHERE id = $1 AND next_run_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(task_id)
        .bind(expected)
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rollback_task_run(
        &self,
        task_id: TaskId,
        claimed: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET last_run_at = $3,
                next_run_at = $4,
                updated_at = $5
            WHERE id = $1 AND next_run_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(task_id)
        .bind(claimed)
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE scheduler_leases.holder = EXCLUDED.holder
               OR scheduler_leases.expires_at < $4
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
