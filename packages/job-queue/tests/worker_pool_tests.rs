//! Worker pool behavior: retries, dead letters, timeouts, panics, cancellation and shutdown.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{fast_pool_config, memory_service, start_pool, wait_status, wait_terminal};
use job_queue::kernel::jobs::NewJob;
use job_queue::{
    FailureType, Job, JobContext, JobError, JobEvent, JobQueueService, JobRegistry, JobRequest,
    JobStatus, JobType,
};

type Payload = serde_json::Value;

/// Registry whose handler for `job_type` always fails with `error`, counting attempts.
fn failing_registry(job_type: JobType, error: JobError, attempts: Arc<AtomicUsize>) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register_fn(job_type, move |_payload: Payload, _ctx: JobContext| {
        let error = error.clone();
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::Error::new(error))
        }
    });
    registry
}

async fn enqueue(service: &JobQueueService, job_type: JobType, max_retries: i32) -> i64 {
    service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(job_type)
                .max_retries(max_retries)
                .build(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn successful_job_completes() {
    let (service, _store) = memory_service();
    let mut events = service.subscribe();

    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::QuickSync, |_payload: Payload, ctx: JobContext| async move {
        ctx.report_progress(50.0, Some("halfway")).await;
        Ok(())
    });
    let pool = start_pool(&service, registry, fast_pool_config(2));

    let id = enqueue(&service, JobType::QuickSync, 3).await;
    let job = wait_terminal(&service, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, Some(100.0));
    assert!(job.completed_at.is_some());
    assert_eq!(job.retry_count, 0);

    pool.stop().await;

    let mut succeeded = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, JobEvent::Succeeded { job_id, .. } if job_id == id) {
            succeeded = true;
        }
    }
    assert!(succeeded, "Succeeded event published");
}

#[tokio::test]
async fn transient_failures_exhaust_into_dead_letter() {
    let (service, _store) = memory_service();
    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = failing_registry(
        JobType::SingleVideoDownload,
        JobError::Transient("connection reset".into()),
        attempts.clone(),
    );
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::SingleVideoDownload, 3).await;
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(job.failure_type, Some(FailureType::Transient));
    assert!(job.dead_letter_reason.is_some());
    assert!(job.moved_to_dead_letter_at.is_some());
}

#[tokio::test]
async fn smaller_budget_dead_letters_sooner() {
    let (service, _store) = memory_service();
    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = failing_registry(
        JobType::ChannelSync,
        JobError::Transient("network unreachable".into()),
        attempts.clone(),
    );
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::ChannelSync, 2).await;
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn validation_failure_is_never_retried() {
    let (service, _store) = memory_service();
    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = failing_registry(
        JobType::SingleVideoDownload,
        JobError::Validation("missing url".into()),
        attempts.clone(),
    );
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::SingleVideoDownload, 3).await;
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(job.failure_type, Some(FailureType::Validation));
}

#[tokio::test]
async fn zero_budget_fails_permanently() {
    let (service, _store) = memory_service();
    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = failing_registry(
        JobType::QuickSync,
        JobError::Transient("connection refused".into()),
        attempts.clone(),
    );
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::QuickSync, 0).await;
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(job.dead_letter_reason.is_none());
}

#[tokio::test]
async fn repeated_timeout_dead_letters() {
    let (service, _store) = memory_service();
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut registry = JobRegistry::new();
    let counter = attempts.clone();
    registry.register_fn(JobType::MetadataExtraction, move |_payload: Payload, _ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::MetadataExtraction)
                .timeout_seconds(1)
                .build(),
        )
        .await
        .unwrap();
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.failure_type, Some(FailureType::Timeout));
    assert_eq!(job.retry_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let (service, _store) = memory_service();

    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::Maintenance, |_payload: Payload, _ctx: JobContext| async move {
        if Utc::now().timestamp() > 0 {
            panic!("boom");
        }
        Ok(())
    });
    registry.register_fn(JobType::QuickSync, |_payload: Payload, _ctx: JobContext| async move {
        Ok(())
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let panicking = enqueue(&service, JobType::Maintenance, 0).await;
    let job = wait_terminal(&service, panicking).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_type, Some(FailureType::Unknown));
    assert!(job
        .last_error_message
        .as_deref()
        .is_some_and(|m| m.contains("boom")));

    // The slot keeps working after the panic
    let next = enqueue(&service, JobType::QuickSync, 0).await;
    assert_eq!(wait_terminal(&service, next).await.status, JobStatus::Completed);
    pool.stop().await;
}

#[tokio::test]
async fn unknown_job_type_dead_letters() {
    let (service, _store) = memory_service();
    let pool = start_pool(&service, JobRegistry::new(), fast_pool_config(1));

    let id = enqueue(&service, JobType::ChannelSync, 3).await;
    let job = wait_terminal(&service, id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.failure_type, Some(FailureType::Validation));
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn running_job_observes_cancellation() {
    let (service, _store) = memory_service();

    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::ChannelSync, |_payload: Payload, ctx: JobContext| async move {
        ctx.cancel.cancelled().await;
        anyhow::bail!("stopped at a safe point")
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::ChannelSync, 3).await;
    wait_status(&service, id, JobStatus::Running).await;

    assert!(service.cancel_job(id).await.unwrap());
    let job = wait_terminal(&service, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    let report = pool.stop().await;
    assert!(report.orphaned.is_empty());
}

#[tokio::test]
async fn shutdown_drains_in_flight_jobs() {
    let (service, _store) = memory_service();

    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::SingleVideoDownload, |_payload: Payload, _ctx: JobContext| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let id = enqueue(&service, JobType::SingleVideoDownload, 3).await;
    wait_status(&service, id, JobStatus::Running).await;

    let report = pool.stop().await;
    assert_eq!(report.drained, 1);
    assert!(report.orphaned.is_empty());
    assert_eq!(service.get_job(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_reports_orphans_after_drain_timeout() {
    for _ in 0..25 {
        let (service, _store) = memory_service();

        let mut registry = JobRegistry::new();
        registry.register_fn(JobType::ChannelSync, |_payload: Payload, _ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let config = job_queue::WorkerPoolConfig {
            drain_timeout: Duration::from_millis(20),
            ..fast_pool_config(1)
        };
        let pool = start_pool(&service, registry, config);

        let id = enqueue(&service, JobType::ChannelSync, 3).await;
        wait_status(&service, id, JobStatus::Running).await;

        let report = pool.stop().await;
        assert_eq!(report.orphaned, vec![id]);
        assert_eq!(report.drained, 0);
        // Left for the stale sweep
        assert_eq!(service.get_job(id).await.unwrap().status, JobStatus::Running);

        let requeued = service
            .sweep_stale(Utc::now() + chrono::Duration::hours(1), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(requeued, vec![id]);
    }
}

#[tokio::test]
async fn startup_recovers_stale_running_jobs() {
    let (service, store) = memory_service();

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    let mut stale = Job::from_new(
        1,
        NewJob::builder().job_type(JobType::QuickSync).build(),
        an_hour_ago,
    );
    stale.status = JobStatus::Running;
    stale.started_at = Some(an_hour_ago);
    stale.heartbeat_at = Some(an_hour_ago);
    stale.worker_id = Some("crashed-worker".to_string());
    store.put(stale);

    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::QuickSync, |_payload: Payload, _ctx: JobContext| async move {
        Ok(())
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let job = wait_terminal(&service, 1).await;
    pool.stop().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.worker_id.as_deref(), Some("test-worker-0"));
}
