//! Job chaining through completion callbacks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use common::{fast_pool_config, memory_service, start_pool, wait_for};
use job_queue::kernel::jobs::NewJob;
use job_queue::{
    callback_fn, CallbackEvent, CallbackRef, Job, JobContext, JobFilter, JobPriority,
    JobQueueService, JobRegistry, JobRequest, JobStatus, JobType,
};
use serde::Deserialize;

type Payload = serde_json::Value;

#[derive(Debug, Deserialize)]
struct SpawnParams {
    count: usize,
}

fn ok_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    for job_type in JobType::ALL {
        registry.register_fn(job_type, |_payload: Payload, _ctx: JobContext| async move { Ok(()) });
    }
    registry
}

async fn spawn_downloads(queue: &JobQueueService, parent: i64, count: usize) -> anyhow::Result<()> {
    for index in 0..count {
        queue
            .create_and_add_job(
                JobRequest::builder()
                    .job_type(JobType::SingleVideoDownload)
                    .payload(serde_json::json!({ "index": index }))
                    .parent_job_id(parent)
                    .build(),
            )
            .await?;
    }
    Ok(())
}

async fn children(service: &JobQueueService, parent: i64) -> Vec<job_queue::JobSummary> {
    service
        .list_jobs(&JobFilter::builder().parent_job_id(parent).build())
        .await
        .unwrap()
}

#[tokio::test]
async fn local_callback_spawns_child_batch() {
    let (service, _store) = memory_service();
    // One slot: it stays inside the callback, so no child can start before the snapshot
    let pool = start_pool(&service, ok_registry(), fast_pool_config(1));

    let (tx, rx) = tokio::sync::oneshot::channel::<(i64, Vec<job_queue::JobSummary>)>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let parent = service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::MetadataExtraction)
                .priority(JobPriority::High)
                .callback(callback_fn(move |queue: JobQueueService, event: CallbackEvent| {
                    let tx = tx.clone();
                    async move {
                        anyhow::ensure!(event.success, "metadata extraction failed");
                        spawn_downloads(&queue, event.job.id, 5).await?;
                        let batch = children(&queue, event.job.id).await;
                        if let Some(tx) = tx.lock().unwrap().take() {
                            let _ = tx.send((event.job.id, batch));
                        }
                        Ok(())
                    }
                }))
                .build(),
        )
        .await
        .unwrap();

    let (fired_for, batch) = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired_for, parent);
    assert_eq!(batch.len(), 5);
    assert!(batch
        .iter()
        .all(|c| c.status == JobStatus::Pending && c.parent_job_id == Some(parent)));

    let job = service.get_job(parent).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.priority, JobPriority::High);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let batch = children(&service, parent).await;
        if batch.len() == 5 && batch.iter().all(|c| c.status == JobStatus::Completed) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "children did not finish");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    pool.stop().await;
    assert_eq!(service.callbacks().pending_local().await, 0);
}

#[tokio::test]
async fn durable_callback_fires_with_params_and_is_recorded() {
    let (service, _store) = memory_service();
    service.register_callback(
        "spawn_downloads",
        callback_fn(|queue: JobQueueService, event: CallbackEvent| async move {
            let params: SpawnParams = serde_json::from_value(event.params.unwrap_or_default())?;
            spawn_downloads(&queue, event.job.id, params.count).await
        }),
    );
    let pool = start_pool(&service, ok_registry(), fast_pool_config(1));

    let parent = service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::MetadataExtraction)
                .callback_ref(CallbackRef::with_params(
                    "spawn_downloads",
                    serde_json::json!({ "count": 3 }),
                ))
                .build(),
        )
        .await
        .unwrap();

    let job = wait_for(&service, parent, std::time::Duration::from_secs(5), |job| {
        job.callback_fired_at.is_some()
    })
    .await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(children(&service, parent).await.len(), 3);

    pool.stop().await;
}

#[tokio::test]
async fn failure_callback_reports_the_error() {
    let (service, _store) = memory_service();
    let mut registry = JobRegistry::new();
    registry.register_fn(JobType::ChannelSync, |_payload: Payload, _ctx: JobContext| async move {
        Err(anyhow::Error::new(job_queue::JobError::Validation("unknown channel".into())))
    });
    let pool = start_pool(&service, registry, fast_pool_config(1));

    let (tx, rx) = tokio::sync::oneshot::channel::<CallbackEvent>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let id = service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::ChannelSync)
                .callback(callback_fn(move |_queue: JobQueueService, event: CallbackEvent| {
                    let tx = tx.clone();
                    async move {
                        if let Some(tx) = tx.lock().unwrap().take() {
                            let _ = tx.send(event);
                        }
                        Ok(())
                    }
                }))
                .build(),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    pool.stop().await;

    assert_eq!(event.job.id, id);
    assert!(!event.success);
    assert_eq!(event.job.status, JobStatus::DeadLetter);
    assert!(event.error.is_some_and(|e| e.contains("unknown channel")));
}

fn completed_with_callback(id: i64) -> Job {
    let mut job = Job::from_new(
        id,
        NewJob::builder()
            .job_type(JobType::MetadataExtraction)
            .callback(CallbackRef::with_params(
                "spawn_downloads",
                serde_json::json!({ "count": 2 }),
            ))
            .build(),
        Utc::now(),
    );
    job.status = JobStatus::Completed;
    job.started_at = Some(Utc::now());
    job.completed_at = Some(Utc::now());
    job
}

#[tokio::test]
async fn recovery_redelivers_unfired_callbacks_once() {
    let (service, store) = memory_service();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    service.register_callback(
        "spawn_downloads",
        callback_fn(move |queue: JobQueueService, event: CallbackEvent| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let params: SpawnParams = serde_json::from_value(event.params.unwrap_or_default())?;
                spawn_downloads(&queue, event.job.id, params.count).await
            }
        }),
    );

    // Completed before a crash; the callback never ran
    store.put(completed_with_callback(1));

    // Completed before a crash; the callback ran but delivery was not recorded
    store.put(completed_with_callback(2));
    service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::SingleVideoDownload)
                .parent_job_id(2)
                .build(),
        )
        .await
        .unwrap();

    let stale_after = std::time::Duration::from_secs(300);
    let report = service.recover(Utc::now(), stale_after).await.unwrap();
    assert_eq!(report.callbacks_redelivered, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(children(&service, 1).await.len(), 2);
    assert_eq!(children(&service, 2).await.len(), 1, "no duplicate batch");

    for id in [1, 2] {
        assert!(service.get_job(id).await.unwrap().callback_fired_at.is_some());
    }

    let again = service.recover(Utc::now(), stale_after).await.unwrap();
    assert_eq!(again.callbacks_redelivered, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_job_never_fires_its_callback() {
    let (service, _store) = memory_service();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let id = service
        .create_and_add_job(
            JobRequest::builder()
                .job_type(JobType::MetadataExtraction)
                .callback(callback_fn(move |_queue: JobQueueService, _event: CallbackEvent| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .build(),
        )
        .await
        .unwrap();
    assert!(service.cancel_job(id).await.unwrap());

    let pool = start_pool(&service, ok_registry(), fast_pool_config(1));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    pool.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.get_job(id).await.unwrap().status, JobStatus::Cancelled);
}
