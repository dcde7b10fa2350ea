//! Test fixtures for building queues and running worker pools.

use std::sync::Arc;
use std::time::Duration;

use job_queue::kernel::jobs::ShutdownReport;
use job_queue::{
    Job, JobQueueService, JobRegistry, JobStatus, MemoryJobStore, RetryConfig, RetryPolicy,
    WorkerPool, WorkerPoolConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Service over a fresh in-memory store.
pub fn memory_service() -> (JobQueueService, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    (JobQueueService::new(store.clone()), store)
}

/// Worker config with short poll and heartbeat intervals.
pub fn fast_pool_config(slots: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        max_concurrent_workers: slots,
        min_poll_interval: Duration::from_millis(10),
        max_poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(2),
        ..WorkerPoolConfig::with_worker_id("test-worker")
    }
}

/// Retry policy with zero backoff, so retries are claimable immediately.
pub fn immediate_retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_ratio: 0.0,
    })
}

/// A running pool plus the handle to stop it.
pub struct RunningPool {
    pub shutdown: CancellationToken,
    handle: JoinHandle<ShutdownReport>,
}

impl RunningPool {
    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.cancel();
        self.handle.await.expect("worker pool task panicked")
    }
}

pub fn start_pool(
    service: &JobQueueService,
    registry: JobRegistry,
    config: WorkerPoolConfig,
) -> RunningPool {
    let pool = WorkerPool::with_config(
        service.clone(),
        Arc::new(registry),
        config,
        immediate_retry(),
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool.run_until(shutdown.clone()));
    RunningPool { shutdown, handle }
}

/// Poll until the job satisfies `done`, panicking after `timeout`.
pub async fn wait_for(
    service: &JobQueueService,
    job_id: i64,
    timeout: Duration,
    done: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = service.get_job(job_id).await.expect("job should exist");
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not settle in time; last status {}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a job to reach a terminal status.
pub async fn wait_terminal(service: &JobQueueService, job_id: i64) -> Job {
    wait_for(service, job_id, Duration::from_secs(5), |job| {
        job.status.is_terminal()
    })
    .await
}

pub async fn wait_status(service: &JobQueueService, job_id: i64, status: JobStatus) -> Job {
    wait_for(service, job_id, Duration::from_secs(5), |job| job.status == status).await
}
