//! Job registry mapping job types to handlers.
//!
//! Each collaborator registers its handlers at startup. When the worker pool
//! claims a job it looks up the handler for the job's type and hands it the
//! raw payload plus a [`JobContext`].

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::job::{Job, JobId, JobType};
use super::store::JobStore;
use crate::error::JobError;

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: serde_json::Value, ctx: JobContext) -> anyhow::Result<()>;
}

/// Per-execution handle given to a handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based attempt number
    pub attempt: i32,
    pub parent_job_id: Option<JobId>,
    /// Cancelled on timeout, cancellation request or shutdown. Check at safe points.
    pub cancel: CancellationToken,
    progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(job: &Job, cancel: CancellationToken, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            attempt: job.attempt(),
            parent_job_id: job.parent_job_id,
            cancel,
            progress: ProgressReporter {
                job_id: job.id,
                store,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record progress (0-100). Failures are logged, never returned to the handler.
    pub async fn report_progress(&self, percent: f32, message: Option<&str>) {
        self.progress.report(percent, message).await;
    }
}

#[derive(Clone)]
struct ProgressReporter {
    job_id: JobId,
    store: Arc<dyn JobStore>,
}

impl ProgressReporter {
    async fn report(&self, percent: f32, message: Option<&str>) {
        if let Err(e) = self.store.update_progress(self.job_id, percent, message).await {
            warn!(job_id = self.job_id, error = %e, "failed to record progress");
        }
    }
}

/// Adapts a typed async function into a [`JobHandler`].
struct FnHandler<P, F> {
    job_type: JobType,
    handler: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for FnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, payload: serde_json::Value, ctx: JobContext) -> anyhow::Result<()> {
        let payload: P = serde_json::from_value(payload).map_err(|e| {
            JobError::Validation(format!("invalid {} payload: {e}", self.job_type))
        })?;
        (self.handler)(payload, ctx).await
    }
}

/// Registry that maps job types to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register_fn(JobType::SingleVideoDownload, |job: DownloadPayload, ctx| async move {
///     downloader.fetch(&job.url, &ctx).await
/// });
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    /// Register an async function taking the deserialized payload.
    ///
    /// Payloads that fail to deserialize are reported as validation failures.
    pub fn register_fn<P, F, Fut>(&mut self, job_type: JobType, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(
            job_type,
            Arc::new(FnHandler {
                job_type,
                handler,
                _payload: PhantomData,
            }),
        )
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;
