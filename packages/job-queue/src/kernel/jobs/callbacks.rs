//! Completion callbacks used for job chaining.
//!
//! Two kinds of callbacks exist:
//! - process-local callbacks registered for one job id, lost on restart
//! - named callbacks registered once at startup and referenced from a job row
//!   (`callback_name` + `callback_params`), which survive restarts
//!
//! A callback body typically calls [`JobQueueService::create_and_add_job`]
//! one or more times. Errors and panics inside a callback are logged and
//! contained; they never reach the worker slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobId};
use crate::error::Result;
use crate::service::JobQueueService;

/// What a callback learns about the job that resolved.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub job: Job,
    pub success: bool,
    pub error: Option<String>,
    /// `callback_params` of a named callback; `None` for process-local ones.
    pub params: Option<serde_json::Value>,
}

#[async_trait]
pub trait JobCallback: Send + Sync {
    async fn call(&self, queue: JobQueueService, event: CallbackEvent) -> anyhow::Result<()>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> JobCallback for FnCallback<F>
where
    F: Fn(JobQueueService, CallbackEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, queue: JobQueueService, event: CallbackEvent) -> anyhow::Result<()> {
        (self.0)(queue, event).await
    }
}

/// Wrap an async closure as a callback.
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn JobCallback>
where
    F: Fn(JobQueueService, CallbackEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

#[derive(Default)]
pub struct CallbackDispatcher {
    local: RwLock<HashMap<JobId, Arc<dyn JobCallback>>>,
    named: StdRwLock<HashMap<String, Arc<dyn JobCallback>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a process-local callback to `job_id`.
    pub async fn register(&self, job_id: JobId, callback: Arc<dyn JobCallback>) {
        self.local.write().await.insert(job_id, callback);
    }

    /// Register a callback that job rows can reference by name.
    pub fn register_named(&self, name: impl Into<String>, callback: Arc<dyn JobCallback>) {
        self.named
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), callback);
    }

    pub fn has_named(&self, name: &str) -> bool {
        self.named
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    fn named(&self, name: &str) -> Option<Arc<dyn JobCallback>> {
        self.named
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Drop a job's process-local callback without firing it.
    pub async fn discard(&self, job_id: JobId) -> bool {
        self.local.write().await.remove(&job_id).is_some()
    }

    pub async fn pending_local(&self) -> usize {
        self.local.read().await.len()
    }

    /// Run `insert` and register `callback` for the id it returns, holding the
    /// registration lock throughout so a resolution cannot slip in between.
    pub(crate) async fn register_during<Fut>(
        &self,
        callback: Arc<dyn JobCallback>,
        insert: Fut,
    ) -> Result<JobId>
    where
        Fut: Future<Output = Result<JobId>>,
    {
        let mut local = self.local.write().await;
        let job_id = insert.await?;
        local.insert(job_id, callback);
        Ok(job_id)
    }

    /// Fire the callbacks attached to a resolved job.
    pub async fn fire(
        &self,
        queue: &JobQueueService,
        job: &Job,
        success: bool,
        error: Option<String>,
    ) {
        let job = match queue.store().get(job.id).await {
            Ok(Some(current)) => current,
            _ => job.clone(),
        };

        let local = self.local.write().await.remove(&job.id);
        if let Some(callback) = local {
            let event = CallbackEvent {
                job: job.clone(),
                success,
                error: error.clone(),
                params: None,
            };
            invoke(callback, queue.clone(), event).await;
        }

        self.fire_named(queue, &job, success, error).await;
    }

    /// Returns whether a named callback ran to completion.
    async fn fire_named(
        &self,
        queue: &JobQueueService,
        job: &Job,
        success: bool,
        error: Option<String>,
    ) -> bool {
        let Some(reference) = job.callback_ref() else {
            return false;
        };
        let Some(callback) = self.named(&reference.name) else {
            warn!(
                job_id = job.id,
                callback = %reference.name,
                "no callback registered under this name; leaving undelivered"
            );
            return false;
        };

        let event = CallbackEvent {
            job: job.clone(),
            success,
            error,
            params: reference.params,
        };
        if !invoke(callback, queue.clone(), event).await {
            return false;
        }

        if let Err(e) = queue.store().mark_callback_fired(job.id, Utc::now()).await {
            error!(job_id = job.id, error = %e, "failed to record callback delivery");
        }
        true
    }

    /// Redeliver named callbacks of completed jobs that never recorded delivery.
    ///
    /// A job that already has children is assumed to have fired before the
    /// restart and is only marked delivered. Returns how many callbacks ran.
    pub async fn redeliver(&self, queue: &JobQueueService, limit: i64) -> Result<usize> {
        let store = queue.store();
        let mut delivered = 0;

        for job in store.find_undelivered_callbacks(limit).await? {
            if store.count_children(job.id).await? > 0 {
                debug!(job_id = job.id, "callback already produced children; marking delivered");
                store.mark_callback_fired(job.id, Utc::now()).await?;
                continue;
            }

            if self.fire_named(queue, &job, true, None).await {
                delivered += 1;
            }
        }

        if delivered > 0 {
            info!(count = delivered, "redelivered durable callbacks");
        }
        Ok(delivered)
    }
}

/// Run a callback in its own task so a panic is contained. Returns whether it succeeded.
async fn invoke(callback: Arc<dyn JobCallback>, queue: JobQueueService, event: CallbackEvent) -> bool {
    let job_id = event.job.id;
    let handle = tokio::spawn(async move { callback.call(queue, event).await });

    match handle.await {
        Ok(Ok(())) => {
            debug!(job_id, "callback completed");
            true
        }
        Ok(Err(e)) => {
            error!(job_id, error = ?e, "callback failed");
            false
        }
        Err(e) => {
            error!(job_id, error = %e, "callback panicked");
            false
        }
    }
}
