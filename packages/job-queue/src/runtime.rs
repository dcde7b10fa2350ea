//! Process wiring for applications that embed the queue.
//!
//! ```ignore
//! job_queue::runtime::init_tracing();
//! let runtime = JobQueueRuntime::connect(Config::from_env()?).await?;
//!
//! let mut registry = JobRegistry::new();
//! registry.register_fn(JobType::ChannelSync, sync_channel);
//!
//! runtime.run(registry).await?;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::kernel::jobs::{JobRegistry, PostgresJobStore, RetryPolicy, WorkerPool};
use crate::kernel::scheduler::{NewScheduledTask, RecurringScheduler, ScheduledTask};
use crate::kernel::service_host::ServiceHost;
use crate::service::JobQueueService;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
///
/// Calling this more than once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,job_queue=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .try_init();
}

/// A connected queue: Postgres store, service facade and the config to run it with.
pub struct JobQueueRuntime {
    config: Config,
    store: Arc<PostgresJobStore>,
    service: JobQueueService,
}

impl JobQueueRuntime {
    /// Connect to the database and apply migrations.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Arc::new(PostgresJobStore::new(pool));
        store
            .migrate()
            .await
            .context("Failed to run job queue migrations")?;

        let service = JobQueueService::new(store.clone());
        info!(
            max_connections = config.database_max_connections,
            "job queue connected"
        );

        Ok(Self {
            config,
            store,
            service,
        })
    }

    /// Handle for submitting and inspecting jobs. Register durable callbacks on it before `run`.
    pub fn service(&self) -> &JobQueueService {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> RecurringScheduler {
        RecurringScheduler::with_config(
            self.store.clone(),
            self.service.clone(),
            self.config.scheduler.clone(),
        )
    }

    pub async fn register_scheduled_task(&self, task: NewScheduledTask) -> Result<ScheduledTask> {
        let name = task.name.clone();
        self.scheduler()
            .register_task(task)
            .await
            .with_context(|| format!("Failed to register scheduled task {name}"))
    }

    /// Host the worker pool (and scheduler, if enabled) until ctrl-c.
    pub async fn run(self, registry: JobRegistry) -> Result<()> {
        let pool = WorkerPool::with_config(
            self.service.clone(),
            Arc::new(registry),
            self.config.worker.clone(),
            RetryPolicy::new(self.config.retry.clone()),
        );

        let mut host = ServiceHost::new().with_service(pool);
        if self.config.scheduler.enabled {
            host = host.with_service(self.scheduler());
        } else {
            info!("recurring scheduler disabled");
        }

        host.run_until_shutdown().await
    }
}
