// Job Queue - durable background work for the sync pipeline
//
// This crate persists jobs in PostgreSQL, dispatches them by priority to a
// bounded worker pool, retries failures with classified backoff, quarantines
// unrecoverable jobs in a dead-letter state and materializes recurring tasks.
//
// Job chaining happens through completion callbacks; see kernel/jobs/callbacks.rs.

pub mod config;
pub mod error;
pub mod kernel;
pub mod runtime;
pub mod service;

pub use config::Config;
pub use error::{JobError, QueueError, Result};
pub use kernel::jobs::{
    callback_fn, CallbackEvent, CallbackRef, FailureType, Job, JobCallback, JobContext, JobEvent,
    JobFilter, JobHandler, JobId, JobPriority, JobRegistry, JobStatus, JobStatusView, JobStore,
    JobSummary, JobType, MemoryJobStore, PostgresJobStore, RetryConfig, RetryPolicy, WorkerPool,
    WorkerPoolConfig,
};
pub use kernel::scheduler::{
    NewScheduledTask, RecurringScheduler, Schedule, ScheduledTask, SchedulerConfig,
};
pub use runtime::JobQueueRuntime;
pub use service::{JobQueueService, JobRequest, RecoveryReport};
