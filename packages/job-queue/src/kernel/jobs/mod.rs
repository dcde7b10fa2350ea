//! Job infrastructure for durable background work.
//!
//! This module provides the kernel-level pieces of the queue:
//! - [`JobStore`] - Storage trait, with [`PostgresJobStore`] and [`MemoryJobStore`]
//! - [`RetryPolicy`] - Decides retry, dead letter or permanent failure
//! - [`WorkerPool`] - Long-running service that claims and executes jobs
//! - [`CallbackDispatcher`] - Completion callbacks used for job chaining
//! - [`Job`] - Job model and its lifecycle enums
//!
//! # Architecture
//!
//! ```text
//! Collaborator calls queue.create_and_add_job(request)
//!     │
//!     └─► JobStore.enqueue()  (row is durable before returning)
//!
//! WorkerPool
//!     │
//!     ├─► Claim next eligible job (FOR UPDATE SKIP LOCKED)
//!     ├─► JobRegistry lookup by job_type
//!     │       └─► JobHandler.execute(payload, JobContext)
//!     ├─► Mark completed / retrying / dead_letter / failed / cancelled
//!     └─► CallbackDispatcher.fire(job)
//!             └─► callback may enqueue child jobs
//! ```
//!
//! Handlers for concrete job types live with their callers. This module only
//! provides the infrastructure.

mod callbacks;
pub mod events;
mod job;
mod memory_store;
mod postgres_store;
mod registry;
mod retry;
mod store;
mod worker;

pub use callbacks::{callback_fn, CallbackDispatcher, CallbackEvent, JobCallback};
pub use events::{JobEvent, JobEvents};
pub use job::{
    CallbackRef, FailureType, Job, JobFailure, JobFilter, JobId, JobPriority, JobStatus,
    JobStatusView, JobSummary, JobType, NewJob, DEFAULT_MAX_RETRIES,
};
pub use memory_store::MemoryJobStore;
pub use postgres_store::PostgresJobStore;
pub use registry::{JobContext, JobHandler, JobRegistry, SharedJobRegistry};
pub use retry::{classify_error, RetryConfig, RetryDecision, RetryPolicy};
pub use store::{JobStore, ScheduledTaskStore};
pub use worker::{RunningJobs, ShutdownReport, WorkerPool, WorkerPoolConfig};
