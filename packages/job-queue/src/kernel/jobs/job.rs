//! Job model for durable background work.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::retry::classify_error;

/// Surrogate key of a job row (monotonic, assigned by the store).
pub type JobId = i64;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Terminal states carry `completed_at` and never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Variant order is significant: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of work the queue knows how to route to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    MetadataExtraction,
    SingleVideoDownload,
    SingleVideoMetadataExtraction,
    QuickSync,
    ChannelSync,
    Maintenance,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::MetadataExtraction,
        JobType::SingleVideoDownload,
        JobType::SingleVideoMetadataExtraction,
        JobType::QuickSync,
        JobType::ChannelSync,
        JobType::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::MetadataExtraction => "METADATA_EXTRACTION",
            JobType::SingleVideoDownload => "SINGLE_VIDEO_DOWNLOAD",
            JobType::SingleVideoMetadataExtraction => "SINGLE_VIDEO_METADATA_EXTRACTION",
            JobType::QuickSync => "QUICK_SYNC",
            JobType::ChannelSync => "CHANNEL_SYNC",
            JobType::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job type: {s}"))
    }
}

/// Classification of a failed attempt, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "failure_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Network/IO error, safe to retry as-is
    Transient,
    /// Target in use, retry after a delay
    ResourceLocked,
    /// Bad payload, never retried
    Validation,
    /// Handler exceeded its time budget
    Timeout,
    /// Uncaught error, retried conservatively
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Transient => "transient",
            FailureType::ResourceLocked => "resource_locked",
            FailureType::Validation => "validation",
            FailureType::Timeout => "timeout",
            FailureType::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureType::Validation)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Failure + callback references
// ============================================================================

/// Everything recorded about one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub failure_type: FailureType,
    pub message: String,
    pub traceback: Option<String>,
}

impl JobFailure {
    pub fn new(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            message: message.into(),
            traceback: None,
        }
    }

    /// Classify a handler error and capture its full cause chain.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self {
            failure_type: classify_error(error),
            message: error.to_string(),
            traceback: Some(format!("{error:?}")),
        }
    }
}

/// Durable reference to a named callback, stored on the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRef {
    pub name: String,
    pub params: Option<serde_json::Value>,
}

impl CallbackRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    pub fn with_params(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params: Some(params),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    // Retry state
    pub retry_count: i32,
    pub max_retries: i32,
    pub failure_type: Option<FailureType>,
    pub last_error_message: Option<String>,
    pub last_error_traceback: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,

    // Dead letter
    pub dead_letter_reason: Option<String>,
    pub moved_to_dead_letter_at: Option<DateTime<Utc>>,

    // Execution
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub timeout_seconds: Option<i32>,
    pub progress: Option<f32>,
    pub progress_message: Option<String>,

    // Chaining
    pub parent_job_id: Option<JobId>,
    pub callback_name: Option<String>,
    pub callback_params: Option<serde_json::Value>,
    pub callback_fired_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a freshly inserted row (used by the in-memory store).
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        let (callback_name, callback_params) = match new.callback {
            Some(callback) => (Some(callback.name), callback.params),
            None => (None, None),
        };

        Self {
            id,
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            priority: new.priority,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            retry_count: 0,
            max_retries: new.max_retries,
            failure_type: None,
            last_error_message: None,
            last_error_traceback: None,
            next_retry_at: None,
            dead_letter_reason: None,
            moved_to_dead_letter_at: None,
            worker_id: None,
            heartbeat_at: None,
            cancel_requested: false,
            timeout_seconds: new.timeout_seconds,
            progress: None,
            progress_message: None,
            parent_job_id: new.parent_job_id,
            callback_name,
            callback_params,
            callback_fired_at: None,
        }
    }

    /// Whether `claim_next` may pick this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Retrying => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    /// 1-based attempt number of the current (or next) execution.
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }

    /// Per-job timeout, falling back to the pool default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(default)
    }

    pub fn callback_ref(&self) -> Option<CallbackRef> {
        self.callback_name.as_ref().map(|name| CallbackRef {
            name: name.clone(),
            params: self.callback_params.clone(),
        })
    }
}

/// Insert parameters for a new pending job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub job_type: JobType,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub payload: serde_json::Value,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub timeout_seconds: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<JobId>,
    #[builder(default, setter(strip_option))]
    pub callback: Option<CallbackRef>,
}

/// Filter for listing jobs. Results are ordered newest first.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct JobFilter {
    #[builder(setter(strip_option))]
    pub status: Option<JobStatus>,
    #[builder(setter(strip_option))]
    pub job_type: Option<JobType>,
    #[builder(setter(strip_option))]
    pub parent_job_id: Option<JobId>,
    #[builder(default = 50)]
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| s == job.status)
            && self.job_type.map_or(true, |t| t == job.job_type)
            && self
                .parent_job_id
                .map_or(true, |p| job.parent_job_id == Some(p))
    }
}

/// Compact row for operational listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub retry_count: i32,
    pub failure_type: Option<FailureType>,
    pub parent_job_id: Option<JobId>,
    pub progress: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            retry_count: job.retry_count,
            failure_type: job.failure_type,
            parent_job_id: job.parent_job_id,
            progress: job.progress,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            next_retry_at: job.next_retry_at,
        }
    }
}

/// Status answer returned to collaborators polling a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub failure_type: Option<FailureType>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub progress: Option<f32>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            failure_type: job.failure_type,
            error_message: job.last_error_message.clone(),
            next_retry_at: job.next_retry_at,
            dead_letter_reason: job.dead_letter_reason.clone(),
            progress: job.progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let new = NewJob::builder()
            .job_type(JobType::SingleVideoDownload)
            .build();
        Job::from_new(1, new, Utc::now())
    }

    #[test]
    fn new_job_has_default_max_retries_of_3() {
        let job = sample_job();
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn new_job_starts_pending_with_no_retries() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.attempt(), 1);
    }

    #[test]
    fn new_job_has_normal_priority_by_default() {
        let job = sample_job();
        assert_eq!(job.priority, JobPriority::Normal);
    }

    #[test]
    fn priority_ordering_is_low_normal_high() {
        assert!(JobPriority::Low < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::High);
    }

    #[test]
    fn retrying_job_is_gated_by_next_retry_at() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Retrying;
        job.next_retry_at = Some(now + chrono::Duration::seconds(30));

        assert!(!job.is_eligible(now));
        assert!(!job.is_eligible(now + chrono::Duration::seconds(29)));
        assert!(job.is_eligible(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn running_job_is_not_eligible() {
        let mut job = sample_job();
        job.status = JobStatus::Running;
        assert!(!job.is_eligible(Utc::now()));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn timeout_override_wins_over_default() {
        let mut job = sample_job();
        let default = Duration::from_secs(60);
        assert_eq!(job.timeout(default), default);

        job.timeout_seconds = Some(5);
        assert_eq!(job.timeout(default), Duration::from_secs(5));
    }

    #[test]
    fn job_type_parses_case_insensitively() {
        assert_eq!(
            "quick_sync".parse::<JobType>().unwrap(),
            JobType::QuickSync
        );
        assert!("no_such_type".parse::<JobType>().is_err());
    }

    #[test]
    fn callback_ref_is_carried_onto_the_row() {
        let new = NewJob::builder()
            .job_type(JobType::MetadataExtraction)
            .callback(CallbackRef::with_params(
                "spawn_downloads",
                serde_json::json!({"format": "best"}),
            ))
            .build();
        let job = Job::from_new(9, new, Utc::now());

        let callback = job.callback_ref().unwrap();
        assert_eq!(callback.name, "spawn_downloads");
        assert_eq!(callback.params, Some(serde_json::json!({"format": "best"})));
    }

    #[test]
    fn filter_matches_on_all_set_fields() {
        let job = sample_job();
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::builder()
            .status(JobStatus::Pending)
            .job_type(JobType::SingleVideoDownload)
            .build()
            .matches(&job));
        assert!(!JobFilter::builder()
            .status(JobStatus::Running)
            .build()
            .matches(&job));
        assert!(!JobFilter::builder().parent_job_id(3).build().matches(&job));
    }
}
