//! Retry policy: failure classification and backoff decisions.
//!
//! Everything here is side-effect free. The worker pool applies the
//! resulting [`RetryDecision`] through the job store.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::job::{FailureType, Job, JobFailure};
use crate::error::JobError;

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any computed delay (before jitter)
    pub max_delay: Duration,
    /// Up to this fraction of the delay is added as random jitter
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_ratio: 0.2,
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-queue the job once `delay` has elapsed.
    Retry { delay: Duration },
    /// Quarantine the job for manual inspection.
    DeadLetter { reason: String },
    /// Terminal failure for a job that opted out of retries.
    PermanentFailure,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what happens to `job` after `failure`, using thread-local randomness for jitter.
    pub fn decide(&self, job: &Job, failure: &JobFailure) -> RetryDecision {
        self.decide_with_rng(job, failure, &mut rand::thread_rng())
    }

    /// `job` is the snapshot taken at claim time, so `job.failure_type` is the
    /// classification of the previous attempt.
    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        job: &Job,
        failure: &JobFailure,
        rng: &mut R,
    ) -> RetryDecision {
        let failure_type = failure.failure_type;

        if !failure_type.is_retryable() {
            return RetryDecision::DeadLetter {
                reason: format!("non-retryable {failure_type} failure: {}", failure.message),
            };
        }

        if failure_type == FailureType::Timeout
            && job.retry_count > 0
            && job.failure_type == Some(FailureType::Timeout)
        {
            return RetryDecision::DeadLetter {
                reason: format!("repeated timeout after {} attempts", job.attempt()),
            };
        }

        if job.max_retries == 0 {
            return RetryDecision::PermanentFailure;
        }

        if job.retry_count >= job.max_retries {
            return RetryDecision::DeadLetter {
                reason: format!(
                    "max retries exceeded ({}): {}",
                    job.max_retries, failure.message
                ),
            };
        }

        let delay = self.backoff_delay(job.retry_count, failure_type);
        RetryDecision::Retry {
            delay: self.with_jitter(delay, rng),
        }
    }

    /// `min(base * 2^retry_count, max_delay)`; unknown failures back off one step further.
    pub fn backoff_delay(&self, retry_count: i32, failure_type: FailureType) -> Duration {
        let mut exponent = retry_count.clamp(0, 30) as u32;
        if failure_type == FailureType::Unknown {
            exponent += 1;
        }

        self.config
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.max_delay)
    }

    fn with_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }

        let max_extra = delay.as_secs_f64() * ratio;
        delay + Duration::from_secs_f64(rng.gen_range(0.0..=max_extra))
    }
}

/// Classify an error to determine retry behavior.
///
/// A [`JobError`] anywhere in the chain decides outright; otherwise well-known
/// error types and finally message heuristics are used.
pub fn classify_error(error: &anyhow::Error) -> FailureType {
    for cause in error.chain() {
        if let Some(job_error) = cause.downcast_ref::<JobError>() {
            return job_error.failure_type();
        }
    }

    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::Interrupted
                | ErrorKind::UnexpectedEof => return FailureType::Transient,
                ErrorKind::TimedOut => return FailureType::Timeout,
                ErrorKind::WouldBlock | ErrorKind::PermissionDenied => {
                    return FailureType::ResourceLocked
                }
                _ => {}
            }
        }

        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return FailureType::Validation;
        }
    }

    let message = error.to_string().to_lowercase();

    if ["locked", "in use", "busy"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        return FailureType::ResourceLocked;
    }

    if ["invalid", "not found", "deserialize", "parse", "unsupported"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        return FailureType::Validation;
    }

    if message.contains("timed out") || message.contains("timeout") {
        return FailureType::Timeout;
    }

    if ["connection", "network", "temporarily", "unavailable"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        return FailureType::Transient;
    }

    FailureType::Unknown
}
