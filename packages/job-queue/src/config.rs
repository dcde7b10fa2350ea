use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::jobs::{RetryConfig, WorkerPoolConfig};
use crate::kernel::scheduler::SchedulerConfig;

/// Queue configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub worker: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = WorkerPoolConfig::default();
        let worker = WorkerPoolConfig {
            max_concurrent_workers: env_or("WORKER_MAX_CONCURRENT_JOBS", 4)?,
            min_poll_interval: Duration::from_millis(env_or("WORKER_MIN_POLL_INTERVAL_MS", 100)?),
            max_poll_interval: Duration::from_millis(env_or("WORKER_MAX_POLL_INTERVAL_MS", 5000)?),
            default_timeout: secs("WORKER_DEFAULT_TIMEOUT_SECS", 3600)?,
            drain_timeout: secs("WORKER_DRAIN_TIMEOUT_SECS", 30)?,
            heartbeat_interval: secs("WORKER_HEARTBEAT_INTERVAL_SECS", 30)?,
            stale_after: secs("WORKER_STALE_AFTER_SECS", 300)?,
            stale_sweep_interval: secs("WORKER_STALE_SWEEP_INTERVAL_SECS", 60)?,
            worker_id: env::var("WORKER_ID").unwrap_or(defaults.worker_id),
        };
        if worker.max_concurrent_workers == 0 {
            anyhow::bail!("WORKER_MAX_CONCURRENT_JOBS must be at least 1");
        }

        let retry = RetryConfig {
            base_delay: secs("RETRY_BASE_DELAY_SECS", 30)?,
            max_delay: secs("RETRY_MAX_DELAY_SECS", 3600)?,
            jitter_ratio: env_or("RETRY_JITTER_RATIO", 0.2)?,
        };
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            anyhow::bail!("RETRY_JITTER_RATIO must be between 0 and 1");
        }

        let scheduler = SchedulerConfig {
            enabled: env_or("SCHEDULER_ENABLED", true)?,
            tick_interval: secs("SCHEDULER_TICK_SECS", 30)?,
            lease_ttl: secs("SCHEDULER_LEASE_TTL_SECS", 90)?,
            ..Default::default()
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
            worker,
            retry,
            scheduler,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    env_or(name, default).map(Duration::from_secs)
}
