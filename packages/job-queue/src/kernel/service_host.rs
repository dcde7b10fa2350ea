//! Lifecycle host for long-running background services.
//!
//! ```ignore
//! ServiceHost::new()
//!     .with_service(worker_pool)
//!     .with_service(scheduler)
//!     .run_until_shutdown()
//!     .await?;
//! ```
//!
//! All services share one cancellation token. The host cancels it when the
//! shutdown signal arrives or when any service exits, then waits for the rest.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A background service that runs until its shutdown token is cancelled.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token that stops every hosted service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until ctrl-c.
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Run all services until `signal` resolves. Returns the first service error.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown;
        let mut set = JoinSet::new();

        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "starting service");
            set.spawn(async move { (name, service.run(token).await) });
        }

        tokio::select! {
            _ = signal => info!("shutdown signal received"),
            _ = shutdown.cancelled() => {}
            Some(joined) = set.join_next() => {
                shutdown.cancel();
                let first = report(joined);
                let rest = drain(&mut set).await;
                return first.and(rest);
            }
        }

        shutdown.cancel();
        drain(&mut set).await
    }
}

async fn drain(set: &mut JoinSet<(&'static str, Result<()>)>) -> Result<()> {
    let mut outcome = Ok(());
    while let Some(joined) = set.join_next().await {
        let result = report(joined);
        if outcome.is_ok() {
            outcome = result;
        }
    }
    outcome
}

fn report(joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(service = name, "service stopped");
            Ok(())
        }
        Ok((name, Err(e))) => {
            error!(service = name, error = ?e, "service failed");
            Err(e.context(format!("service {name} failed")))
        }
        Err(e) => {
            error!(error = %e, "service task panicked");
            Err(anyhow::anyhow!("service task panicked: {e}"))
        }
    }
}
