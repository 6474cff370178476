pub mod tasks;

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cron-driven background jobs.
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Run `task` on every tick of the six-field cron expression.
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                debug!("Running scheduled task: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Invalid cron expression for {}: {}", name, cron_expr))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
