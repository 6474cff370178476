use tracing::{debug, error, info, warn};

use crate::client::ConnectionCheck;
use crate::runner::Runner;
use crate::scheduler::Scheduler;

/// Periodically ask the runner to verify the client connection.
pub async fn register_heartbeat(
    scheduler: &Scheduler,
    runner: Runner,
    cron_expr: &str,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(cron_expr, "heartbeat", move || {
            let runner = runner.clone();
            Box::pin(async move { heartbeat(&runner).await })
        })
        .await
}

pub async fn heartbeat(runner: &Runner) {
    match runner.heartbeat().await {
        Ok(ConnectionCheck::Idle) => debug!("Heartbeat: no client yet"),
        Ok(ConnectionCheck::Healthy) => debug!("Heartbeat: client connected"),
        Ok(ConnectionCheck::Reconnected) => info!("Heartbeat: client was down, reconnected"),
        Ok(ConnectionCheck::Failed(reason)) => warn!("Heartbeat: reconnect failed: {}", reason),
        Err(e) => error!("Heartbeat: {}", e),
    }
}
