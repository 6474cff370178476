mod client;
mod config;
mod error;
mod fetcher;
mod platform;
mod runner;
mod scheduler;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::ClientManager;
use crate::config::Config;
use crate::platform::telegram::UserConnector;
use crate::runner::{Runner, RunnerSettings};
use crate::scheduler::Scheduler;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telegram_parser=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let presence = config.presence();
    info!("Configuration loaded successfully");
    info!("  Listen: {}:{}", config.server.host, config.server.port);
    info!(
        "  Order: {}, lifecycle: {}, timeout: {}s",
        config.parser.order, config.parser.lifecycle, config.parser.fetch_timeout_secs
    );
    info!(
        "  Credentials present: api_id={} api_hash={} session={} phone={}",
        presence.api_id, presence.api_hash, presence.session, presence.phone
    );
    if let Err(e) = config.credentials() {
        error!("{} Parse requests will fail until this is fixed.", e);
    }

    let config = Arc::new(config);
    let connector = Arc::new(UserConnector::new());
    let manager = ClientManager::new(connector, config.clone());
    let runner = Runner::spawn(manager, RunnerSettings::from(&config.parser));

    let mut scheduler = if config.heartbeat.enabled {
        let scheduler = Scheduler::new().await?;
        scheduler::tasks::register_heartbeat(&scheduler, runner.clone(), &config.heartbeat.cron)
            .await?;
        scheduler.start().await?;
        Some(scheduler)
    } else {
        None
    };

    let app = server::router(AppState {
        runner,
        config: config.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Telegram Parser listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await?;
    }

    Ok(())
}
