use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, Lifecycle};
use crate::error::ServiceError;
use crate::platform::{ChatClient, Connector, PlatformError};

/// Result of a connection check triggered by the heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCheck {
    /// No client has been created yet
    Idle,
    Healthy,
    Reconnected,
    Failed(String),
}

/// Owns the one client handle of the process. Creation is lazy; the handle is
/// reused until it reports disconnected, at which point it is rebuilt.
///
/// The manager lives inside the runner task, so `&mut self` is the lock.
pub struct ClientManager {
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    lifecycle: Lifecycle,
    /// Upper bound on waiting for a client to shut down
    disconnect_timeout: Duration,
    client: Option<Arc<dyn ChatClient>>,
}

impl ClientManager {
    pub fn new(connector: Arc<dyn Connector>, config: Arc<Config>) -> Self {
        let lifecycle = config.parser.lifecycle;
        let disconnect_timeout = config.parser.fetch_timeout();
        Self {
            connector,
            config,
            lifecycle,
            disconnect_timeout,
            client: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    /// Hand out a connected client, creating or rebuilding it as needed.
    pub async fn ensure_connected(&mut self) -> Result<Arc<dyn ChatClient>, ServiceError> {
        if let Some(client) = &self.client {
            if client.is_connected() {
                return Ok(client.clone());
            }
            info!("Client reports disconnected, reconnecting");
            self.disconnect().await;
        }

        let credentials = self.config.credentials()?;
        let client = self
            .connector
            .connect(&credentials)
            .await
            .map_err(connect_error)?;

        info!("Connected to messaging platform");
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Apply the lifecycle policy once a job is finished with the client.
    pub async fn release(&mut self) {
        if self.lifecycle == Lifecycle::PerRequest {
            self.disconnect().await;
        }
    }

    /// Throw the client away, e.g. after a timeout left it in an unknown state.
    pub async fn reset(&mut self) {
        warn!("Discarding client handle");
        self.disconnect().await;
    }

    pub async fn check_connection(&mut self) -> ConnectionCheck {
        if !self.is_initialized() {
            return ConnectionCheck::Idle;
        }
        if self.client.as_ref().is_some_and(|client| client.is_connected()) {
            return ConnectionCheck::Healthy;
        }

        match self.ensure_connected().await {
            Ok(_) => ConnectionCheck::Reconnected,
            Err(e) => ConnectionCheck::Failed(e.to_string()),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            match tokio::time::timeout(self.disconnect_timeout, client.disconnect()).await {
                Ok(()) => info!("Disconnected from messaging platform"),
                Err(_) => warn!(
                    "Client did not shut down within {:?}, dropping it",
                    self.disconnect_timeout
                ),
            }
        }
    }
}

fn connect_error(err: PlatformError) -> ServiceError {
    match err {
        PlatformError::Unauthorized(msg) => ServiceError::Authorization(msg),
        other => ServiceError::Connect(other.to_string()),
    }
}
