pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

/// How the client proves who it is.
#[derive(Clone, PartialEq)]
pub enum Login {
    /// A persisted session token from an earlier login
    Session(String),
    /// Phone number for an interactive login
    Phone(String),
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub api_id: i32,
    pub api_hash: String,
    pub login: Login,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Login::Session(_) => write!(f, "Session(..)"),
            Login::Phone(_) => write!(f, "Phone(..)"),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

/// Errors reported by the messaging platform client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlatformError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u32 },
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

/// A chat the platform resolved for us.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: i64,
    pub title: Option<String>,
}

/// What to iterate: a resolved peer, or the caller's reference verbatim when
/// resolution failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Resolved(Peer),
    Raw(String),
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Sender {
    Person {
        first_name: String,
        last_name: Option<String>,
        username: Option<String>,
    },
    /// Groups and broadcast channels
    Titled { title: String },
    Unresolved,
}

impl Sender {
    pub fn display_name(&self) -> String {
        match self {
            Sender::Person {
                first_name,
                last_name,
                username,
            } => {
                let mut parts: Vec<String> = Vec::new();
                if !first_name.is_empty() {
                    parts.push(first_name.clone());
                }
                if let Some(last) = last_name.as_deref().filter(|s| !s.is_empty()) {
                    parts.push(last.to_string());
                }
                if let Some(user) = username.as_deref().filter(|s| !s.is_empty()) {
                    parts.push(format!("(@{user})"));
                }
                if parts.is_empty() {
                    "Unknown".to_string()
                } else {
                    parts.join(" ")
                }
            }
            Sender::Titled { title } if !title.is_empty() => title.clone(),
            Sender::Titled { .. } | Sender::Unresolved => "Unknown".to_string(),
        }
    }
}

/// A message as the platform hands it to us.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub sender: Sender,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    /// Media kind, e.g. "photo"; `None` for plain text
    pub media: Option<String>,
}

/// The authenticated account behind a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub username: Option<String>,
}

/// A live connection to the messaging platform.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    async fn get_me(&self) -> Result<Identity, PlatformError>;

    async fn resolve(&self, reference: &str) -> Result<Peer, PlatformError>;

    /// Up to `limit` messages, newest first.
    fn messages<'a>(
        &'a self,
        target: &'a Target,
        limit: usize,
    ) -> BoxStream<'a, Result<RawMessage, PlatformError>>;
}

/// Creates connected clients from credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ChatClient>, PlatformError>;
}
