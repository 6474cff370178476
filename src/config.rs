use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ServiceError;
use crate::platform::{Credentials, Login};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl std::fmt::Display for MessageOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageOrder::NewestFirst => write!(f, "newest_first"),
            MessageOrder::OldestFirst => write!(f, "oldest_first"),
        }
    }
}

/// What happens to the client handle once a job is done.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Reuse,
    PerRequest,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Reuse => write!(f, "reuse"),
            Lifecycle::PerRequest => write!(f, "per_request"),
        }
    }
}

/// The app ID exactly as configured. Kept unparsed so that a bad value is
/// reported when a request needs it instead of aborting startup.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum RawAppId {
    Number(i64),
    Text(String),
}

impl RawAppId {
    fn is_blank(&self) -> bool {
        matches!(self, RawAppId::Text(s) if s.trim().is_empty())
    }

    fn parse(&self) -> std::result::Result<i32, String> {
        match self {
            RawAppId::Number(n) => i32::try_from(*n).map_err(|e| e.to_string()),
            RawAppId::Text(s) => s.trim().parse::<i32>().map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_telegram_config")]
    pub telegram: TelegramConfig,
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    #[serde(default = "default_parser_config")]
    pub parser: ParserConfig,
    #[serde(default = "default_heartbeat_config")]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub api_id: Option<RawAppId>,
    #[serde(default)]
    pub api_hash: Option<String>,
    /// Saved login session, base64 as written by the setup wizard
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

// Secrets stay out of debug output.
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_id", &self.api_id.is_some())
            .field("api_hash", &self.api_hash.is_some())
            .field("session", &self.session.is_some())
            .field("phone", &self.phone.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default)]
    pub order: MessageOrder,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl ParserConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_cron")]
    pub cron: String,
}

/// Which credentials are configured, for the liveness endpoint. Never the values.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub api_id: bool,
    pub api_hash: bool,
    pub session: bool,
    pub phone: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_limit() -> usize {
    10
}

fn default_max_limit() -> usize {
    200
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_telegram_config() -> TelegramConfig {
    TelegramConfig {
        api_id: None,
        api_hash: None,
        session: None,
        phone: None,
    }
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_parser_config() -> ParserConfig {
    ParserConfig {
        default_limit: default_limit(),
        max_limit: default_max_limit(),
        order: MessageOrder::default(),
        lifecycle: Lifecycle::default(),
        fetch_timeout_secs: default_fetch_timeout_secs(),
        queue_depth: default_queue_depth(),
    }
}

fn default_heartbeat_config() -> HeartbeatConfig {
    HeartbeatConfig {
        enabled: true,
        cron: default_heartbeat_cron(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: default_telegram_config(),
            server: default_server_config(),
            parser: default_parser_config(),
            heartbeat: default_heartbeat_config(),
        }
    }
}

impl Config {
    /// Read the TOML file if there is one, then layer the process
    /// environment on top.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            info!(
                "No config file at {}, using defaults and environment",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment names follow the deployment convention: API_ID, API_HASH,
    /// STRING_SESSION, PHONE, HOST, PORT.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("API_ID") {
            self.telegram.api_id = Some(RawAppId::Text(v));
        }
        if let Some(v) = lookup("API_HASH") {
            self.telegram.api_hash = Some(v);
        }
        if let Some(v) = lookup("STRING_SESSION") {
            self.telegram.session = Some(v);
        }
        if let Some(v) = lookup("PHONE") {
            self.telegram.phone = Some(v);
        }
        if let Some(v) = lookup("HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT: {v:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.parser.max_limit == 0 {
            bail!("parser.max_limit must be at least 1");
        }
        if self.parser.default_limit == 0 {
            bail!("parser.default_limit must be at least 1");
        }
        if self.parser.queue_depth == 0 {
            bail!("parser.queue_depth must be at least 1");
        }
        if self.parser.default_limit > self.parser.max_limit {
            self.parser.default_limit = self.parser.max_limit;
        }
        Ok(())
    }

    pub fn presence(&self) -> Presence {
        let t = &self.telegram;
        Presence {
            api_id: t.api_id.as_ref().is_some_and(|id| !id.is_blank()),
            api_hash: non_empty(&t.api_hash).is_some(),
            session: non_empty(&t.session).is_some(),
            phone: non_empty(&t.phone).is_some(),
        }
    }

    /// Credentials for the connector. A session token takes precedence over
    /// a phone number when both are configured.
    pub fn credentials(&self) -> std::result::Result<Credentials, ServiceError> {
        let t = &self.telegram;
        let api_id = t.api_id.as_ref().filter(|id| !id.is_blank());
        let (Some(api_id), Some(api_hash)) = (api_id, non_empty(&t.api_hash)) else {
            return Err(ServiceError::Configuration(
                "API_ID/API_HASH not configured on server.".to_string(),
            ));
        };

        let api_id = api_id
            .parse()
            .map_err(|e| ServiceError::Configuration(format!("Invalid API_ID: {e}")))?;

        let login = if let Some(token) = non_empty(&t.session) {
            Login::Session(token.to_string())
        } else if let Some(phone) = non_empty(&t.phone) {
            Login::Phone(phone.to_string())
        } else {
            return Err(ServiceError::Configuration(
                "No STRING_SESSION or PHONE configured".to_string(),
            ));
        };

        Ok(Credentials {
            api_id,
            api_hash: api_hash.to_string(),
            login,
        })
    }
}
