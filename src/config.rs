//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `EDGEHUB_LISTEN`, `EDGEHUB_MANAGER_URL`,
//!    `EDGEHUB_AGENT_TOKEN`, `EDGEHUB_LOCAL_URL`
//! 2. **Config file** — path via `--config <path>`, or `edgehub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3552"
//! max_body_size = 33554432         # 32 MB
//! max_concurrent_requests = 512
//!
//! [tunnel]
//! heartbeat_timeout_secs = 90      # evict tunnels silent for this long
//! sweep_interval_secs = 30
//! proxy_timeout_secs = 60          # per proxied request
//! outbound_queue = 256
//! stream_buffer = 256
//!
//! # Edge agent mode only (`edgehub agent`)
//! [agent]
//! manager_url = "wss://manager.example.com/api/tunnel/connect"
//! token = "agent-secret"
//! local_url = "http://127.0.0.1:3553"
//! heartbeat_interval_secs = 30
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//!
//! [logging]
//! level = "info"
//!
//! [[environments]]
//! id = "1"
//! name = "Warehouse NUC"
//! address = "edge://warehouse"
//! access_token = "agent-secret"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Environments known to the manager at startup.
    #[serde(default)]
    pub environments: Vec<EnvironmentSeed>,
}

/// HTTP server settings for the manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3552`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest request body forwarded to a remote environment (default 32 MB).
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Concurrent in-flight HTTP requests (default 512).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Manager-side tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds without inbound traffic before a tunnel is evicted (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between liveness sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-request wait for an agent response in seconds (default 60).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Outbound frame queue depth per connection (default 256).
    #[serde(default = "default_queue")]
    pub outbound_queue: usize,
    /// Buffered stream chunks per bridged WebSocket (default 256).
    #[serde(default = "default_queue")]
    pub stream_buffer: usize,
}

/// Edge agent settings, used by `edgehub agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Manager tunnel endpoint (e.g. `wss://manager/api/tunnel/connect`).
    pub manager_url: Option<String>,
    /// Bearer token presented to the manager.
    #[serde(default)]
    pub token: String,
    /// Base URL of the agent's local API that proxied requests are sent to.
    #[serde(default = "default_local_url")]
    pub local_url: String,
    /// Seconds between heartbeat frames (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// An environment record declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSeed {
    pub id: String,
    pub name: Option<String>,
    /// `http(s)://host:port` for direct remotes, `edge://name` for tunneled ones.
    pub address: String,
    pub access_token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_listen() -> String {
    "0.0.0.0:3552".to_string()
}
fn default_max_body_size() -> usize {
    32 * 1024 * 1024 // 32 MB
}
fn default_max_concurrent_requests() -> usize {
    512
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_proxy_timeout() -> u64 {
    60
}
fn default_queue() -> usize {
    256
}
fn default_local_url() -> String {
    "http://127.0.0.1:3553".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_size: default_max_body_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            proxy_timeout_secs: default_proxy_timeout(),
            outbound_queue: default_queue(),
            stream_buffer: default_queue(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manager_url: None,
            token: String::new(),
            local_url: default_local_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `edgehub.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("edgehub.toml").exists() => Self::from_file("edgehub.toml")?,
            None => Config::default(),
        };

        if let Ok(listen) = std::env::var("EDGEHUB_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("EDGEHUB_MANAGER_URL") {
            config.agent.manager_url = Some(url);
        }
        if let Ok(token) = std::env::var("EDGEHUB_AGENT_TOKEN") {
            config.agent.token = token;
        }
        if let Ok(local) = std::env::var("EDGEHUB_LOCAL_URL") {
            config.agent.local_url = local;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
