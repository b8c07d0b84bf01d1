//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::environment::EnvironmentStore;
use crate::tunnel::TunnelServer;

/// Shared application state for the manager.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Environment records used for routing decisions.
    pub environments: Arc<dyn EnvironmentStore>,
    /// Accept path, registry and liveness sweep for edge tunnels.
    pub tunnel: TunnelServer,
    /// Client for direct-remote forwarding (shared connection pool).
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        environments: Arc<dyn EnvironmentStore>,
        tunnel: TunnelServer,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.tunnel.proxy_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            start_time: Instant::now(),
            environments,
            tunnel,
            http,
        })
    }
}
