//! Environment records and the store the tunnel reads and updates.
//!
//! Persistence is a collaborator: the tunnel only needs lookups for routing
//! and a way to flip the `connected` flag. [`InMemoryEnvironmentStore`] is the
//! default, seeded from `[[environments]]` in the config file.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::EnvironmentSeed;
use crate::error::{HookResult, TunnelError};

/// Identifier of the manager's own Docker daemon.
pub const LOCAL_ENVIRONMENT_ID: &str = "0";

/// Address scheme marking an environment reachable only through a tunnel.
pub const EDGE_SCHEME: &str = "edge://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Environment {
    pub fn local() -> Self {
        Self {
            id: LOCAL_ENVIRONMENT_ID.to_string(),
            name: "Local Docker".to_string(),
            address: "unix:///var/run/docker.sock".to_string(),
            access_token: None,
            enabled: true,
            connected: true,
            last_heartbeat: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_ENVIRONMENT_ID
    }

    pub fn is_edge(&self) -> bool {
        self.address.starts_with(EDGE_SCHEME)
    }
}

impl From<&EnvironmentSeed> for Environment {
    fn from(seed: &EnvironmentSeed) -> Self {
        Self {
            id: seed.id.clone(),
            name: seed.name.clone().unwrap_or_else(|| seed.id.clone()),
            address: seed.address.clone(),
            access_token: seed.access_token.clone(),
            enabled: seed.enabled,
            connected: false,
            last_heartbeat: None,
        }
    }
}

/// Fields a management call may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentSettings {
    pub name: Option<String>,
    pub address: Option<String>,
    pub access_token: Option<String>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Option<Environment>;
    async fn list(&self) -> Vec<Environment>;
    async fn update_connection_state(&self, id: &str, connected: bool) -> Result<(), TunnelError>;
    async fn record_heartbeat(&self, id: &str) -> Result<Environment, TunnelError>;
    async fn update_settings(
        &self,
        id: &str,
        settings: EnvironmentSettings,
    ) -> Result<Environment, TunnelError>;
}

pub struct InMemoryEnvironmentStore {
    environments: RwLock<HashMap<String, Environment>>,
}

impl InMemoryEnvironmentStore {
    /// Build a store holding the local environment plus `seeds`.
    pub fn new(seeds: impl IntoIterator<Item = Environment>) -> Self {
        let mut environments: HashMap<String, Environment> = seeds
            .into_iter()
            .map(|env| (env.id.clone(), env))
            .collect();
        environments
            .entry(LOCAL_ENVIRONMENT_ID.to_string())
            .or_insert_with(Environment::local);
        Self {
            environments: RwLock::new(environments),
        }
    }
}

#[async_trait]
impl EnvironmentStore for InMemoryEnvironmentStore {
    async fn get(&self, id: &str) -> Option<Environment> {
        self.environments.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<Environment> {
        let mut list: Vec<Environment> = self.environments.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    async fn update_connection_state(&self, id: &str, connected: bool) -> Result<(), TunnelError> {
        let mut environments = self.environments.write().await;
        let env = environments
            .get_mut(id)
            .ok_or_else(|| TunnelError::EnvironmentNotFound(id.to_string()))?;
        env.connected = connected;
        if connected {
            env.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str) -> Result<Environment, TunnelError> {
        let mut environments = self.environments.write().await;
        let env = environments
            .get_mut(id)
            .ok_or_else(|| TunnelError::EnvironmentNotFound(id.to_string()))?;
        env.last_heartbeat = Some(Utc::now());
        Ok(env.clone())
    }

    async fn update_settings(
        &self,
        id: &str,
        settings: EnvironmentSettings,
    ) -> Result<Environment, TunnelError> {
        let mut environments = self.environments.write().await;
        let env = environments
            .get_mut(id)
            .ok_or_else(|| TunnelError::EnvironmentNotFound(id.to_string()))?;
        if let Some(name) = settings.name {
            env.name = name;
        }
        if let Some(address) = settings.address {
            env.address = address;
        }
        if let Some(token) = settings.access_token {
            env.access_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(enabled) = settings.enabled {
            env.enabled = enabled;
        }
        Ok(env.clone())
    }
}

/// Receives connection state changes from the tunnel server.
#[async_trait]
pub trait StatusCallback: Send + Sync + 'static {
    async fn connection_changed(&self, environment_id: &str, connected: bool) -> HookResult;
}

/// Persists tunnel state changes into an [`EnvironmentStore`].
pub struct StoreStatusCallback(pub Arc<dyn EnvironmentStore>);

#[async_trait]
impl StatusCallback for StoreStatusCallback {
    async fn connection_changed(&self, environment_id: &str, connected: bool) -> HookResult {
        self.0
            .update_connection_state(environment_id, connected)
            .await
            .map_err(Into::into)
    }
}
