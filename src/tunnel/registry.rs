//! Environment id → live tunnel map.
//!
//! The only structure mutated by many tasks at once: request handlers read it
//! on every proxied call while the accept path and the liveness sweep write it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::connection::Connection;

#[derive(Default)]
pub struct TunnelRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` for `environment_id`, returning the connection it
    /// displaced. The caller closes the displaced one.
    pub async fn register(
        &self,
        environment_id: &str,
        connection: Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .await
            .insert(environment_id.to_string(), connection)
    }

    /// Remove the mapping only if it still points at `connection`. Returns
    /// whether anything was removed.
    pub async fn unregister(&self, environment_id: &str, connection: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(environment_id) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                connections.remove(environment_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, environment_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(environment_id).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Remove and return every connection (used at shutdown).
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}
