//! Tunnel status endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::TunnelError;
use crate::AppState;

/// `GET /api/tunnel/status` — every live tunnel.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let mut tunnels: Vec<_> = state
        .tunnel
        .registry()
        .snapshot()
        .await
        .iter()
        .map(|conn| conn.status())
        .collect();
    tunnels.sort_by(|a, b| a.environment_id.cmp(&b.environment_id));
    Json(json!({
        "count": tunnels.len(),
        "tunnels": tunnels,
    }))
}

/// `GET /api/environments/{id}/tunnel`
pub async fn environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, TunnelError> {
    let env = state
        .environments
        .get(&id)
        .await
        .ok_or_else(|| TunnelError::EnvironmentNotFound(id.clone()))?;
    let tunnel = state.tunnel.registry().lookup(&id).await.map(|c| c.status());
    Ok(Json(json!({
        "environment_id": env.id,
        "edge": env.is_edge(),
        "connected": tunnel.is_some(),
        "last_heartbeat": env.last_heartbeat,
        "tunnel": tunnel,
    })))
}
