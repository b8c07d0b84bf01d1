//! Environment management endpoints.
//!
//! These operate on the environment record itself, so the router always
//! serves them locally, whether or not the environment's tunnel is up.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::environment::{Environment, EnvironmentSettings};
use crate::error::TunnelError;
use crate::AppState;

/// `GET /api/environments`
pub async fn list(State(state): State<AppState>) -> Json<Vec<Environment>> {
    Json(state.environments.list().await)
}

/// `GET /api/environments/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Environment>, TunnelError> {
    state
        .environments
        .get(&id)
        .await
        .map(Json)
        .ok_or(TunnelError::EnvironmentNotFound(id))
}

fn settings_view(env: &Environment) -> Value {
    json!({
        "id": env.id,
        "name": env.name,
        "address": env.address,
        "enabled": env.enabled,
        "edge": env.is_edge(),
        "has_access_token": env.access_token.is_some(),
    })
}

/// `GET /api/environments/{id}/settings`
pub async fn settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, TunnelError> {
    let env = state
        .environments
        .get(&id)
        .await
        .ok_or(TunnelError::EnvironmentNotFound(id))?;
    Ok(Json(settings_view(&env)))
}

/// `PUT /api/environments/{id}/settings`
///
/// Disabling an environment, or changing its address or token, drops any
/// live tunnel so the agent has to reconnect under the new settings.
pub async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(settings): Json<EnvironmentSettings>,
) -> Result<Json<Value>, TunnelError> {
    let invalidates_tunnel = settings.enabled == Some(false)
        || settings.address.is_some()
        || settings.access_token.is_some();
    let env = state.environments.update_settings(&id, settings).await?;
    info!(environment_id = %id, "Environment settings updated");

    if invalidates_tunnel && state.tunnel.disconnect(&id).await {
        info!(environment_id = %id, "Dropped tunnel after settings change");
    }
    Ok(Json(settings_view(&env)))
}

/// `POST /api/environments/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, TunnelError> {
    let env = state.environments.record_heartbeat(&id).await?;
    Ok(Json(json!({
        "id": env.id,
        "last_heartbeat": env.last_heartbeat,
    })))
}
