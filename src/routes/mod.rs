//! HTTP route handlers.
//!
//! Every route sits behind [`crate::proxy::route_environment`], which diverts
//! requests for remote environments before they reach a handler here.

pub mod environments;
pub mod health;
pub mod tunnels;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::proxy;
use crate::tunnel::server::connect;
use crate::AppState;

/// Build the manager's API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/tunnel/connect", get(connect))
        .route("/api/tunnel/status", get(tunnels::list))
        .route("/api/environments", get(environments::list))
        .route("/api/environments/{id}", get(environments::get))
        .route(
            "/api/environments/{id}/settings",
            get(environments::settings).put(environments::update_settings),
        )
        .route(
            "/api/environments/{id}/heartbeat",
            post(environments::heartbeat),
        )
        .route("/api/environments/{id}/tunnel", get(tunnels::environment))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy::route_environment,
        ))
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not found", "code": "NOT_FOUND"})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::testing::{attach_fake, edge_env, test_state};
    use axum::{body::Body, extract::Request, response::Response};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Config::default(), vec![edge_env("5")]);
        let _agent = attach_fake(&state, "5").await;
        let app = router(state);

        let response = call(&app, "GET", "/api/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnels"], 1);
    }

    #[tokio::test]
    async fn test_environment_records_served_locally_without_tunnel() {
        let app = router(test_state(Config::default(), vec![edge_env("5")]));

        let list = json_body(call(&app, "GET", "/api/environments", None).await).await;
        assert_eq!(list.as_array().unwrap().len(), 2);
        assert!(list[1].get("access_token").is_none());

        let response = call(&app, "GET", "/api/environments/5", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["address"], "edge://site-5");

        let response = call(&app, "GET", "/api/environments/5/settings", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let settings = json_body(response).await;
        assert_eq!(settings["edge"], true);
        assert_eq!(settings["has_access_token"], true);

        let response = call(&app, "POST", "/api/environments/5/heartbeat", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["last_heartbeat"].is_string());

        let response = call(&app, "GET", "/api/environments/5/containers/json", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unknown_environment_record_is_404() {
        let app = router(test_state(Config::default(), vec![]));
        let response = call(&app, "GET", "/api/environments/99/settings", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "ENVIRONMENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_fallback_is_json_404() {
        let app = router(test_state(Config::default(), vec![]));
        let response = call(&app, "GET", "/api/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_tunnel_status_endpoints() {
        let state = test_state(Config::default(), vec![edge_env("5"), edge_env("6")]);
        let _agent = attach_fake(&state, "5").await;
        let app = router(state);

        let body = json_body(call(&app, "GET", "/api/tunnel/status", None).await).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["tunnels"][0]["environment_id"], "5");
        assert_eq!(body["tunnels"][0]["pending_requests"], 0);

        let body = json_body(call(&app, "GET", "/api/environments/5/tunnel", None).await).await;
        assert_eq!(body["connected"], true);
        let body = json_body(call(&app, "GET", "/api/environments/6/tunnel", None).await).await;
        assert_eq!(body["connected"], false);
        assert_eq!(body["tunnel"], Value::Null);
    }

    #[tokio::test]
    async fn test_disabling_environment_drops_tunnel() {
        let state = test_state(Config::default(), vec![edge_env("5")]);
        let _agent = attach_fake(&state, "5").await;
        assert!(state.environments.get("5").await.unwrap().connected);
        let app = router(state.clone());

        let response = call(
            &app,
            "PUT",
            "/api/environments/5/settings",
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["enabled"], false);

        for _ in 0..50 {
            if state.tunnel.registry().is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.tunnel.registry().is_empty().await);

        let response = call(&app, "GET", "/api/environments/5/containers", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
