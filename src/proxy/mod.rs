//! Environment router — decides per request whether an environment-scoped
//! call is served locally, forwarded to a direct remote, or proxied through
//! an edge tunnel.
//!
//! Installed with [`axum::middleware::from_fn_with_state`] in front of every
//! route, so downstream handlers only ever see local requests.

pub mod http;
pub mod ws;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::environment::{Environment, EnvironmentStore, LOCAL_ENVIRONMENT_ID};
use crate::error::TunnelError;
use crate::state::AppState;

/// Prefix of every environment-scoped API path.
pub const ENVIRONMENT_PREFIX: &str = "/api/environments/";

/// Sub-paths that configure the environment record itself and are always
/// handled by the manager. `""` is the record (`/api/environments/{id}`).
const MANAGEMENT_PATHS: &[&str] = &[
    "",
    "/settings",
    "/heartbeat",
    "/pair",
    "/agent/pair",
    "/test",
    "/tunnel",
];

/// Where a request for an environment goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Direct(Environment),
    Edge(Environment),
}

/// Split `/api/environments/{id}{rest}` into `(id, rest)`.
pub fn parse_environment_path(path: &str) -> Option<(&str, &str)> {
    let tail = path.strip_prefix(ENVIRONMENT_PREFIX)?;
    let (id, rest) = match tail.find('/') {
        Some(i) => tail.split_at(i),
        None => (tail, ""),
    };
    if id.is_empty() {
        return None;
    }
    Some((id, rest))
}

pub fn is_management_path(rest: &str) -> bool {
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    MANAGEMENT_PATHS.iter().any(|m| {
        rest == *m
            || (!m.is_empty()
                && rest
                    .strip_prefix(m)
                    .is_some_and(|tail| tail.starts_with('/')))
    })
}

/// Endpoints that are bridged as WebSocket streams when upgraded.
pub fn is_streaming_path(rest: &str) -> bool {
    let segments: Vec<&str> = rest.trim_matches('/').split('/').collect();
    let segments = match segments.first() {
        Some(&"ws") => &segments[1..],
        _ => &segments[..],
    };
    match segments {
        ["containers", _, "logs" | "stats" | "exec" | "terminal"]
        | ["projects", _, "logs"] => true,
        ["system", "stats"] => true,
        _ => false,
    }
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Path as the remote's own API serves it: the environment id is replaced
/// by the local sentinel.
pub fn agent_path(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{ENVIRONMENT_PREFIX}{LOCAL_ENVIRONMENT_ID}{rest}?{q}"),
        _ => format!("{ENVIRONMENT_PREFIX}{LOCAL_ENVIRONMENT_ID}{rest}"),
    }
}

/// Routing decision for one environment-scoped path.
pub async fn resolve_target(
    store: &dyn EnvironmentStore,
    environment_id: &str,
    rest: &str,
) -> Result<Target, TunnelError> {
    if environment_id == LOCAL_ENVIRONMENT_ID || is_management_path(rest) {
        return Ok(Target::Local);
    }
    let env = store
        .get(environment_id)
        .await
        .ok_or_else(|| TunnelError::EnvironmentNotFound(environment_id.to_string()))?;
    if !env.enabled {
        return Err(TunnelError::EnvironmentDisabled(environment_id.to_string()));
    }
    if env.is_edge() {
        Ok(Target::Edge(env))
    } else {
        Ok(Target::Direct(env))
    }
}

/// Middleware entry point.
pub async fn route_environment(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some((environment_id, rest)) = parse_environment_path(request.uri().path()) else {
        return next.run(request).await;
    };
    let environment_id = environment_id.to_string();
    let rest = rest.to_string();

    let target = match resolve_target(state.environments.as_ref(), &environment_id, &rest).await {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };

    let path = agent_path(&rest, request.uri().query());
    let streaming = is_streaming_path(&rest) && is_websocket_upgrade(request.headers());
    let max_body = state.config.server.max_body_size;

    let result = match target {
        Target::Local => return next.run(request).await,
        Target::Edge(env) => {
            let Some(conn) = state.tunnel.registry().lookup(&env.id).await else {
                debug!(environment_id = %env.id, "No tunnel for edge environment");
                return TunnelError::NotConnected.into_response();
            };
            if streaming {
                ws::bridge_tunnel(conn, request, path, state.tunnel.proxy_timeout()).await
            } else {
                http::forward_tunnel(&conn, request, path, max_body, state.tunnel.proxy_timeout())
                    .await
            }
        }
        Target::Direct(env) => {
            if streaming {
                ws::bridge_direct(&env, request, &path).await
            } else {
                http::forward_direct(
                    &state.http,
                    &env,
                    request,
                    &path,
                    max_body,
                    state.tunnel.proxy_timeout(),
                )
                .await
            }
        }
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{middleware, routing::get, Router};

    use super::route_environment;
    use crate::auth::ApiKeyResolver;
    use crate::config::Config;
    use crate::environment::{
        Environment, EnvironmentStore, InMemoryEnvironmentStore, StoreStatusCallback, EDGE_SCHEME,
    };
    use crate::state::AppState;
    use crate::tunnel::testing::{fake_transport, FakeAgent};
    use crate::tunnel::TunnelServer;

    pub fn edge_env(id: &str) -> Environment {
        Environment {
            id: id.to_string(),
            name: format!("edge {id}"),
            address: format!("{EDGE_SCHEME}site-{id}"),
            access_token: Some(format!("token-{id}")),
            enabled: true,
            connected: false,
            last_heartbeat: None,
        }
    }

    pub fn test_state(config: Config, environments: Vec<Environment>) -> AppState {
        let resolver = ApiKeyResolver::from_environments(&environments);
        let store: Arc<dyn EnvironmentStore> = Arc::new(InMemoryEnvironmentStore::new(environments));
        let tunnel = TunnelServer::new(
            Arc::new(resolver),
            Arc::new(StoreStatusCallback(store.clone())),
            config.tunnel.clone(),
        );
        AppState::new(Arc::new(config), store, tunnel).unwrap()
    }

    /// Attach a fake agent to `environment_id` in the state's tunnel server.
    pub async fn attach_fake(state: &AppState, environment_id: &str) -> FakeAgent {
        let (conn, rx) = state.tunnel.open(environment_id).await;
        let (sink, stream, agent) = fake_transport();
        let server = state.tunnel.clone();
        tokio::spawn(async move { server.serve(conn, rx, sink, stream).await });
        agent
    }

    /// A router whose local handlers count their invocations.
    pub fn counting_app(state: AppState) -> (Router, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        let app = Router::new()
            .route(
                "/api/environments/{id}/containers",
                get(move || {
                    h1.fetch_add(1, Ordering::SeqCst);
                    async { "local containers" }
                }),
            )
            .route(
                "/api/environments/{id}/settings",
                get(move || {
                    h2.fetch_add(1, Ordering::SeqCst);
                    async { "local settings" }
                }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), route_environment))
            .with_state(state);
        (app, hits)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::Config;
    use crate::tunnel::testing::spawn_echo_agent;
    use crate::tunnel::Frame;
    use axum::{body::Body, http::StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_parse_environment_path() {
        assert_eq!(
            parse_environment_path("/api/environments/5/containers/abc"),
            Some(("5", "/containers/abc"))
        );
        assert_eq!(parse_environment_path("/api/environments/5"), Some(("5", "")));
        assert_eq!(parse_environment_path("/api/environments/"), None);
        assert_eq!(parse_environment_path("/api/environments"), None);
        assert_eq!(parse_environment_path("/api/health"), None);
    }

    #[test]
    fn test_management_paths() {
        for rest in ["", "/", "/settings", "/heartbeat", "/agent/pair", "/tunnel", "/pair/"] {
            assert!(is_management_path(rest), "{rest}");
        }
        for rest in ["/containers", "/settingsx", "/images/settings", "/system/stats"] {
            assert!(!is_management_path(rest), "{rest}");
        }
    }

    #[test]
    fn test_streaming_paths() {
        for rest in [
            "/ws/containers/abc/logs",
            "/ws/containers/abc/terminal",
            "/containers/abc/stats",
            "/containers/abc/exec",
            "/system/stats",
            "/ws/system/stats",
            "/projects/web/logs",
            "/ws/projects/web/logs",
        ] {
            assert!(is_streaming_path(rest), "{rest}");
        }
        for rest in ["/containers", "/containers/abc", "/containers/abc/start", "/system/info"] {
            assert!(!is_streaming_path(rest), "{rest}");
        }
    }

    #[test]
    fn test_agent_path_rewrite() {
        assert_eq!(agent_path("/containers", None), "/api/environments/0/containers");
        assert_eq!(
            agent_path("/containers", Some("all=1")),
            "/api/environments/0/containers?all=1"
        );
    }

    #[tokio::test]
    async fn test_no_tunnel_short_circuits_with_502() {
        let state = test_state(Config::default(), vec![edge_env("5")]);
        let (app, hits) = counting_app(state);

        let response = app
            .clone()
            .oneshot(get("/api/environments/5/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Edge agent is not connected"));

        let upgrade = Request::builder()
            .uri("/api/environments/5/ws/containers/abc/logs")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(upgrade).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_management_path_served_locally_without_tunnel() {
        let state = test_state(Config::default(), vec![edge_env("5")]);
        let (app, hits) = counting_app(state);

        let response = app
            .clone()
            .oneshot(get("/api/environments/5/settings"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let response = app
            .oneshot(get("/api/environments/5/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_environment_passes_through() {
        let state = test_state(Config::default(), vec![]);
        let (app, hits) = counting_app(state);
        let response = app
            .oneshot(get("/api/environments/0/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_environments() {
        let mut disabled = edge_env("6");
        disabled.enabled = false;
        let state = test_state(Config::default(), vec![disabled]);
        let (app, hits) = counting_app(state);

        let response = app
            .clone()
            .oneshot(get("/api/environments/404/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get("/api/environments/6/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "ENVIRONMENT_DISABLED");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tunneled_request_round_trip() {
        let state = test_state(Config::default(), vec![edge_env("5")]);
        spawn_echo_agent(attach_fake(&state, "5").await);
        let (app, hits) = counting_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/environments/5/containers?all=1")
            .header("content-type", "application/json")
            .header("authorization", "Bearer user-session")
            .header("cookie", "session=abc")
            .body(Body::from(r#"{"image":"nginx"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );

        let echo = body_json(response).await;
        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["path"], "/api/environments/0/containers?all=1");
        assert_eq!(echo["headers"]["content-type"], "application/json");
        assert!(echo["headers"].get("authorization").is_none());
        assert!(echo["headers"].get("cookie").is_none());
        let body = crate::tunnel::frame::decode_body(echo["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, br#"{"image":"nginx"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_environments_are_independent() {
        let state = test_state(Config::default(), vec![edge_env("5"), edge_env("6")]);
        let mut stalled = attach_fake(&state, "5").await;
        spawn_echo_agent(attach_fake(&state, "6").await);
        let (app, _hits) = counting_app(state);

        let slow_app = app.clone();
        let slow = tokio::spawn(async move {
            slow_app
                .oneshot(get("/api/environments/5/containers"))
                .await
                .unwrap()
        });
        let Frame::Request { id, .. } = stalled.next_frame().await else {
            panic!("expected request on environment 5");
        };

        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            app.oneshot(get("/api/environments/6/containers")),
        )
        .await
        .expect("environment 6 blocked by environment 5")
        .unwrap();
        assert_eq!(fast.status(), StatusCode::OK);
        assert!(!slow.is_finished());

        stalled.respond(&id, 201, b"{}");
        assert_eq!(slow.await.unwrap().status(), StatusCode::CREATED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_timeout_is_504() {
        let mut config = Config::default();
        config.tunnel.proxy_timeout_secs = 3;
        let state = test_state(config, vec![edge_env("5")]);
        let _silent = attach_fake(&state, "5").await;
        let (app, _hits) = counting_app(state.clone());

        let response = app
            .oneshot(get("/api/environments/5/containers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let conn = state.tunnel.registry().lookup("5").await.unwrap();
        assert!(!conn.is_closed());
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let mut config = Config::default();
        config.server.max_body_size = 8;
        let state = test_state(config, vec![edge_env("5")]);
        let _agent = attach_fake(&state, "5").await;
        let (app, _hits) = counting_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/environments/5/containers")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
