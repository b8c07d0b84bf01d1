//! Error taxonomy for the tunnel and the environment router.
//!
//! Every variant maps to exactly one HTTP status so the router can surface a
//! failed proxy call to the original client without further translation.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("missing or invalid agent credentials")]
    Unauthorized,
    /// Clients match on this message.
    #[error("Edge agent is not connected")]
    NotConnected,
    #[error("environment '{0}' not found")]
    EnvironmentNotFound(String),
    #[error("environment '{0}' is disabled")]
    EnvironmentDisabled(String),
    #[error("edge agent did not respond within {0:?}")]
    Timeout(Duration),
    #[error("edge agent connection lost: {0}")]
    ConnectionLost(String),
    #[error("tunnel connection is closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl TunnelError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EnvironmentNotFound(_) => StatusCode::NOT_FOUND,
            Self::EnvironmentDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidFrame(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotConnected
            | Self::ConnectionLost(_)
            | Self::ConnectionClosed
            | Self::Transport(_)
            | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotConnected => "AGENT_NOT_CONNECTED",
            Self::EnvironmentNotFound(_) => "ENVIRONMENT_NOT_FOUND",
            Self::EnvironmentDisabled(_) => "ENVIRONMENT_DISABLED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConnectionLost(_) => "AGENT_DISCONNECTED",
            Self::ConnectionClosed => "TUNNEL_CLOSED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::InvalidFrame(_) => "INVALID_FRAME",
            Self::BodyTooLarge(_) => "BODY_TOO_LARGE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

/// Result of a best-effort collaborator hook. Failures are logged, never
/// propagated into connection state.
pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TunnelError::NotConnected.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            TunnelError::Timeout(Duration::from_secs(5)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(TunnelError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            TunnelError::BodyTooLarge(10).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_sub_second_timeout_message() {
        let err = TunnelError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "edge agent did not respond within 250ms");
        assert_eq!(
            TunnelError::Timeout(Duration::from_secs(60)).to_string(),
            "edge agent did not respond within 60s"
        );
    }

    #[tokio::test]
    async fn test_not_connected_body() {
        let response = TunnelError::NotConnected.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Edge agent is not connected"));
        assert_eq!(body["code"], "AGENT_NOT_CONNECTED");
    }
}
