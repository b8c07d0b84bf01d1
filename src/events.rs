//! Tunnel lifecycle events and the sink they are forwarded to.
//!
//! Events are either synthesized by the tunnel server on connect/disconnect or
//! pushed by an agent in an `event` frame. The core never retains them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::HookResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Success,
    Warning,
    Error,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// An audit record for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: EventSeverity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl TunnelEvent {
    pub fn edge_connected(environment_id: &str) -> Self {
        Self {
            event_type: "environment.edge.connected".to_string(),
            severity: EventSeverity::Success,
            title: "Edge Agent Connected".to_string(),
            description: format!("Edge agent for environment {environment_id} connected"),
            resource_type: Some("environment".to_string()),
            resource_id: Some(environment_id.to_string()),
            resource_name: None,
            metadata: Map::new(),
        }
    }

    pub fn edge_disconnected(environment_id: &str, reason: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), Value::String(reason.to_string()));
        Self {
            event_type: "environment.edge.disconnected".to_string(),
            severity: EventSeverity::Warning,
            title: "Edge Agent Disconnected".to_string(),
            description: format!("Edge agent for environment {environment_id} disconnected"),
            resource_type: Some("environment".to_string()),
            resource_id: Some(environment_id.to_string()),
            resource_name: None,
            metadata,
        }
    }
}

/// Destination for tunnel events (audit log, notification fan-out, ...).
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn create_event(&self, environment_id: &str, event: TunnelEvent) -> HookResult;
}

/// Default sink: writes each event as a structured log record.
#[derive(Debug, Default, Clone)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn create_event(&self, environment_id: &str, event: TunnelEvent) -> HookResult {
        match event.severity {
            EventSeverity::Warning | EventSeverity::Error => warn!(
                environment_id,
                event_type = %event.event_type,
                severity = event.severity.as_str(),
                "{}: {}",
                event.title,
                event.description
            ),
            EventSeverity::Info | EventSeverity::Success => info!(
                environment_id,
                event_type = %event.event_type,
                severity = event.severity.as_str(),
                "{}: {}",
                event.title,
                event.description
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_connected_event() {
        let event = TunnelEvent::edge_connected("7");
        assert_eq!(event.title, "Edge Agent Connected");
        assert_eq!(event.severity, EventSeverity::Success);
        assert_eq!(event.resource_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_edge_disconnected_carries_reason() {
        let event = TunnelEvent::edge_disconnected("7", "heartbeat timeout");
        assert_eq!(event.title, "Edge Agent Disconnected");
        assert_eq!(event.severity, EventSeverity::Warning);
        assert_eq!(event.metadata["reason"], "heartbeat timeout");
    }

    #[test]
    fn test_agent_event_deserializes_with_defaults() {
        let event: TunnelEvent = serde_json::from_str(
            r#"{"type":"container.start","severity":"info","title":"Container started"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "container.start");
        assert!(event.description.is_empty());
        assert!(event.metadata.is_empty());
    }
}
