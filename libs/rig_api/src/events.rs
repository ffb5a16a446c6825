//! The canonical event model. Every observable fact about an environment
//! is an `Event` on its log; cross-component ordering questions are
//! settled by the order of events, nothing else.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wiring::{Endpoint, WiringContext};

/// Wire names follow the `noun.verb` convention throughout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum EventType {
    #[serde(rename = "artifact.started")]
    #[strum(serialize = "artifact.started")]
    ArtifactStarted,
    #[serde(rename = "artifact.completed")]
    #[strum(serialize = "artifact.completed")]
    ArtifactCompleted,
    #[serde(rename = "artifact.cached")]
    #[strum(serialize = "artifact.cached")]
    ArtifactCached,
    #[serde(rename = "artifact.failed")]
    #[strum(serialize = "artifact.failed")]
    ArtifactFailed,

    #[serde(rename = "ingress.published")]
    #[strum(serialize = "ingress.published")]
    IngressPublished,
    #[serde(rename = "proxy.published")]
    #[strum(serialize = "proxy.published")]
    ProxyPublished,
    #[serde(rename = "wiring.resolved")]
    #[strum(serialize = "wiring.resolved")]
    WiringResolved,

    #[serde(rename = "service.prestart")]
    #[strum(serialize = "service.prestart")]
    ServicePrestart,
    #[serde(rename = "service.starting")]
    #[strum(serialize = "service.starting")]
    ServiceStarting,
    #[serde(rename = "service.healthy")]
    #[strum(serialize = "service.healthy")]
    ServiceHealthy,
    #[serde(rename = "service.init")]
    #[strum(serialize = "service.init")]
    ServiceInit,
    #[serde(rename = "service.ready")]
    #[strum(serialize = "service.ready")]
    ServiceReady,
    #[serde(rename = "service.failed")]
    #[strum(serialize = "service.failed")]
    ServiceFailed,
    #[serde(rename = "service.stopping")]
    #[strum(serialize = "service.stopping")]
    ServiceStopping,
    #[serde(rename = "service.stopped")]
    #[strum(serialize = "service.stopped")]
    ServiceStopped,
    #[serde(rename = "service.log")]
    #[strum(serialize = "service.log")]
    ServiceLog,

    #[serde(rename = "callback.request")]
    #[strum(serialize = "callback.request")]
    CallbackRequest,
    #[serde(rename = "callback.response")]
    #[strum(serialize = "callback.response")]
    CallbackResponse,

    #[serde(rename = "environment.failing")]
    #[strum(serialize = "environment.failing")]
    EnvironmentFailing,
    #[serde(rename = "environment.destroying")]
    #[strum(serialize = "environment.destroying")]
    EnvironmentDestroying,
    #[serde(rename = "environment.up")]
    #[strum(serialize = "environment.up")]
    EnvironmentUp,
    #[serde(rename = "environment.down")]
    #[strum(serialize = "environment.down")]
    EnvironmentDown,

    #[serde(rename = "test.note")]
    #[strum(serialize = "test.note")]
    TestNote,
    #[serde(rename = "health.check_failed")]
    #[strum(serialize = "health.check_failed")]
    HealthCheckFailed,
    #[serde(rename = "progress.stall")]
    #[strum(serialize = "progress.stall")]
    ProgressStall,

    #[serde(rename = "request.completed")]
    #[strum(serialize = "request.completed")]
    RequestCompleted,
    #[serde(rename = "connection.opened")]
    #[strum(serialize = "connection.opened")]
    ConnectionOpened,
    #[serde(rename = "connection.closed")]
    #[strum(serialize = "connection.closed")]
    ConnectionClosed,
    #[serde(rename = "grpc.call.completed")]
    #[strum(serialize = "grpc.call.completed")]
    GrpcCallCompleted,
}

/// Storage class of an event. The log keeps the two classes in separate
/// slices so that scanning for lifecycle transitions stays cheap no
/// matter how much output a service produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Lifecycle,
    Log,
}

impl EventClass {
    pub fn sse_event_name(&self) -> &'static str {
        match self {
            EventClass::Lifecycle => "lifecycle",
            EventClass::Log => "log",
        }
    }
}

impl EventType {
    pub fn class(&self) -> EventClass {
        use EventType::*;
        match self {
            ServiceLog | HealthCheckFailed | RequestCompleted | ConnectionOpened
            | ConnectionClosed | GrpcCallCompleted => EventClass::Log,
            _ => EventClass::Lifecycle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Hook,
    Start,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub request_id: String,
    pub name: String,
    pub kind: CallbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiring: Option<WiringContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl Default for LogStream {
    fn default() -> Self {
        LogStream::Stdout
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLinePayload {
    #[serde(default)]
    pub stream: LogStream,
    pub line: String,
}

/// One observed HTTP exchange on an observe-mode edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestInfo {
    pub source: String,
    pub target: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// One observed L4 connection on an observe-mode edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One observed gRPC call on an observe-mode edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcCallInfo {
    pub source: String,
    pub target: String,
    pub service: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub latency_ms: u64,
    /// Raw request frames, hex encoded, capped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_hex: Option<String>,
}

/// Startup-progress snapshot emitted when an environment makes no
/// lifecycle progress for a while: which state each service is in and
/// what it is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallSnapshot {
    pub waiting: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly monotonic per environment log, assigned at publish time.
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Artifact key for artifact.* events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<LogLinePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcCallInfo>,
    /// For environment.up: service -> ingress -> endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingresses: Option<BTreeMap<String, BTreeMap<String, Endpoint>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall: Option<StallSnapshot>,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Event {
            seq: 0,
            timestamp: None,
            kind,
            environment: String::new(),
            service: None,
            ingress: None,
            endpoint: None,
            artifact: None,
            error: None,
            callback: None,
            line: None,
            note: None,
            request: None,
            connection: None,
            grpc: None,
            ingresses: None,
            stall: None,
        }
    }

    pub fn service(kind: EventType, service: impl Into<String>) -> Self {
        let mut event = Event::new(kind);
        event.service = Some(service.into());
        event
    }

    pub fn with_ingress(mut self, ingress: impl Into<String>) -> Self {
        self.ingress = Some(ingress.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(format!("{error:#}"));
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>) -> Self {
        self.artifact = Some(key.into());
        self
    }

    pub fn class(&self) -> EventClass {
        self.kind.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_use_dots() {
        let event = Event::service(EventType::ServiceReady, "db");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "service.ready");
        assert_eq!(json["service"], "db");
        assert!(json.get("endpoint").is_none());
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(EventType::GrpcCallCompleted.to_string(), "grpc.call.completed");
        assert_eq!(EventType::EnvironmentUp.to_string(), "environment.up");
    }

    #[test]
    fn classes_split_high_volume_kinds() {
        assert_eq!(EventType::ServiceLog.class(), EventClass::Log);
        assert_eq!(EventType::RequestCompleted.class(), EventClass::Log);
        assert_eq!(EventType::ServiceReady.class(), EventClass::Lifecycle);
        assert_eq!(EventType::CallbackResponse.class(), EventClass::Lifecycle);
    }

    #[test]
    fn deserializes_client_posted_event() {
        let event: Event = serde_json::from_str(
            r#"{"type":"callback.response","callback":{"request_id":"x-y-z","name":"seed","kind":"hook"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventType::CallbackResponse);
        assert_eq!(event.callback.unwrap().request_id, "x-y-z");
    }
}
