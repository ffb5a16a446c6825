//! HTTP request/response bodies and the persisted log header.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utils::id::EnvironmentId;

use crate::events::LogStream;
use crate::wiring::Endpoint;

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvironmentCreateResponse {
    pub id: EnvironmentId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationErrorsBody {
    pub error: String,
    pub validation_errors: Vec<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Healthy,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedService {
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ingresses: BTreeMap<String, Endpoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub egresses: BTreeMap<String, Endpoint>,
}

/// Snapshot of an environment, folded from its lifecycle log.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolvedEnvironment {
    pub id: EnvironmentId,
    pub name: String,
    pub services: BTreeMap<String, ResolvedService>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub id: EnvironmentId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub version: String,
}

/// The unified client -> server channel: everything a client may POST to
/// `/environments/{id}/events`, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEventBody {
    /// Answer to a `callback.request` the server is blocked on.
    #[serde(rename = "callback.response")]
    CallbackResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An in-test service function returned before teardown.
    #[serde(rename = "service.error")]
    ServiceError { service: String, error: String },
    /// Free-form marker from the test, recorded in the lifecycle log.
    #[serde(rename = "test.note")]
    TestNote {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        note: String,
    },
    /// A log line produced by a client-run service.
    #[serde(rename = "service.log")]
    ServiceLog {
        service: String,
        #[serde(default)]
        stream: LogStream,
        line: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Crashed,
}

/// First line of a persisted environment log.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub environment: String,
    pub outcome: Outcome,
    pub services: Vec<String>,
    pub duration_ms: u64,
}

impl LogHeader {
    pub const KIND: &'static str = "log.header";

    pub fn new(environment: String, outcome: Outcome, services: Vec<String>, duration_ms: u64) -> Self {
        LogHeader {
            kind: Self::KIND.to_string(),
            environment,
            outcome,
            services,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_body_discriminates_on_type() {
        let body: ClientEventBody = serde_json::from_str(
            r#"{"type":"callback.response","request_id":"0a-db-seed"}"#,
        )
        .unwrap();
        match body {
            ClientEventBody::CallbackResponse { request_id, error } => {
                assert_eq!(request_id, "0a-db-seed");
                assert!(error.is_none());
            }
            other => panic!("unexpected variant {other:?}"),
        }

        let body: ClientEventBody =
            serde_json::from_str(r#"{"type":"service.error","service":"worker","error":"boom"}"#)
                .unwrap();
        assert!(matches!(body, ClientEventBody::ServiceError { .. }));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&ServiceStatus::Ready).unwrap(), "\"ready\"");
        assert_eq!(ServiceStatus::Stopping.to_string(), "stopping");
        assert_eq!(serde_json::to_string(&Outcome::Crashed).unwrap(), "\"crashed\"");
    }
}
