//! The environment document: what a test asks the daemon to provision.
//!
//! The document is immutable once accepted. Everything the daemon does is
//! derived from it plus the service type registry; validation therefore
//! happens once, at `POST /environments` time, against the set of type
//! tags the daemon knows.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Human-readable name, used in the persisted log file name and the
    /// `environment` field of every event.
    pub name: String,
    pub services: BTreeMap<String, ServiceSpec>,
    /// Interpose traffic proxies on every ingress and egress edge and
    /// emit per-request/per-connection events.
    #[serde(default)]
    pub observe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service type tag, resolved against the daemon's type registry
    /// ("process", "cargo", "function", "container", "postgres", ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific configuration, passed through opaquely.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ingresses: BTreeMap<String, IngressSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub egresses: BTreeMap<String, EgressSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<HookSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Grpc,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub protocol: Protocol,
    /// For container-backed services: the port inside the container that
    /// this ingress maps to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadySpec>,
    /// Arbitrary attributes merged into the published endpoint. Built-in
    /// types add their own on top (PG*, TEMPORAL_*).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Overrides for the readiness probe of a single ingress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// HTTP probe path, defaults to "/".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressSpec {
    pub service: String,
    pub ingress: String,
}

/// An action executed at a fixed lifecycle point. Prestart hooks run
/// before the service starts; init hooks run after it passes its health
/// probes and before it is reported ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookSpec {
    /// Run a named function inside the test process, dispatched over the
    /// callback channel.
    ClientFunction { name: String },
    /// Execute SQL statements inside the service's container, in order.
    Sql { statements: Vec<String> },
    /// Execute a command inside the service's container.
    Exec { command: Vec<String> },
}

impl HookSpec {
    pub fn label(&self) -> String {
        match self {
            HookSpec::ClientFunction { name } => format!("client:{name}"),
            HookSpec::Sql { statements } => format!("sql[{}]", statements.len()),
            HookSpec::Exec { command } => {
                format!("exec:{}", command.first().map(String::as_str).unwrap_or(""))
            }
        }
    }
}

impl EnvironmentSpec {
    /// Validate the document against the set of service type tags the
    /// daemon knows. Returns every problem found, not just the first, so
    /// a client can fix its spec in one round trip.
    pub fn validate(&self, known_types: &HashSet<&str>) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("environment name must not be empty".to_string());
        }
        if self.services.is_empty() {
            errors.push("environment must declare at least one service".to_string());
        }

        for (name, service) in &self.services {
            if name.is_empty() {
                errors.push("service name must not be empty".to_string());
            }
            if !known_types.contains(service.kind.as_str()) {
                errors.push(format!("service {name}: unknown type {:?}", service.kind));
            }
            for (egress_name, egress) in &service.egresses {
                match self.services.get(&egress.service) {
                    None => errors.push(format!(
                        "service {name}: egress {egress_name} targets unknown service {:?}",
                        egress.service
                    )),
                    Some(target) => {
                        if !target.ingresses.contains_key(&egress.ingress) {
                            errors.push(format!(
                                "service {name}: egress {egress_name} targets {}.{}, \
                                 but {} declares no such ingress",
                                egress.service, egress.ingress, egress.service
                            ));
                        }
                    }
                }
            }
        }

        if let Some(cycle) = self.find_dependency_cycle() {
            errors.push(format!(
                "egress dependencies form a cycle: {}",
                cycle.join(" -> ")
            ));
        }

        errors
    }

    /// Depth-first search over the egress graph. A cycle would deadlock
    /// every participant at the wait-egresses step, so it is rejected up
    /// front.
    fn find_dependency_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            spec: &EnvironmentSpec,
            node: &str,
            marks: &mut BTreeMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| n == node).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node.to_string(), Mark::Visiting);
            stack.push(node.to_string());
            if let Some(service) = spec.services.get(node) {
                for egress in service.egresses.values() {
                    if let Some(cycle) = visit(spec, &egress.service, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node.to_string(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        for name in self.services.keys() {
            if let Some(cycle) = visit(self, name, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> HashSet<&'static str> {
        ["process", "postgres"].into_iter().collect()
    }

    fn service(kind: &str) -> ServiceSpec {
        ServiceSpec {
            kind: kind.to_string(),
            config: serde_json::Value::Null,
            args: Vec::new(),
            ingresses: BTreeMap::new(),
            egresses: BTreeMap::new(),
            prestart: Vec::new(),
            init: Vec::new(),
        }
    }

    #[test]
    fn empty_environment_is_rejected() {
        let spec = EnvironmentSpec {
            name: "t".to_string(),
            services: BTreeMap::new(),
            observe: false,
        };
        let errors = spec.validate(&known());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("at least one service"));
    }

    #[test]
    fn unknown_type_and_dangling_egress() {
        let mut api = service("widget");
        api.egresses.insert(
            "database".to_string(),
            EgressSpec {
                service: "db".to_string(),
                ingress: "default".to_string(),
            },
        );
        let spec = EnvironmentSpec {
            name: "t".to_string(),
            services: [("api".to_string(), api)].into_iter().collect(),
            observe: false,
        };
        let errors = spec.validate(&known());
        assert!(errors.iter().any(|e| e.contains("unknown type")));
        assert!(errors.iter().any(|e| e.contains("unknown service")));
    }

    #[test]
    fn egress_must_reference_declared_ingress() {
        let mut db = service("postgres");
        db.ingresses.insert("default".to_string(), IngressSpec::default());
        let mut api = service("process");
        api.egresses.insert(
            "database".to_string(),
            EgressSpec {
                service: "db".to_string(),
                ingress: "admin".to_string(),
            },
        );
        let spec = EnvironmentSpec {
            name: "t".to_string(),
            services: [("api".to_string(), api), ("db".to_string(), db)]
                .into_iter()
                .collect(),
            observe: false,
        };
        let errors = spec.validate(&known());
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("no such ingress"));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let mut a = service("process");
        a.ingresses.insert("default".to_string(), IngressSpec::default());
        a.egresses.insert(
            "peer".to_string(),
            EgressSpec {
                service: "b".to_string(),
                ingress: "default".to_string(),
            },
        );
        let mut b = service("process");
        b.ingresses.insert("default".to_string(), IngressSpec::default());
        b.egresses.insert(
            "peer".to_string(),
            EgressSpec {
                service: "a".to_string(),
                ingress: "default".to_string(),
            },
        );
        let spec = EnvironmentSpec {
            name: "t".to_string(),
            services: [("a".to_string(), a), ("b".to_string(), b)]
                .into_iter()
                .collect(),
            observe: false,
        };
        let errors = spec.validate(&known());
        assert!(errors.iter().any(|e| e.contains("cycle")), "{errors:?}");
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let doc = serde_json::json!({
            "name": "shop",
            "observe": true,
            "services": {
                "db": {
                    "type": "postgres",
                    "init": [
                        {"kind": "sql", "statements": ["CREATE TABLE t(id INT)"]},
                        {"kind": "client_function", "name": "seed"}
                    ],
                    "ingresses": {"default": {"protocol": "tcp", "container_port": 5432}}
                },
                "api": {
                    "type": "process",
                    "config": {"command": "/usr/bin/api"},
                    "args": ["--db", "$DATABASE_HOST"],
                    "ingresses": {"default": {"protocol": "http", "ready": {"path": "/health"}}},
                    "egresses": {"database": {"service": "db", "ingress": "default"}}
                }
            }
        });
        let spec: EnvironmentSpec = serde_json::from_value(doc.clone()).unwrap();
        assert!(spec.observe);
        assert_eq!(spec.services.len(), 2);
        let reencoded = serde_json::to_value(&spec).unwrap();
        let reparsed: EnvironmentSpec = serde_json::from_value(reencoded).unwrap();
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            serde_json::to_value(&reparsed).unwrap()
        );
        match &spec.services["db"].init[1] {
            HookSpec::ClientFunction { name } => assert_eq!(name, "seed"),
            other => panic!("unexpected hook {other:?}"),
        }
    }
}
