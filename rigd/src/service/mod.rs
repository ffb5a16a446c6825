//! Pluggable service kinds. A kind turns one `ServiceSpec` into published
//! endpoints and a runnable unit, and may contribute artifacts, a custom
//! readiness probe, and server-side hook execution.

pub mod cargo;
pub mod client;
pub mod container;
pub mod observe_proxy;
pub mod postgres;
pub mod process;
pub mod temporal;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use camino::Utf8PathBuf;
use rig_api::spec::{IngressSpec, ServiceSpec};
use rig_api::wiring::{Endpoint, WiringContext};
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, Output};
use crate::environment::EnvHandle;
use crate::eventlog::EventLog;
use crate::ready::ReadyCheck;

/// Inputs to the publish step: the service's ingresses in deterministic
/// (sorted-name) order, paired index-wise with the allocated ports.
pub struct PublishParams<'a> {
    pub service: &'a str,
    pub spec: &'a ServiceSpec,
    pub ingresses: &'a [(String, IngressSpec)],
    pub ports: &'a [u16],
}

impl PublishParams<'_> {
    /// The default mapping: loopback endpoints in sorted ingress order,
    /// attributes taken from the ingress spec.
    pub fn default_endpoints(&self) -> BTreeMap<String, Endpoint> {
        self.ingresses
            .iter()
            .zip(self.ports)
            .map(|((name, ingress), port)| {
                let mut endpoint = Endpoint::new("127.0.0.1", *port, ingress.protocol);
                endpoint.attributes = ingress.attributes.clone();
                (name.clone(), endpoint)
            })
            .collect()
    }
}

/// Everything a runner needs. Owned: the runner moves into its own task.
pub struct RunnerParams {
    pub env: Arc<EnvHandle>,
    pub service: String,
    pub spec: ServiceSpec,
    /// Args after `$VAR` template expansion.
    pub args: Vec<String>,
    /// Environment variables rendered from the wiring.
    pub env_vars: BTreeMap<String, String>,
    pub wiring: WiringContext,
    /// The service's own endpoints as the service must bind them (the
    /// backing endpoints, not any observe proxy in front of them).
    pub endpoints: BTreeMap<String, Endpoint>,
    pub artifacts: Arc<HashMap<String, Output>>,
    pub service_dir: Utf8PathBuf,
}

impl RunnerParams {
    pub fn log(&self) -> &Arc<EventLog> {
        &self.env.log
    }
}

/// Inputs to a server-side hook (sql/exec) execution.
pub struct HookParams<'a> {
    pub env: &'a EnvHandle,
    pub service: &'a str,
    pub spec: &'a ServiceSpec,
    pub wiring: &'a WiringContext,
}

/// A started service. `run` blocks until the service exits on its own
/// (Ok for exit code zero, Err otherwise) or `cancel` fires, in which
/// case the unit is torn down and `run` returns Ok.
#[async_trait]
pub trait Runnable: Send {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ServiceKind: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Artifacts that must exist before the service can start. Declared
    /// during orchestration setup, resolved before any lifecycle runs.
    fn artifacts(&self, _spec: &ServiceSpec) -> anyhow::Result<Vec<Artifact>> {
        Ok(Vec::new())
    }

    /// Map ingresses to endpoints. Built-in types enrich attributes here
    /// (PG*, TEMPORAL_*).
    async fn publish(&self, params: PublishParams<'_>) -> anyhow::Result<BTreeMap<String, Endpoint>>;

    /// Override the protocol-based readiness probe.
    fn ready_check(&self, _env: &EnvHandle, _service: &str) -> Option<Box<dyn ReadyCheck>> {
        None
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>>;

    /// Execute a server-side hook (sql/exec). Kinds without an execution
    /// surface reject them; client-function hooks never reach this.
    async fn run_hook(
        &self,
        _params: HookParams<'_>,
        hook: &rig_api::spec::HookSpec,
    ) -> anyhow::Result<()> {
        anyhow::bail!(
            "service type {:?} cannot execute {} hooks",
            self.tag(),
            hook.label()
        )
    }
}

/// The registry: type tag -> implementation. Unknown tags are a
/// validation error at POST time.
pub struct ServiceTypes {
    map: BTreeMap<&'static str, Arc<dyn ServiceKind>>,
}

impl ServiceTypes {
    pub fn builtin(docker: Option<Docker>) -> Self {
        let containers = Arc::new(container::ContainerRuntime::new(docker));
        let mut map: BTreeMap<&'static str, Arc<dyn ServiceKind>> = BTreeMap::new();
        for kind in [
            Arc::new(process::ProcessKind) as Arc<dyn ServiceKind>,
            Arc::new(cargo::CargoKind),
            Arc::new(client::ClientFunctionKind),
            Arc::new(observe_proxy::ObserveProxyKind),
            Arc::new(container::ContainerKind::new(Arc::clone(&containers))),
            Arc::new(postgres::PostgresKind::new(Arc::clone(&containers))),
            Arc::new(temporal::TemporalKind::new(containers)),
        ] {
            map.insert(kind.tag(), kind);
        }
        ServiceTypes { map }
    }

    /// Register an additional kind, e.g. a custom type provided by an
    /// embedding test harness. Replaces any previous kind with the same
    /// tag.
    pub fn register(&mut self, kind: Arc<dyn ServiceKind>) {
        self.map.insert(kind.tag(), kind);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn ServiceKind>> {
        self.map.get(tag).cloned()
    }

    pub fn known_tags(&self) -> HashSet<&str> {
        self.map.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_api::spec::Protocol;

    #[test]
    fn builtin_registry_has_all_required_tags() {
        let types = ServiceTypes::builtin(None);
        for tag in [
            "process",
            "cargo",
            "function",
            "container",
            "postgres",
            "temporal",
            "observe-proxy",
        ] {
            assert!(types.get(tag).is_some(), "missing type {tag}");
        }
        assert!(types.get("widget").is_none());
    }

    #[test]
    fn default_endpoints_pair_sorted_ingresses_with_ports() {
        let spec = ServiceSpec {
            kind: "process".to_string(),
            config: serde_json::Value::Null,
            args: Vec::new(),
            ingresses: BTreeMap::new(),
            egresses: BTreeMap::new(),
            prestart: Vec::new(),
            init: Vec::new(),
        };
        let ingresses = vec![
            ("default".to_string(), IngressSpec {
                protocol: Protocol::Http,
                ..Default::default()
            }),
            ("metrics".to_string(), IngressSpec::default()),
        ];
        let ports = [8000, 8001];
        let params = PublishParams {
            service: "api",
            spec: &spec,
            ingresses: &ingresses,
            ports: &ports,
        };
        let endpoints = params.default_endpoints();
        assert_eq!(endpoints["default"].port, 8000);
        assert_eq!(endpoints["default"].protocol, Protocol::Http);
        assert_eq!(endpoints["metrics"].port, 8001);
        assert_eq!(endpoints["metrics"].protocol, Protocol::Tcp);
    }
}
