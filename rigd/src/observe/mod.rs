//! Observe mode: transparent traffic proxies on every edge.
//!
//! When an environment sets `observe`, the orchestrator reserves one
//! proxy port per ingress (the address external clients see) and one per
//! egress edge (the address each consumer sees), and the lifecycles
//! spawn protocol-appropriate relays behind those ports. Every relay
//! reports what flows through it as events on the environment log.

pub mod grpc;
pub mod http;
pub mod tcp;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use rig_api::spec::{EnvironmentSpec, Protocol};
use rig_api::wiring::Endpoint;
use tokio_util::sync::CancellationToken;

use crate::eventlog::EventLog;
use crate::ports::PortAllocator;

/// Marker used as the `source` of events on external (ingress-side)
/// edges, where the peer is the test itself or anything else outside
/// the environment.
pub const EXTERNAL_SOURCE: &str = "external";

/// Capture cap for request/response bodies and gRPC frames.
pub const BODY_CAPTURE_LIMIT: usize = 64 * 1024;

/// Attribution labels for one observed edge.
#[derive(Debug, Clone)]
pub struct EdgeLabels {
    pub source: String,
    pub target: String,
}

/// Proxy port reservations for one environment, made before any service
/// publishes so that lifecycles can hand out proxied addresses
/// deterministically.
pub struct ObservePlan {
    /// (service, ingress) -> external proxy port.
    external: BTreeMap<(String, String), u16>,
    /// (consumer service, egress name) -> edge proxy port.
    edges: BTreeMap<(String, String), u16>,
    /// (service, ingress) -> the real backing endpoint, recorded at
    /// publish time. Edge proxies forward here, not to the external
    /// proxy, so a call crosses the observe plane exactly once.
    backings: std::sync::Mutex<BTreeMap<(String, String), Endpoint>>,
}

impl ObservePlan {
    /// Reserve proxy ports for every ingress and every egress edge in
    /// the spec, keyed to the environment's release key.
    pub fn build(
        spec: &EnvironmentSpec,
        ports: &PortAllocator,
        release_key: &str,
    ) -> anyhow::Result<ObservePlan> {
        let mut external_keys = Vec::new();
        let mut edge_keys = Vec::new();
        for (service_name, service) in &spec.services {
            for ingress_name in service.ingresses.keys() {
                external_keys.push((service_name.clone(), ingress_name.clone()));
            }
            for egress_name in service.egresses.keys() {
                edge_keys.push((service_name.clone(), egress_name.clone()));
            }
        }

        let allocated = ports
            .allocate(release_key, external_keys.len() + edge_keys.len())
            .context("allocate observe proxy ports")?;
        let (external_ports, edge_ports) = allocated.split_at(external_keys.len());

        Ok(ObservePlan {
            external: external_keys.into_iter().zip(external_ports.iter().copied()).collect(),
            edges: edge_keys.into_iter().zip(edge_ports.iter().copied()).collect(),
            backings: Default::default(),
        })
    }

    pub fn external_port(&self, service: &str, ingress: &str) -> Option<u16> {
        self.external
            .get(&(service.to_string(), ingress.to_string()))
            .copied()
    }

    pub fn edge_port(&self, consumer: &str, egress: &str) -> Option<u16> {
        self.edges
            .get(&(consumer.to_string(), egress.to_string()))
            .copied()
    }

    pub fn record_backing(&self, service: &str, ingress: &str, endpoint: Endpoint) {
        self.backings
            .lock()
            .unwrap()
            .insert((service.to_string(), ingress.to_string()), endpoint);
    }

    /// The real endpoint behind a published ingress. Present for any
    /// ingress whose owner has passed its publish step; egress waiters
    /// only ask after observing `ingress.published`, which is later.
    pub fn backing(&self, service: &str, ingress: &str) -> Option<Endpoint> {
        self.backings
            .lock()
            .unwrap()
            .get(&(service.to_string(), ingress.to_string()))
            .cloned()
    }
}

/// The endpoint consumers should see for a proxied backing endpoint:
/// same protocol and attributes, the proxy's port, and address-bearing
/// attributes rewritten so tools that dial an attribute (e.g.
/// TEMPORAL_ADDRESS) traverse the observe plane too.
pub fn proxied_endpoint(backing: &Endpoint, proxy_port: u16) -> Endpoint {
    let mut endpoint = Endpoint::new(backing.host.clone(), proxy_port, backing.protocol);
    let backing_address = backing.address();
    let proxy_address = endpoint.address();
    endpoint.attributes = backing
        .attributes
        .iter()
        .map(|(key, value)| {
            let rewritten = match value.as_str() {
                Some(s) if s == backing_address => proxy_address.clone().into(),
                Some(s) if s == backing.port.to_string() => proxy_port.to_string().into(),
                _ => value.clone(),
            };
            (key.clone(), rewritten)
        })
        .collect();
    endpoint
}

/// Bind the relay listener for one edge and spawn the protocol-matching
/// relay behind it. TCP relaying is the fallback for anything that is
/// not HTTP or gRPC.
pub fn spawn_relay(
    cancel: CancellationToken,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    port: u16,
    backing: Endpoint,
) -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("bind observe proxy port {port}"))?;
    listener.set_nonblocking(true)?;

    match backing.protocol {
        Protocol::Http => http::spawn(cancel, log, labels, listener, backing),
        Protocol::Grpc => grpc::spawn(cancel, log, labels, listener, backing),
        Protocol::Tcp => tcp::spawn(cancel, log, labels, listener, backing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_api::spec::{EgressSpec, IngressSpec, ServiceSpec};

    fn spec() -> EnvironmentSpec {
        let mut db = ServiceSpec {
            kind: "postgres".to_string(),
            config: serde_json::Value::Null,
            args: Vec::new(),
            ingresses: BTreeMap::new(),
            egresses: BTreeMap::new(),
            prestart: Vec::new(),
            init: Vec::new(),
        };
        db.ingresses.insert("default".to_string(), IngressSpec::default());
        let mut api = db.clone();
        api.kind = "process".to_string();
        api.egresses.insert(
            "database".to_string(),
            EgressSpec {
                service: "db".to_string(),
                ingress: "default".to_string(),
            },
        );
        EnvironmentSpec {
            name: "t".to_string(),
            services: [("db".to_string(), db), ("api".to_string(), api)]
                .into_iter()
                .collect(),
            observe: true,
        }
    }

    #[test]
    fn plan_reserves_one_port_per_ingress_and_edge() {
        let ports = PortAllocator::new();
        let plan = ObservePlan::build(&spec(), &ports, "env-1").unwrap();
        let a = plan.external_port("db", "default").unwrap();
        let b = plan.external_port("api", "default").unwrap();
        let c = plan.edge_port("api", "database").unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert!(plan.external_port("api", "missing").is_none());
        assert_eq!(ports.assigned("env-1").len(), 3);
    }

    #[test]
    fn proxied_endpoint_rewrites_address_attributes() {
        let mut backing = Endpoint::new("127.0.0.1", 7233, Protocol::Grpc);
        backing
            .attributes
            .insert("TEMPORAL_ADDRESS".to_string(), "127.0.0.1:7233".into());
        backing
            .attributes
            .insert("TEMPORAL_NAMESPACE".to_string(), "default".into());

        let proxied = proxied_endpoint(&backing, 9000);
        assert_eq!(proxied.port, 9000);
        assert_eq!(
            proxied.attributes["TEMPORAL_ADDRESS"],
            serde_json::json!("127.0.0.1:9000")
        );
        assert_eq!(
            proxied.attributes["TEMPORAL_NAMESPACE"],
            serde_json::json!("default")
        );
    }
}
