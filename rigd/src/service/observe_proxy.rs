//! Standalone proxy service: relays each of its ingresses to a fixed
//! target and reports traffic events. The orchestrator interposes these
//! relays implicitly in observe mode; declaring the type explicitly
//! gives a spec a hand-placed observation point.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use rig_api::spec::ServiceSpec;
use rig_api::wiring::Endpoint;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::observe::{self, EdgeLabels, EXTERNAL_SOURCE};

#[derive(Deserialize)]
struct ObserveProxyConfig {
    target_host: String,
    target_port: u16,
    /// Label used as the `target` of emitted events; defaults to the
    /// target address.
    #[serde(default)]
    target: Option<String>,
}

impl ObserveProxyConfig {
    fn parse(spec: &ServiceSpec) -> anyhow::Result<Self> {
        serde_json::from_value(spec.config.clone())
            .context("observe-proxy config requires \"target_host\" and \"target_port\"")
    }
}

pub struct ObserveProxyKind;

#[async_trait]
impl ServiceKind for ObserveProxyKind {
    fn tag(&self) -> &'static str {
        "observe-proxy"
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        Ok(params.default_endpoints())
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config = ObserveProxyConfig::parse(&params.spec)?;
        Ok(Box::new(ObserveProxyRunner { config, params }))
    }
}

struct ObserveProxyRunner {
    config: ObserveProxyConfig,
    params: RunnerParams,
}

#[async_trait]
impl Runnable for ObserveProxyRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let target_label = self
            .config
            .target
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.config.target_host, self.config.target_port));

        for (name, endpoint) in &self.params.endpoints {
            let backing = Endpoint::new(
                self.config.target_host.clone(),
                self.config.target_port,
                endpoint.protocol,
            );
            observe::spawn_relay(
                cancel.clone(),
                std::sync::Arc::clone(self.params.log()),
                EdgeLabels {
                    source: EXTERNAL_SOURCE.to_string(),
                    target: target_label.clone(),
                },
                endpoint.port,
                backing,
            )
            .with_context(|| format!("start relay for ingress {name}"))?;
        }

        // The relays live until teardown.
        cancel.cancelled().await;
        Ok(())
    }
}
