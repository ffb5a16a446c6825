//! Temporal dev server as a service type: the auto-setup container with
//! TEMPORAL_* connection attributes on its endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rig_api::spec::{HookSpec, ServiceSpec};
use rig_api::wiring::Endpoint;
use serde::Deserialize;

use super::container::{image_artifact, run_container_hook, ContainerRunner, ContainerRuntime};
use super::{HookParams, PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::artifact::Artifact;

const DEFAULT_IMAGE: &str = "temporalio/auto-setup:latest";
const CONTAINER_PORT: u16 = 7233;

#[derive(Deserialize, Default)]
struct TemporalConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

impl TemporalConfig {
    fn parse(spec: &ServiceSpec) -> anyhow::Result<Self> {
        if spec.config.is_null() {
            return Ok(TemporalConfig::default());
        }
        Ok(serde_json::from_value(spec.config.clone())?)
    }

    fn image(&self) -> String {
        self.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    fn namespace(&self) -> String {
        self.namespace.clone().unwrap_or_else(|| "default".to_string())
    }
}

pub struct TemporalKind {
    runtime: Arc<ContainerRuntime>,
}

impl TemporalKind {
    pub fn new(runtime: Arc<ContainerRuntime>) -> Self {
        TemporalKind { runtime }
    }
}

#[async_trait]
impl ServiceKind for TemporalKind {
    fn tag(&self) -> &'static str {
        "temporal"
    }

    fn artifacts(&self, spec: &ServiceSpec) -> anyhow::Result<Vec<Artifact>> {
        let config = TemporalConfig::parse(spec)?;
        let docker = self.runtime.docker()?.clone();
        Ok(vec![image_artifact(docker, config.image())])
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        let config = TemporalConfig::parse(params.spec)?;
        let mut endpoints = params.default_endpoints();
        for endpoint in endpoints.values_mut() {
            let defaults = [
                ("TEMPORAL_ADDRESS", endpoint.address()),
                ("TEMPORAL_NAMESPACE", config.namespace()),
            ];
            for (key, value) in defaults {
                endpoint
                    .attributes
                    .entry(key.to_string())
                    .or_insert_with(|| value.into());
            }
        }
        Ok(endpoints)
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config = TemporalConfig::parse(&params.spec)?;
        let mut container_env = BTreeMap::new();
        container_env.insert("DEFAULT_NAMESPACE".to_string(), config.namespace());
        Ok(Box::new(ContainerRunner {
            runtime: Arc::clone(&self.runtime),
            image: config.image(),
            container_env,
            cmd: None,
            default_container_port: Some(CONTAINER_PORT),
            params,
        }))
    }

    async fn run_hook(&self, params: HookParams<'_>, hook: &HookSpec) -> anyhow::Result<()> {
        run_container_hook(&self.runtime, params, hook, None).await
    }
}
