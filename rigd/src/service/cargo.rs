//! Compile-then-run services: the binary is produced by the cargo
//! build resolver during the artifact phase, then supervised exactly
//! like a pre-built executable.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use rig_api::spec::ServiceSpec;
use rig_api::wiring::Endpoint;
use serde::Deserialize;

use super::process::ProcessRunner;
use super::{PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::artifact::build::CargoBuildResolver;
use crate::artifact::Artifact;

#[derive(Deserialize)]
struct CargoConfig {
    /// Module directory containing the Cargo.toml to build.
    path: Utf8PathBuf,
    /// Binary name; defaults to the module directory name.
    #[serde(default)]
    bin: Option<String>,
}

impl CargoConfig {
    fn parse(spec: &ServiceSpec) -> anyhow::Result<Self> {
        serde_json::from_value(spec.config.clone()).context("cargo config requires a \"path\"")
    }

    fn artifact_key(&self) -> String {
        match &self.bin {
            Some(bin) => format!("cargo:{}#{bin}", self.path),
            None => format!("cargo:{}", self.path),
        }
    }
}

pub struct CargoKind;

#[async_trait]
impl ServiceKind for CargoKind {
    fn tag(&self) -> &'static str {
        "cargo"
    }

    fn artifacts(&self, spec: &ServiceSpec) -> anyhow::Result<Vec<Artifact>> {
        let config = CargoConfig::parse(spec)?;
        let resolver = CargoBuildResolver::prepare(&config.path, config.bin.as_deref())?;
        Ok(vec![Artifact {
            key: config.artifact_key(),
            resolver: Arc::new(resolver),
        }])
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        Ok(params.default_endpoints())
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config = CargoConfig::parse(&params.spec)?;
        let output = params
            .artifacts
            .get(&config.artifact_key())
            .with_context(|| format!("artifact {} was not resolved", config.artifact_key()))?;
        let command = output
            .path
            .as_ref()
            .context("cargo artifact has no binary path")?
            .to_string();
        Ok(Box::new(ProcessRunner { command, params }))
    }
}
