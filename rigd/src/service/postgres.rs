//! Postgres as a first-class service type: a container specialization
//! that injects PG* connection attributes, probes readiness with
//! `pg_isready` inside the container, and executes `sql` hooks through
//! `psql`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rig_api::spec::{HookSpec, ServiceSpec};
use rig_api::wiring::Endpoint;
use serde::Deserialize;
use utils::id::EnvironmentId;

use super::container::{image_artifact, run_container_hook, ContainerRunner, ContainerRuntime};
use super::{HookParams, PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::artifact::Artifact;
use crate::environment::EnvHandle;
use crate::ready::ReadyCheck;

const DEFAULT_IMAGE: &str = "postgres:16";
const CONTAINER_PORT: u16 = 5432;
const SUPERUSER: &str = "postgres";

#[derive(Deserialize, Default)]
struct PostgresConfig {
    #[serde(default)]
    image: Option<String>,
    /// Database name; defaults to the service name.
    #[serde(default)]
    database: Option<String>,
}

impl PostgresConfig {
    fn parse(spec: &ServiceSpec) -> anyhow::Result<Self> {
        if spec.config.is_null() {
            return Ok(PostgresConfig::default());
        }
        Ok(serde_json::from_value(spec.config.clone())?)
    }

    fn image(&self) -> String {
        self.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    fn database(&self, service: &str) -> String {
        self.database.clone().unwrap_or_else(|| service.to_string())
    }
}

pub struct PostgresKind {
    runtime: Arc<ContainerRuntime>,
}

impl PostgresKind {
    pub fn new(runtime: Arc<ContainerRuntime>) -> Self {
        PostgresKind { runtime }
    }

    fn psql_args(database: &str) -> Vec<String> {
        vec![
            "psql".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-U".to_string(),
            SUPERUSER.to_string(),
            "-d".to_string(),
            database.to_string(),
        ]
    }
}

#[async_trait]
impl ServiceKind for PostgresKind {
    fn tag(&self) -> &'static str {
        "postgres"
    }

    fn artifacts(&self, spec: &ServiceSpec) -> anyhow::Result<Vec<Artifact>> {
        let config = PostgresConfig::parse(spec)?;
        let docker = self.runtime.docker()?.clone();
        Ok(vec![image_artifact(docker, config.image())])
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        let config = PostgresConfig::parse(params.spec)?;
        let database = config.database(params.service);
        let mut endpoints = params.default_endpoints();
        for endpoint in endpoints.values_mut() {
            let defaults = [
                ("PGHOST", endpoint.host.clone()),
                ("PGPORT", endpoint.port.to_string()),
                ("PGDATABASE", database.clone()),
                ("PGUSER", SUPERUSER.to_string()),
                ("PGPASSWORD", SUPERUSER.to_string()),
            ];
            for (key, value) in defaults {
                // Spec-provided attributes win over the injected ones.
                endpoint
                    .attributes
                    .entry(key.to_string())
                    .or_insert_with(|| value.into());
            }
        }
        Ok(endpoints)
    }

    fn ready_check(&self, env: &EnvHandle, service: &str) -> Option<Box<dyn ReadyCheck>> {
        Some(Box::new(PgIsReadyCheck {
            runtime: Arc::clone(&self.runtime),
            env_id: env.id,
            service: service.to_string(),
        }))
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config = PostgresConfig::parse(&params.spec)?;
        let database = config.database(&params.service);
        let mut container_env = BTreeMap::new();
        container_env.insert("POSTGRES_USER".to_string(), SUPERUSER.to_string());
        container_env.insert("POSTGRES_PASSWORD".to_string(), SUPERUSER.to_string());
        container_env.insert("POSTGRES_DB".to_string(), database);
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
        let config = PostgresConfig::parse(params.spec)?;
        let database = config.database(params.service);
        run_container_hook(&self.runtime, params, hook, Some(&Self::psql_args(&database))).await
    }
}

/// `pg_isready` inside the container beats a bare TCP probe: postgres
/// accepts connections during crash recovery long before it can serve
/// queries.
struct PgIsReadyCheck {
    runtime: Arc<ContainerRuntime>,
    env_id: EnvironmentId,
    service: String,
}

#[async_trait]
impl ReadyCheck for PgIsReadyCheck {
    async fn check(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
        let (code, output) = self
            .runtime
            .exec(
                self.env_id,
                &self.service,
                vec![
                    "pg_isready".to_string(),
                    "-U".to_string(),
                    SUPERUSER.to_string(),
                ],
            )
            .await?;
        anyhow::ensure!(code == 0, "pg_isready exited with {code}: {output}");
        Ok(())
    }
}
