//! Container-backed services. One shared `ContainerRuntime` wraps the
//! backend connection and tracks live container ids per (environment,
//! service) so readiness probes and server-side hooks can exec into the
//! right container while its runner owns it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use rig_api::events::{Event, EventType, LogLinePayload, LogStream};
use rig_api::spec::{HookSpec, ServiceSpec};
use rig_api::wiring::Endpoint;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utils::id::EnvironmentId;

use super::{HookParams, PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::artifact::image::ImagePullResolver;
use crate::artifact::Artifact;

pub struct ContainerRuntime {
    docker: Option<Docker>,
    ids: Mutex<HashMap<(EnvironmentId, String), String>>,
}

impl ContainerRuntime {
    pub fn new(docker: Option<Docker>) -> Self {
        ContainerRuntime {
            docker,
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn docker(&self) -> anyhow::Result<&Docker> {
        self.docker
            .as_ref()
            .context("no container backend available (is the docker daemon running?)")
    }

    fn register(&self, env_id: EnvironmentId, service: &str, container_id: String) {
        self.ids
            .lock()
            .unwrap()
            .insert((env_id, service.to_string()), container_id);
    }

    fn unregister(&self, env_id: EnvironmentId, service: &str) {
        self.ids.lock().unwrap().remove(&(env_id, service.to_string()));
    }

    pub fn container_id(&self, env_id: EnvironmentId, service: &str) -> Option<String> {
        self.ids
            .lock()
            .unwrap()
            .get(&(env_id, service.to_string()))
            .cloned()
    }

    /// Run a command inside the service's container; returns the exit
    /// code and combined output.
    pub async fn exec(
        &self,
        env_id: EnvironmentId,
        service: &str,
        cmd: Vec<String>,
    ) -> anyhow::Result<(i64, String)> {
        let docker = self.docker()?;
        let container_id = self
            .container_id(env_id, service)
            .with_context(|| format!("container for {service} is not running"))?;

        let exec = docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await?;

        let mut combined = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(msg)) = output.next().await {
                combined.push_str(&msg.to_string());
            }
        }

        let inspected = docker.inspect_exec(&exec.id).await?;
        Ok((inspected.exit_code.unwrap_or(-1), combined))
    }
}

#[derive(Deserialize)]
struct ContainerConfig {
    image: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
}

impl ContainerConfig {
    fn parse(spec: &ServiceSpec) -> anyhow::Result<Self> {
        serde_json::from_value(spec.config.clone()).context("container config requires an \"image\"")
    }
}

pub struct ContainerKind {
    runtime: Arc<ContainerRuntime>,
}

impl ContainerKind {
    pub fn new(runtime: Arc<ContainerRuntime>) -> Self {
        ContainerKind { runtime }
    }
}

#[async_trait]
impl ServiceKind for ContainerKind {
    fn tag(&self) -> &'static str {
        "container"
    }

    fn artifacts(&self, spec: &ServiceSpec) -> anyhow::Result<Vec<Artifact>> {
        let config = ContainerConfig::parse(spec)?;
        let docker = self.runtime.docker()?.clone();
        Ok(vec![image_artifact(docker, config.image)])
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        Ok(params.default_endpoints())
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config = ContainerConfig::parse(&params.spec)?;
        let mut container_env = params.env_vars.clone();
        container_env.extend(config.env);
        let cmd = match config.cmd {
            Some(cmd) => Some(cmd),
            None if !params.args.is_empty() => Some(params.args.clone()),
            None => None,
        };
        Ok(Box::new(ContainerRunner {
            runtime: Arc::clone(&self.runtime),
            image: config.image,
            container_env,
            cmd,
            default_container_port: None,
            params,
        }))
    }

    async fn run_hook(&self, params: HookParams<'_>, hook: &HookSpec) -> anyhow::Result<()> {
        run_container_hook(&self.runtime, params, hook, None).await
    }
}

pub(crate) fn image_artifact(docker: Docker, reference: String) -> Artifact {
    Artifact {
        key: format!("image:{reference}"),
        resolver: Arc::new(ImagePullResolver::new(docker, reference)),
    }
}

/// Shared hook execution for container-backed kinds: `exec` runs as-is,
/// `sql` is rewritten to `psql` when `psql_args` is provided.
pub(crate) async fn run_container_hook(
    runtime: &ContainerRuntime,
    params: HookParams<'_>,
    hook: &HookSpec,
    psql_args: Option<&[String]>,
) -> anyhow::Result<()> {
    match hook {
        HookSpec::Exec { command } => {
            let (code, output) = runtime
                .exec(params.env.id, params.service, command.clone())
                .await?;
            anyhow::ensure!(code == 0, "exec hook exited with {code}: {output}");
            Ok(())
        }
        HookSpec::Sql { statements } => {
            let psql_args = psql_args
                .with_context(|| format!("service {} cannot run sql hooks", params.service))?;
            for statement in statements {
                let mut cmd: Vec<String> = psql_args.to_vec();
                cmd.push("-c".to_string());
                cmd.push(statement.clone());
                let (code, output) = runtime.exec(params.env.id, params.service, cmd).await?;
                anyhow::ensure!(
                    code == 0,
                    "sql hook statement {statement:?} exited with {code}: {output}"
                );
            }
            Ok(())
        }
        HookSpec::ClientFunction { .. } => {
            unreachable!("client hooks are dispatched over the callback channel")
        }
    }
}

pub(crate) struct ContainerRunner {
    pub runtime: Arc<ContainerRuntime>,
    pub image: String,
    pub container_env: BTreeMap<String, String>,
    pub cmd: Option<Vec<String>>,
    /// Fallback container-side port for ingresses that do not declare
    /// one (5432 for postgres, 7233 for temporal).
    pub default_container_port: Option<u16>,
    pub params: RunnerParams,
}

impl ContainerRunner {
    fn container_name(&self) -> String {
        format!("rig-{}-{}", self.params.env.id, self.params.service)
    }

    /// container port -> host port, from the ingress specs and the
    /// published endpoints.
    fn port_bindings(&self) -> HashMap<String, Option<Vec<PortBinding>>> {
        let mut bindings = HashMap::new();
        for (name, ingress) in &self.params.spec.ingresses {
            let Some(endpoint) = self.params.endpoints.get(name) else {
                continue;
            };
            let container_port = ingress
                .container_port
                .or(self.default_container_port)
                .unwrap_or(endpoint.port);
            bindings.insert(
                format!("{container_port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(endpoint.port.to_string()),
                }]),
            );
        }
        bindings
    }
}

#[async_trait]
impl Runnable for ContainerRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let docker = self.runtime.docker()?.clone();
        let env_id = self.params.env.id;
        let service = self.params.service.clone();
        let name = self.container_name();

        // A previous daemon may have crashed and left the name behind.
        let _ = docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let env: Vec<String> = self
            .container_env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let port_bindings = self.port_bindings();
        let exposed_ports: Vec<String> = port_bindings.keys().cloned().collect();

        info!("starting container {name} ({})", self.image);
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.clone()),
                    ..Default::default()
                }),
                ContainerCreateBody {
                    image: Some(self.image.clone()),
                    env: Some(env),
                    cmd: self.cmd.clone(),
                    exposed_ports: Some(exposed_ports),
                    host_config: Some(HostConfig {
                        port_bindings: Some(port_bindings),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("create container {name}"))?;
        let container_id = created.id;
        self.runtime.register(env_id, &service, container_id.clone());

        let result = async {
            docker
                .start_container(&container_id, None)
                .await
                .with_context(|| format!("start container {name}"))?;

            // Forward container output into the log.
            let log = Arc::clone(self.params.log());
            let log_service = service.clone();
            let mut log_stream = docker.logs(
                &container_id,
                Some(LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let log_task = tokio::spawn(async move {
                while let Some(Ok(output)) = log_stream.next().await {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    for line in String::from_utf8_lossy(&message).lines() {
                        let mut event = Event::service(EventType::ServiceLog, log_service.clone());
                        event.line = Some(LogLinePayload {
                            stream,
                            line: line.to_string(),
                        });
                        log.publish(event);
                    }
                }
            });

            let mut wait = docker.wait_container(&container_id, None::<WaitContainerOptions>);
            let exited = tokio::select! {
                _ = cancel.cancelled() => None,
                status = wait.next() => Some(status),
            };
            log_task.abort();

            match exited {
                None => {
                    debug!("stopping container {name}");
                    Ok(())
                }
                Some(Some(Ok(status))) => {
                    if status.status_code == 0 {
                        debug!("container {name} exited cleanly");
                        Ok(())
                    } else {
                        anyhow::bail!("container {name} exited with status {}", status.status_code)
                    }
                }
                Some(Some(Err(e))) => Err(anyhow::Error::from(e).context(format!("wait for {name}"))),
                Some(None) => anyhow::bail!("container backend closed the wait stream for {name}"),
            }
        }
        .await;

        self.runtime.unregister(env_id, &service);
        if let Err(e) = docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!("failed to remove container {name}: {e}");
        }

        result
    }
}
