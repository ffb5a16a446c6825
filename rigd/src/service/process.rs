//! Pre-built executable services: spawn a user binary, forward its
//! output into the event log, and supervise it until exit or teardown.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rig_api::events::{Event, EventType, LogLinePayload, LogStream};
use rig_api::wiring::Endpoint;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::eventlog::EventLog;

#[derive(Deserialize)]
struct ProcessConfig {
    command: String,
}

pub struct ProcessKind;

#[async_trait]
impl ServiceKind for ProcessKind {
    fn tag(&self) -> &'static str {
        "process"
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        Ok(params.default_endpoints())
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        let config: ProcessConfig = serde_json::from_value(params.spec.config.clone())
            .context("process config requires a \"command\"")?;
        Ok(Box::new(ProcessRunner {
            command: config.command,
            params,
        }))
    }
}

pub(crate) struct ProcessRunner {
    pub command: String,
    pub params: RunnerParams,
}

/// Read one stdio stream line-wise into the log's high-volume slice.
pub(crate) fn forward_lines<R>(
    log: Arc<EventLog>,
    service: String,
    stream: LogStream,
    reader: R,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut event = Event::service(EventType::ServiceLog, service.clone());
            event.line = Some(LogLinePayload { stream, line });
            log.publish(event);
        }
    })
}

#[async_trait]
impl Runnable for ProcessRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let ProcessRunner { command, params } = *self;
        info!("starting {} ({command})", params.service);

        let mut child = tokio::process::Command::new(&command)
            .args(&params.args)
            .envs(&params.env_vars)
            .current_dir(&params.service_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {command}"))?;

        let stdout = forward_lines(
            Arc::clone(params.log()),
            params.service.clone(),
            LogStream::Stdout,
            child.stdout.take().expect("stdout was piped"),
        );
        let stderr = forward_lines(
            Arc::clone(params.log()),
            params.service.clone(),
            LogStream::Stderr,
            child.stderr.take().expect("stderr was piped"),
        );

        let status = tokio::select! {
            status = child.wait() => Some(status.context("wait for child")?),
            _ = cancel.cancelled() => None,
        };

        match status {
            Some(status) => {
                // Drain whatever output is still buffered.
                let _ = stdout.await;
                let _ = stderr.await;
                if status.success() {
                    debug!("{} exited cleanly", params.service);
                    Ok(())
                } else {
                    anyhow::bail!("{} exited with {status}", params.service)
                }
            }
            None => {
                debug!("stopping {}", params.service);
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout.abort();
                stderr.abort();
                Ok(())
            }
        }
    }
}
