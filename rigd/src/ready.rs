//! Protocol-aware readiness probes with bounded polling.

use std::time::Duration;

use async_trait::async_trait;
use rig_api::events::{Event, EventType};
use rig_api::spec::{Protocol, ReadySpec};
use tokio_util::sync::CancellationToken;

use crate::defaults::{DEFAULT_READY_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::eventlog::EventLog;

#[async_trait]
pub trait ReadyCheck: Send + Sync {
    async fn check(&self, host: &str, port: u16) -> anyhow::Result<()>;
}

/// Plain TCP connect.
pub struct TcpCheck;

#[async_trait]
impl ReadyCheck for TcpCheck {
    async fn check(&self, host: &str, port: u16) -> anyhow::Result<()> {
        tokio::net::TcpStream::connect((host, port)).await?;
        Ok(())
    }
}

/// HTTP GET expecting a 2xx.
pub struct HttpCheck {
    pub path: String,
}

#[async_trait]
impl ReadyCheck for HttpCheck {
    async fn check(&self, host: &str, port: u16) -> anyhow::Result<()> {
        let uri: hyper::Uri = format!("http://{host}:{port}{}", self.path)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid probe uri: {e}"))?;
        let response = hyper::Client::new().get(uri).await?;
        if !response.status().is_success() {
            anyhow::bail!("probe returned status {}", response.status());
        }
        Ok(())
    }
}

/// Standard gRPC health check RPC against the empty (server-wide) service.
pub struct GrpcCheck;

#[async_trait]
impl ReadyCheck for GrpcCheck {
    async fn check(&self, host: &str, port: u16) -> anyhow::Result<()> {
        use tonic_health::pb::health_check_response::ServingStatus;
        use tonic_health::pb::health_client::HealthClient;
        use tonic_health::pb::HealthCheckRequest;

        let channel = tonic::transport::Endpoint::from_shared(format!("http://{host}:{port}"))?
            .connect()
            .await?;
        let response = HealthClient::new(channel)
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await?;
        let status = response.into_inner().status();
        if status != ServingStatus::Serving {
            anyhow::bail!("grpc health status {status:?}");
        }
        Ok(())
    }
}

/// The default probe for an ingress, chosen by its declared protocol.
pub fn checker_for(protocol: Protocol, ready: Option<&ReadySpec>) -> Box<dyn ReadyCheck> {
    match protocol {
        Protocol::Tcp => Box::new(TcpCheck),
        Protocol::Http => Box::new(HttpCheck {
            path: ready
                .and_then(|r| r.path.clone())
                .unwrap_or_else(|| "/".to_string()),
        }),
        Protocol::Grpc => Box::new(GrpcCheck),
    }
}

/// Poll `checker` until it succeeds, the timeout elapses, or `cancel`
/// fires. Every failed attempt is recorded on the log as
/// `health.check_failed`; during startup these are expected noise, but
/// subscribers get the full timeline.
pub async fn poll(
    cancel: &CancellationToken,
    log: &EventLog,
    service: &str,
    ingress: &str,
    host: &str,
    port: u16,
    checker: &dyn ReadyCheck,
    ready: Option<&ReadySpec>,
) -> anyhow::Result<()> {
    let interval = ready
        .and_then(|r| r.interval_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_READY_INTERVAL);
    let timeout = ready
        .and_then(|r| r.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_READY_TIMEOUT);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = None;
    loop {
        match checker.check(host, port).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let mut event = Event::service(EventType::HealthCheckFailed, service)
                    .with_ingress(ingress)
                    .with_error(&e);
                event.note = Some(format!("{host}:{port}"));
                log.publish(event);
                last_error = Some(e);
            }
        }
        if tokio::time::Instant::now() + interval > deadline {
            let detail = last_error
                .map(|e| format!(": last error: {e:#}"))
                .unwrap_or_default();
            anyhow::bail!(
                "{service}/{ingress} not ready at {host}:{port} within {}{detail}",
                humantime::format_duration(timeout),
            );
        }
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for {service}/{ingress}"),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailN {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl ReadyCheck for FailN {
        async fn check(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("not yet")
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn poll_retries_until_success_and_logs_failures() {
        let log = EventLog::new("t");
        let cancel = CancellationToken::new();
        let checker = FailN {
            remaining: AtomicUsize::new(3),
        };
        let ready = ReadySpec {
            interval_ms: Some(5),
            timeout_ms: Some(1000),
            path: None,
        };
        poll(&cancel, &log, "db", "default", "127.0.0.1", 1, &checker, Some(&ready))
            .await
            .unwrap();
        let noise = log
            .events()
            .iter()
            .filter(|e| e.kind == EventType::HealthCheckFailed)
            .count();
        assert_eq!(noise, 3);
    }

    #[tokio::test]
    async fn poll_times_out() {
        let log = EventLog::new("t");
        let cancel = CancellationToken::new();
        let checker = FailN {
            remaining: AtomicUsize::new(usize::MAX),
        };
        let ready = ReadySpec {
            interval_ms: Some(5),
            timeout_ms: Some(30),
            path: None,
        };
        let err = poll(&cancel, &log, "db", "default", "127.0.0.1", 1, &checker, Some(&ready))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"), "{err}");
    }

    #[tokio::test]
    async fn tcp_check_connects_to_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        TcpCheck.check("127.0.0.1", port).await.unwrap();
    }
}
