//! Byte-for-byte L4 relay: the fallback for every protocol the observe
//! plane does not understand. Emits `connection.opened` on accept and
//! `connection.closed` with byte counts and duration when either side
//! hangs up.

use std::sync::Arc;
use std::time::Instant;

use rig_api::events::{ConnectionInfo, Event, EventType};
use rig_api::wiring::Endpoint;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::EdgeLabels;
use crate::eventlog::EventLog;

pub fn spawn(
    cancel: CancellationToken,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    listener: std::net::TcpListener,
    backing: Endpoint,
) -> anyhow::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (client, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("observe accept failed: {e}");
                    continue;
                }
            };
            debug!("observed connection from {peer} to {}", labels.target);
            tokio::spawn(relay_connection(
                cancel.clone(),
                Arc::clone(&log),
                labels.clone(),
                client,
                backing.clone(),
            ));
        }
    });
    Ok(())
}

async fn relay_connection(
    cancel: CancellationToken,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    client: TcpStream,
    backing: Endpoint,
) {
    let started_at = Instant::now();
    let mut event = Event::new(EventType::ConnectionOpened);
    event.connection = Some(ConnectionInfo {
        source: labels.source.clone(),
        target: labels.target.clone(),
        bytes_in: 0,
        bytes_out: 0,
        duration_ms: None,
    });
    log.publish(event);

    let (bytes_in, bytes_out) = match TcpStream::connect((backing.host.as_str(), backing.port)).await
    {
        Ok(upstream) => {
            let (mut client_read, mut client_write) = client.into_split();
            let (mut upstream_read, mut upstream_write) = upstream.into_split();
            let forward = async {
                tokio::join!(
                    tokio::io::copy(&mut client_read, &mut upstream_write),
                    tokio::io::copy(&mut upstream_read, &mut client_write),
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => (0, 0),
                (to_target, to_client) = forward => {
                    (to_target.unwrap_or(0), to_client.unwrap_or(0))
                }
            }
        }
        Err(e) => {
            debug!("observe relay could not reach {}: {e}", backing.address());
            (0, 0)
        }
    };

    let mut event = Event::new(EventType::ConnectionClosed);
    event.connection = Some(ConnectionInfo {
        source: labels.source,
        target: labels.target,
        bytes_in,
        bytes_out,
        duration_ms: Some(started_at.elapsed().as_millis() as u64),
    });
    log.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_bytes_and_reports_counts() {
        let log = EventLog::new("t");
        let cancel = CancellationToken::new();

        // Upstream echo server.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let proxy_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_port = proxy_listener.local_addr().unwrap().port();
        proxy_listener.set_nonblocking(true).unwrap();
        spawn(
            cancel.clone(),
            Arc::clone(&log),
            EdgeLabels {
                source: "external".to_string(),
                target: "echo".to_string(),
            },
            proxy_listener,
            Endpoint::new("127.0.0.1", upstream_port, rig_api::spec::Protocol::Tcp),
        )
        .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        drop(client);

        // Wait for the closed event to land.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let events = log.events();
            if let Some(closed) = events
                .iter()
                .find(|e| e.kind == EventType::ConnectionClosed)
            {
                let info = closed.connection.as_ref().unwrap();
                assert_eq!(info.bytes_in, 4);
                assert_eq!(info.bytes_out, 4);
                assert_eq!(info.target, "echo");
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no closed event");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cancel.cancel();
    }
}
