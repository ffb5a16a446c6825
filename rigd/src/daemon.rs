//! Daemon lifecycle: the singleton dance over the address and lock
//! files, the HTTP server itself, and the idle-shutdown supervisor.
//!
//! Discovery protocol, tolerant of racing peers and stale files:
//! read the address file and probe `/health`; if healthy, reuse that
//! daemon. Otherwise take the lock file, re-check under the lock, spawn
//! a detached child if still nothing, and poll until it answers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bollard::Docker;
use camino::Utf8Path;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ArtifactCache;
use crate::cleanup;
use crate::defaults::{DAEMON_START_POLL_INTERVAL, DAEMON_START_TIMEOUT};
use crate::environment::EnvironmentDeps;
use crate::http;
use crate::mgr::EnvironmentMgr;
use crate::ports::PortAllocator;
use crate::service::ServiceTypes;
use crate::RigdConf;

/// Run the daemon until idle shutdown or a termination signal. Writes
/// the address file once the listener is bound and removes it on the
/// way out.
pub async fn serve(conf: &'static RigdConf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&conf.rig_dir)
        .with_context(|| format!("create {}", conf.rig_dir))?;
    std::fs::create_dir_all(&conf.temp_base)
        .with_context(|| format!("create {}", conf.temp_base))?;

    let docker = match Docker::connect_with_unix_defaults() {
        Ok(docker) => Some(docker),
        Err(e) => {
            warn!("container backend unavailable, container types disabled: {e}");
            None
        }
    };

    let deps = EnvironmentDeps {
        conf,
        ports: Arc::new(PortAllocator::new()),
        cache: Arc::new(ArtifactCache::new(conf.cache_dir())?),
        types: Arc::new(ServiceTypes::builtin(docker)),
    };
    let mgr = EnvironmentMgr::new(deps);
    let state = Arc::new(http::routes::State {
        mgr: Arc::clone(&mgr),
    });

    let listener = utils::tcp_listener::bind(&conf.listen_addr)?;
    let local_addr = listener.local_addr()?;
    let addr_file = conf.addr_file_path();
    utils::crashsafe::overwrite(&addr_file, local_addr.to_string().as_bytes())?;
    // The address file is the discovery breadcrumb; it must not outlive
    // this process, even on an error path out of this function.
    let _addr_file_guard = scopeguard::guard(addr_file, |addr_file| {
        if let Err(e) = std::fs::remove_file(&addr_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {addr_file}: {e}");
            }
        }
    });
    info!("rigd v{} listening on {local_addr}", crate::VERSION);

    let shutdown = CancellationToken::new();
    tokio::spawn(idle_watchdog(
        mgr.live_count(),
        conf.idle_timeout,
        shutdown.clone(),
    ));
    tokio::spawn(signal_watcher(shutdown.clone()));

    let router = http::make_router(state)
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;
    let service = utils::http::RouterService::new(router).map_err(|e| anyhow::anyhow!(e))?;
    let graceful_shutdown = shutdown.clone();
    let server = hyper::Server::from_tcp(listener)?
        .serve(service)
        .with_graceful_shutdown(async move { graceful_shutdown.cancelled().await });

    let served = server.await;

    // Wind down whatever is still running, then clear our breadcrumbs.
    mgr.destroy_all().await;
    cleanup::run();
    info!("rigd shut down");
    served.context("http server error")
}

/// Arms a timer whenever the live-environment count drops to zero and
/// fires the shutdown token when it expires; any new environment
/// disarms it.
pub async fn idle_watchdog(
    mut live: watch::Receiver<usize>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let count = *live.borrow_and_update();
        if count == 0 {
            tokio::select! {
                _ = tokio::time::sleep(idle_timeout) => {
                    info!(
                        "idle for {}, shutting down",
                        humantime::format_duration(idle_timeout)
                    );
                    shutdown.cancel();
                    return;
                }
                changed = live.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        } else if live.changed().await.is_err() {
            return;
        }
    }
}

async fn signal_watcher(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => info!("got SIGINT, terminating"),
        _ = terminate.recv() => info!("got SIGTERM, terminating"),
    }
    shutdown.cancel();
}

/// Find a healthy daemon for `conf.rig_dir`, spawning one if needed.
/// Returns the daemon's `host:port`. Safe against racing peers: the
/// spawn decision happens under the lock file, and the address file is
/// re-checked once the lock is held.
pub async fn find_or_spawn(conf: &RigdConf) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()?;

    if let Some(addr) = probe(&client, &conf.addr_file_path()).await {
        return Ok(addr);
    }

    std::fs::create_dir_all(&conf.rig_dir)?;
    let lock_path = conf.lock_file_path();
    let _lock = tokio::task::spawn_blocking(move || utils::lock_file::lock_exclusive(&lock_path))
        .await
        .expect("lock task panicked")?;

    // A racing peer may have spawned while we queued on the lock.
    if let Some(addr) = probe(&client, &conf.addr_file_path()).await {
        return Ok(addr);
    }

    spawn_detached(conf)?;

    let deadline = tokio::time::Instant::now() + DAEMON_START_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(DAEMON_START_POLL_INTERVAL).await;
        if let Some(addr) = probe(&client, &conf.addr_file_path()).await {
            return Ok(addr);
        }
    }
    anyhow::bail!(
        "daemon did not become healthy within {}",
        humantime::format_duration(DAEMON_START_TIMEOUT)
    )
}

/// Address from the file, confirmed healthy. A stale or torn file is
/// treated as no daemon.
async fn probe(client: &reqwest::Client, addr_file: &Utf8Path) -> Option<String> {
    let addr = std::fs::read_to_string(addr_file).ok()?;
    let addr = addr.trim().to_string();
    if addr.is_empty() {
        return None;
    }
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .ok()?;
    response.status().is_success().then_some(addr)
}

/// Start a daemon child fully detached from this process: its own
/// process group, no inherited stdio, stderr appended to the daemon
/// log.
fn spawn_detached(conf: &RigdConf) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("locate rigd binary")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(conf.daemon_log_path())
        .with_context(|| format!("open {}", conf.daemon_log_path()))?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("--rig-dir")
        .arg(conf.rig_dir.as_str())
        .arg("--idle")
        .arg(humantime::format_duration(conf.idle_timeout).to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log)
        .process_group(0);
    if let Some(addr_file) = &conf.addr_file {
        command.arg("--addr-file").arg(addr_file.as_str());
    }
    let child = command.spawn().context("spawn rigd daemon")?;
    info!("spawned rigd daemon (pid {})", child.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_watchdog_fires_only_when_idle() {
        tokio::time::pause();
        let (live_tx, live_rx) = watch::channel(0usize);
        let shutdown = CancellationToken::new();
        let watchdog = tokio::spawn(idle_watchdog(
            live_rx,
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        // Half the idle period passes, then an environment shows up.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!shutdown.is_cancelled());
        live_tx.send_replace(1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!shutdown.is_cancelled(), "busy daemon must not shut down");

        // Back to zero: the timer re-arms from scratch.
        live_tx.send_replace(0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        watchdog.await.unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn probe_rejects_missing_or_stale_addr_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let addr_file = dir.path().join("rigd.addr");

        assert!(probe(&client, &addr_file).await.is_none());

        // A file pointing at a dead port is stale, not fatal.
        std::fs::write(&addr_file, "127.0.0.1:9").unwrap();
        assert!(probe(&client, &addr_file).await.is_none());
    }
}
