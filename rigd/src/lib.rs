//! rigd: a daemon that provisions short-lived, multi-service test
//! environments on the local host. Tests POST an environment spec,
//! follow its event log over SSE, and DELETE the environment when done.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use utils::id::EnvironmentId;

pub mod artifact;
pub mod cache;
pub mod callback;
pub mod cleanup;
pub mod daemon;
pub mod environment;
pub mod eventlog;
pub mod http;
pub mod lifecycle;
pub mod mgr;
pub mod observe;
pub mod ports;
pub mod ready;
pub mod service;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
    /// How long discovery waits for a freshly spawned daemon to write its
    /// address file and answer `/health`.
    pub const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DAEMON_START_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// No lifecycle progress for this long during startup produces a
    /// `progress.stall` snapshot on the log.
    pub const STALL_SNAPSHOT_AFTER: Duration = Duration::from_secs(15);
}

/// Daemon configuration, assembled once at startup from the CLI and kept
/// alive for the whole process (handlers hold `&'static RigdConf`).
#[derive(Debug, Clone)]
pub struct RigdConf {
    /// State directory, `~/.rig` unless overridden.
    pub rig_dir: Utf8PathBuf,
    /// Listen address for the HTTP API; an ephemeral port by default, the
    /// chosen address is published through the address file.
    pub listen_addr: String,
    /// Address file override (`--addr-file`); defaults to a versioned
    /// name under `rig_dir`.
    pub addr_file: Option<Utf8PathBuf>,
    /// Shut down after this long with zero live environments.
    pub idle_timeout: Duration,
    /// Base directory for per-environment scratch space.
    pub temp_base: Utf8PathBuf,
}

impl RigdConf {
    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.rig_dir.join("cache")
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.rig_dir.join("logs")
    }

    pub fn addr_file_path(&self) -> Utf8PathBuf {
        match &self.addr_file {
            Some(path) => path.clone(),
            None => self.rig_dir.join(format!("rigd-v{VERSION}.addr")),
        }
    }

    pub fn lock_file_path(&self) -> Utf8PathBuf {
        self.rig_dir.join(format!("rigd-v{VERSION}.lock"))
    }

    pub fn daemon_log_path(&self) -> Utf8PathBuf {
        self.rig_dir.join("rigd.log")
    }

    pub fn env_dir(&self, id: EnvironmentId) -> Utf8PathBuf {
        self.temp_base.join(id.to_string())
    }

    pub fn service_dir(&self, id: EnvironmentId, service: &str) -> Utf8PathBuf {
        self.env_dir(id).join(service)
    }

    /// A conf rooted entirely under `dir`, used by tests.
    pub fn test_conf(dir: &Utf8Path) -> Self {
        RigdConf {
            rig_dir: dir.join("rig"),
            listen_addr: "127.0.0.1:0".to_string(),
            addr_file: None,
            idle_timeout: defaults::DEFAULT_IDLE_TIMEOUT,
            temp_base: dir.join("tmp"),
        }
    }
}
