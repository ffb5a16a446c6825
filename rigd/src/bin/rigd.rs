//! Main entry point for the rig daemon executable.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Arg, Command};
use tracing::info;

use rigd::RigdConf;

fn main() -> anyhow::Result<()> {
    let arg_matches = cli().get_matches();

    // The daemon's stderr is appended to <rigdir>/rigd.log by whoever
    // spawned it; log there, not to stdout.
    utils::logging::init("info", utils::logging::Output::Stderr)?;

    let rig_dir = match arg_matches.get_one::<String>("rig-dir") {
        Some(dir) => Utf8PathBuf::from(dir),
        None => default_rig_dir()?,
    };
    let idle_timeout = arg_matches
        .get_one::<String>("idle")
        .map(|value| humantime::parse_duration(value))
        .transpose()
        .context("failed to parse --idle")?
        .unwrap_or(rigd::defaults::DEFAULT_IDLE_TIMEOUT);
    let addr_file = arg_matches
        .get_one::<String>("addr-file")
        .map(Utf8PathBuf::from);
    let listen_addr = arg_matches
        .get_one::<String>("listen")
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:0".to_string());
    let temp_base = std::env::temp_dir()
        .join("rig")
        .try_into()
        .map_err(|p| anyhow::anyhow!("non-UTF8 temp dir {p:?}"))?;

    let conf: &'static RigdConf = Box::leak(Box::new(RigdConf {
        rig_dir,
        listen_addr,
        addr_file,
        idle_timeout,
        temp_base,
    }));
    info!(
        "starting rigd v{} in {} (idle timeout {})",
        rigd::VERSION,
        conf.rig_dir,
        humantime::format_duration(conf.idle_timeout)
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(rigd::daemon::serve(conf))
}

fn default_rig_dir() -> anyhow::Result<Utf8PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set and --rig-dir was not given")?;
    Ok(Utf8PathBuf::from(home).join(".rig"))
}

fn cli() -> Command {
    Command::new("rigd")
        .about("Daemon that provisions short-lived multi-service test environments")
        .version(rigd::VERSION)
        .arg(
            Arg::new("rig-dir")
                .long("rig-dir")
                .help("State directory (default ~/.rig)"),
        )
        .arg(
            Arg::new("idle")
                .long("idle")
                .help("Shut down after this long with no environments (default 5m)"),
        )
        .arg(
            Arg::new("addr-file")
                .long("addr-file")
                .help("Write the listen address here instead of the default versioned file"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Listen address (default 127.0.0.1:0, an ephemeral port)"),
        )
}

#[test]
fn verify_cli() {
    cli().debug_assert();
}
