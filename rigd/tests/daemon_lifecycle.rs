//! The daemon as a process: address-file discipline, health, discovery
//! reuse, and idle shutdown.

use std::time::{Duration, Instant};

use rig_api::models::DaemonStatus;
use rigd::RigdConf;

#[tokio::test]
async fn daemon_announces_itself_and_idles_out() {
    let dir = camino_tempfile::tempdir().unwrap();
    let rig_dir = dir.path().join("rig");
    let temp_base = dir.path().join("tmp");

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_rigd"))
        .args(["--rig-dir", rig_dir.as_str(), "--idle", "5s"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    let conf = RigdConf {
        rig_dir: rig_dir.clone(),
        listen_addr: "127.0.0.1:0".to_string(),
        addr_file: None,
        idle_timeout: Duration::from_secs(5),
        temp_base,
    };
    let addr_file = conf.addr_file_path();

    // The daemon publishes its address once the listener is bound.
    let deadline = Instant::now() + Duration::from_secs(10);
    let addr = loop {
        match std::fs::read_to_string(&addr_file) {
            Ok(addr) if !addr.trim().is_empty() => break addr.trim().to_string(),
            _ => {
                assert!(Instant::now() < deadline, "no address file at {addr_file}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    let status: DaemonStatus = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.pid, child.id());

    // Discovery reuses the healthy daemon instead of spawning another.
    let found = rigd::daemon::find_or_spawn(&conf).await.unwrap();
    assert_eq!(found, addr);

    // With zero environments the idle timer runs out; the daemon exits
    // and removes its address file.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(exit) = child.try_wait().unwrap() {
            assert!(exit.success(), "daemon exited with {exit}");
            break;
        }
        assert!(Instant::now() < deadline, "daemon never idled out");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        !addr_file.exists(),
        "address file must be removed on shutdown"
    );
}
