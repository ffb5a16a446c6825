//! Environments built from real child processes, driven through the
//! environment manager directly.

use std::sync::Arc;
use std::time::Duration;

use rig_api::events::{Event, EventType};
use rig_api::spec::EnvironmentSpec;
use rigd::cache::ArtifactCache;
use rigd::environment::EnvironmentDeps;
use rigd::mgr::EnvironmentMgr;
use rigd::ports::PortAllocator;
use rigd::service::ServiceTypes;
use rigd::RigdConf;
use tokio_util::sync::CancellationToken;

fn test_mgr(dir: &camino::Utf8Path) -> Arc<EnvironmentMgr> {
    utils::logging::init_for_tests();
    let conf: &'static RigdConf = Box::leak(Box::new(RigdConf::test_conf(dir)));
    std::fs::create_dir_all(&conf.temp_base).unwrap();
    EnvironmentMgr::new(EnvironmentDeps {
        conf,
        ports: Arc::new(PortAllocator::new()),
        cache: Arc::new(ArtifactCache::new(conf.cache_dir()).unwrap()),
        types: Arc::new(ServiceTypes::builtin(None)),
    })
}

fn spec_from(value: serde_json::Value) -> EnvironmentSpec {
    serde_json::from_value(value).unwrap()
}

async fn wait_for_kind(
    environment: &rigd::environment::Environment,
    kind: EventType,
) -> Event {
    let cancel = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(20),
        environment.log().wait_for(&cancel, |e| e.kind == kind),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
    .unwrap()
}

#[tokio::test]
async fn sleeping_process_reaches_ready_and_stops_cleanly() {
    let dir = camino_tempfile::tempdir().unwrap();
    let mgr = test_mgr(dir.path());
    let environment = match mgr.create(spec_from(serde_json::json!({
        "name": "sleepy",
        "services": {
            "sleeper": {
                "type": "process",
                "config": {"command": "sleep"},
                "args": ["30"]
            }
        }
    }))) {
        Ok(environment) => environment,
        Err(_) => panic!("create failed"),
    };

    wait_for_kind(&environment, EventType::EnvironmentUp).await;
    let id = environment.id();

    let destroyed = mgr.destroy(id, false).await.expect("destroy");
    assert_eq!(destroyed.status, "destroyed");

    let events = environment.log().events();
    assert!(events
        .iter()
        .any(|e| e.kind == EventType::ServiceStopped && e.service.as_deref() == Some("sleeper")));
    assert!(!events.iter().any(|e| e.kind == EventType::ServiceFailed));
    assert_eq!(events.last().unwrap().kind, EventType::EnvironmentDown);
}

#[tokio::test]
async fn crashing_process_fails_environment() {
    let dir = camino_tempfile::tempdir().unwrap();
    let mgr = test_mgr(dir.path());
    let environment = match mgr.create(spec_from(serde_json::json!({
        "name": "crashy",
        "services": {
            "crasher": {"type": "process", "config": {"command": "false"}}
        }
    }))) {
        Ok(environment) => environment,
        Err(_) => panic!("create failed"),
    };

    wait_for_kind(&environment, EventType::EnvironmentDown).await;
    let events = environment.log().events();
    let failed = events
        .iter()
        .find(|e| e.kind == EventType::ServiceFailed)
        .expect("crasher must fail");
    assert_eq!(failed.service.as_deref(), Some("crasher"));
    assert!(events
        .iter()
        .any(|e| e.kind == EventType::EnvironmentFailing));
    assert!(!events.iter().any(|e| e.kind == EventType::EnvironmentUp));
}

#[tokio::test]
async fn process_output_and_injected_env_are_captured() {
    let dir = camino_tempfile::tempdir().unwrap();
    let mgr = test_mgr(dir.path());
    // The shell exits immediately, which fails the environment; the
    // point is that its output (rendered from injected variables) lands
    // in the log first.
    let environment = match mgr.create(spec_from(serde_json::json!({
        "name": "printer",
        "services": {
            "printer": {
                "type": "process",
                "config": {"command": "sh"},
                "args": ["-c", "echo running-as-$RIG_SERVICE"]
            }
        }
    }))) {
        Ok(environment) => environment,
        Err(_) => panic!("create failed"),
    };

    wait_for_kind(&environment, EventType::EnvironmentDown).await;
    let lines: Vec<String> = environment
        .log()
        .service_log_tail("printer", 16)
        .iter()
        .filter_map(|e| e.line.as_ref().map(|l| l.line.clone()))
        .collect();
    assert!(
        lines.iter().any(|l| l == "running-as-printer"),
        "stdout not captured: {lines:?}"
    );
}
