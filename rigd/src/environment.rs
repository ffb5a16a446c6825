//! One environment instance: its identity, scratch space, event log,
//! cancellation root, and the orchestration that drives every service
//! lifecycle from artifact resolution to `environment.down`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use rig_api::events::{Event, EventType, StallSnapshot};
use rig_api::models::{Outcome, ResolvedService, ServiceStatus};
use rig_api::spec::EnvironmentSpec;
use rig_api::wiring::Endpoint;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use utils::id::EnvironmentId;

use crate::artifact::{self, Artifact};
use crate::cache::ArtifactCache;
use crate::cleanup;
use crate::defaults::STALL_SNAPSHOT_AFTER;
use crate::eventlog::EventLog;
use crate::lifecycle::{self, LifecycleCtx};
use crate::observe::ObservePlan;
use crate::ports::PortAllocator;
use crate::service::ServiceTypes;
use crate::RigdConf;

/// Daemon-wide dependencies shared by every environment.
#[derive(Clone)]
pub struct EnvironmentDeps {
    pub conf: &'static RigdConf,
    pub ports: Arc<PortAllocator>,
    pub cache: Arc<ArtifactCache>,
    pub types: Arc<ServiceTypes>,
}

/// The part of an environment handed to lifecycles, service kinds, and
/// the HTTP layer: identity, log, cancellation, and the client-service
/// error channel.
pub struct EnvHandle {
    pub id: EnvironmentId,
    pub name: String,
    pub log: Arc<EventLog>,
    pub cancel: CancellationToken,
    client_errors: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

impl EnvHandle {
    /// Called by a client-service runner: errors POSTed for `service`
    /// are delivered to the returned receiver.
    pub fn register_client_service(&self, service: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        self.client_errors
            .lock()
            .unwrap()
            .insert(service.to_string(), tx);
        rx
    }

    /// Route a `service.error` POST to the service's runner. Returns
    /// false when no client service with that name is running.
    pub fn deliver_client_error(&self, service: &str, error: String) -> bool {
        let sender = self.client_errors.lock().unwrap().get(service).cloned();
        match sender {
            Some(sender) => sender.try_send(error).is_ok(),
            None => false,
        }
    }
}

pub struct Environment {
    pub handle: Arc<EnvHandle>,
    pub spec: Arc<EnvironmentSpec>,
    pub created_at: Instant,
    env_dir: Utf8PathBuf,
    terminal: Mutex<Option<oneshot::Receiver<Outcome>>>,
}

impl Environment {
    pub fn id(&self) -> EnvironmentId {
        self.handle.id
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.handle.log
    }

    /// Create the instance and start orchestration in the background.
    pub fn create(deps: EnvironmentDeps, spec: EnvironmentSpec) -> anyhow::Result<Arc<Environment>> {
        let id = EnvironmentId::generate();
        let env_dir = deps.conf.env_dir(id);
        std::fs::create_dir_all(&env_dir).with_context(|| format!("create {env_dir}"))?;
        cleanup::register(&env_dir);
        for service in spec.services.keys() {
            std::fs::create_dir_all(deps.conf.service_dir(id, service))?;
        }

        let handle = Arc::new(EnvHandle {
            id,
            name: spec.name.clone(),
            log: EventLog::new(spec.name.clone()),
            cancel: CancellationToken::new(),
            client_errors: Mutex::new(HashMap::new()),
        });
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let environment = Arc::new(Environment {
            handle,
            spec: Arc::new(spec),
            created_at: Instant::now(),
            env_dir,
            terminal: Mutex::new(Some(terminal_rx)),
        });

        let orchestrated = Arc::clone(&environment);
        let span = info_span!("environment", env = %id, name = %orchestrated.handle.name);
        tokio::spawn(
            async move {
                let outcome = orchestrate(&orchestrated, deps).await;
                // The runner has fully exited: down is the final event.
                orchestrated
                    .handle
                    .log
                    .publish(Event::new(EventType::EnvironmentDown));
                let _ = terminal_tx.send(outcome);
            }
            .instrument(span),
        );

        Ok(environment)
    }

    pub fn cancel(&self) {
        self.handle.cancel.cancel();
    }

    /// Block until orchestration has fully wound down. Consumes the
    /// terminal channel: only the first caller observes the outcome.
    pub async fn wait_terminal(&self) -> Option<Outcome> {
        let receiver = self.terminal.lock().unwrap().take();
        match receiver {
            Some(receiver) => receiver.await.ok(),
            None => None,
        }
    }

    /// Snapshot for `GET /environments/{id}`, folded from the log.
    pub fn resolved(&self) -> BTreeMap<String, ResolvedService> {
        let events = self.handle.log.lifecycle_events();
        let mut services: BTreeMap<String, ResolvedService> = self
            .spec
            .services
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    ResolvedService {
                        status: ServiceStatus::Pending,
                        ingresses: BTreeMap::new(),
                        egresses: BTreeMap::new(),
                    },
                )
            })
            .collect();

        for event in &events {
            let Some(service) = event.service.as_deref() else {
                continue;
            };
            let Some(resolved) = services.get_mut(service) else {
                continue;
            };
            match event.kind {
                EventType::IngressPublished => {
                    if let (Some(ingress), Some(endpoint)) = (&event.ingress, &event.endpoint) {
                        resolved
                            .ingresses
                            .insert(ingress.clone(), endpoint.clone());
                    }
                }
                EventType::ServiceStarting => resolved.status = ServiceStatus::Starting,
                EventType::ServiceHealthy => resolved.status = ServiceStatus::Healthy,
                EventType::ServiceReady => resolved.status = ServiceStatus::Ready,
                EventType::ServiceFailed => resolved.status = ServiceStatus::Failed,
                EventType::ServiceStopping => resolved.status = ServiceStatus::Stopping,
                EventType::ServiceStopped => resolved.status = ServiceStatus::Stopped,
                _ => {}
            }
        }

        // Egress endpoints mirror what each consumer resolved: the
        // published endpoint of its target ingress.
        for (name, service) in &self.spec.services {
            for (egress_name, egress) in &service.egresses {
                let endpoint = latest_published(&events, &egress.service, &egress.ingress);
                if let Some(endpoint) = endpoint {
                    if let Some(resolved) = services.get_mut(name) {
                        resolved.egresses.insert(egress_name.clone(), endpoint);
                    }
                }
            }
        }
        services
    }
}

fn latest_published(events: &[Event], service: &str, ingress: &str) -> Option<Endpoint> {
    events
        .iter()
        .rev()
        .find(|e| {
            e.kind == EventType::IngressPublished
                && e.service.as_deref() == Some(service)
                && e.ingress.as_deref() == Some(ingress)
        })
        .and_then(|e| e.endpoint.clone())
}

/// The environment-level driver: artifact phase, then one concurrent
/// lifecycle per service with first-failure-wins semantics.
async fn orchestrate(environment: &Arc<Environment>, deps: EnvironmentDeps) -> Outcome {
    let handle = &environment.handle;
    let release_key = handle.id.to_string();

    let outcome = drive(environment, &deps).await;

    match &outcome {
        Ok(reached_up) => {
            info!(reached_up, "environment wound down");
        }
        Err(e) => {
            error!("environment failed: {e:#}");
        }
    }

    // Teardown is unconditional: every lifecycle has returned by now.
    deps.ports.release(&release_key);
    if let Err(e) = std::fs::remove_dir_all(&environment.env_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {e}", environment.env_dir);
        }
    }
    cleanup::unregister(&environment.env_dir);

    match outcome {
        Ok(true) => Outcome::Passed,
        Ok(false) => Outcome::Crashed,
        Err(_) => Outcome::Failed,
    }
}

/// Returns whether `environment.up` was reached. An `Err` means the
/// environment failed (root cause already reported on the log).
async fn drive(environment: &Arc<Environment>, deps: &EnvironmentDeps) -> anyhow::Result<bool> {
    let handle = &environment.handle;
    let spec = &environment.spec;

    // Phase 1: collect and resolve artifacts.
    let mut artifacts: Vec<Artifact> = Vec::new();
    for (name, service_spec) in &spec.services {
        let kind = deps
            .types
            .get(&service_spec.kind)
            .with_context(|| format!("unknown service type {:?}", service_spec.kind))?;
        let declared = kind
            .artifacts(service_spec)
            .with_context(|| format!("collect artifacts for {name}"));
        match declared {
            Ok(declared) => artifacts.extend(declared),
            Err(e) => {
                handle
                    .log
                    .publish(Event::new(EventType::EnvironmentFailing).with_error(&e));
                return Err(e);
            }
        }
    }

    let outputs = match artifact::resolve_all(&handle.cancel, &handle.log, &deps.cache, artifacts)
        .await
    {
        Ok(outputs) => Arc::new(outputs),
        Err(e) => {
            handle
                .log
                .publish(Event::new(EventType::EnvironmentFailing).with_error(&e));
            return Err(e);
        }
    };

    // Phase 2: concurrent lifecycles.
    let observe = if spec.observe {
        match ObservePlan::build(spec, &deps.ports, &handle.id.to_string()) {
            Ok(plan) => Some(Arc::new(plan)),
            Err(e) => {
                handle
                    .log
                    .publish(Event::new(EventType::EnvironmentFailing).with_error(&e));
                return Err(e);
            }
        }
    } else {
        None
    };

    let first_failure: Arc<Mutex<Option<(String, String)>>> = Arc::default();
    let mut lifecycles = JoinSet::new();
    for (name, service_spec) in spec.services.iter() {
        let ctx = LifecycleCtx {
            conf: deps.conf,
            env: Arc::clone(handle),
            ports: Arc::clone(&deps.ports),
            kind: deps
                .types
                .get(&service_spec.kind)
                .expect("validated at POST time"),
            observe: observe.clone(),
            artifacts: Arc::clone(&outputs),
            service: name.clone(),
            spec: service_spec.clone(),
        };
        let first_failure = Arc::clone(&first_failure);
        let cancel = handle.cancel.clone();
        lifecycles.spawn(async move {
            if let Err(failure) = lifecycle::run_service(ctx).await {
                // First failure wins: everything after it is a
                // cancellation side effect, not a cause.
                let mut slot = first_failure.lock().unwrap();
                if slot.is_none() && !cancel.is_cancelled() {
                    *slot = Some((failure.service, format!("{:#}", failure.error)));
                }
                cancel.cancel();
            }
        });
    }

    let up_watcher = spawn_up_watcher(environment);
    let stall_watcher = spawn_stall_watcher(environment);

    // Lifecycles only return once the environment is cancelled (failure
    // or DELETE); drain them all before reporting teardown.
    while lifecycles.join_next().await.is_some() {}
    stall_watcher.abort();
    let reached_up = match up_watcher.is_finished() {
        true => up_watcher.await.unwrap_or(false),
        false => {
            up_watcher.abort();
            false
        }
    };

    let failure = first_failure.lock().unwrap().take();
    if let Some((service, error)) = failure {
        let mut event = Event::new(EventType::EnvironmentFailing);
        event.service = Some(service.clone());
        event.error = Some(error.clone());
        handle.log.publish(event);
        anyhow::bail!("service {service} failed: {error}");
    }
    Ok(reached_up)
}

/// Waits for every service to reach READY, then emits `environment.up`
/// with the complete ingress table so one SSE event wires a client.
fn spawn_up_watcher(environment: &Arc<Environment>) -> tokio::task::JoinHandle<bool> {
    let environment = Arc::clone(environment);
    tokio::spawn(async move {
        let handle = &environment.handle;
        for name in environment.spec.services.keys() {
            let name = name.clone();
            let ready = handle
                .log
                .wait_for(&handle.cancel, move |event| {
                    event.kind == EventType::ServiceReady
                        && event.service.as_deref() == Some(&name)
                })
                .await;
            if ready.is_err() {
                return false;
            }
        }

        let events = handle.log.lifecycle_events();
        let mut table: BTreeMap<String, BTreeMap<String, Endpoint>> = BTreeMap::new();
        for (service, service_spec) in &environment.spec.services {
            let mut ingresses = BTreeMap::new();
            for ingress in service_spec.ingresses.keys() {
                if let Some(endpoint) = latest_published(&events, service, ingress) {
                    ingresses.insert(ingress.clone(), endpoint);
                }
            }
            table.insert(service.clone(), ingresses);
        }

        let mut event = Event::new(EventType::EnvironmentUp);
        event.ingresses = Some(table);
        handle.log.publish(event);
        info!("environment up");
        true
    })
}

/// Emits a `progress.stall` snapshot when startup makes no lifecycle
/// progress for a while: which state each service is in, so a hanging
/// egress wait or ready probe is visible in the timeline.
fn spawn_stall_watcher(environment: &Arc<Environment>) -> tokio::task::JoinHandle<()> {
    let environment = Arc::clone(environment);
    tokio::spawn(async move {
        let handle = &environment.handle;
        let mut last_seen = 0u64;
        loop {
            tokio::time::sleep(STALL_SNAPSHOT_AFTER).await;
            if handle.cancel.is_cancelled() {
                return;
            }
            let events = handle.log.lifecycle_events();
            if events.iter().any(|e| e.kind == EventType::EnvironmentUp) {
                return;
            }
            let newest = events.last().map(|e| e.seq).unwrap_or(0);
            if newest > last_seen {
                last_seen = newest;
                continue;
            }
            let waiting = environment
                .resolved()
                .into_iter()
                .map(|(name, resolved)| (name, resolved.status.to_string()))
                .collect();
            let mut event = Event::new(EventType::ProgressStall);
            event.stall = Some(StallSnapshot { waiting });
            handle.log.publish(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rig_api::events::CallbackPayload;
    use rig_api::wiring::Endpoint;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::mgr::EnvironmentMgr;
    use crate::ready::ReadyCheck;
    use crate::service::{
        PublishParams, Runnable, RunnerParams, ServiceKind, ServiceTypes,
    };

    /// A service kind with no real process behind it: the runner parks
    /// until teardown (or crashes immediately when configured to), and
    /// every ingress counts as ready.
    struct StubKind;

    #[derive(serde::Deserialize, Default)]
    struct StubConfig {
        #[serde(default)]
        crash: bool,
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadyCheck for AlwaysReady {
        async fn check(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct StubRunner {
        crash: bool,
    }

    #[async_trait]
    impl Runnable for StubRunner {
        async fn run(self: Box<Self>, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
            if self.crash {
                anyhow::bail!("stub crashed")
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceKind for StubKind {
        fn tag(&self) -> &'static str {
            "stub"
        }

        async fn publish(
            &self,
            params: PublishParams<'_>,
        ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
            Ok(params.default_endpoints())
        }

        fn ready_check(
            &self,
            _env: &EnvHandle,
            _service: &str,
        ) -> Option<Box<dyn ReadyCheck>> {
            Some(Box::new(AlwaysReady))
        }

        async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
            let config: StubConfig =
                serde_json::from_value(params.spec.config.clone()).unwrap_or_default();
            Ok(Box::new(StubRunner {
                crash: config.crash,
            }))
        }
    }

    fn test_deps(dir: &camino::Utf8Path) -> EnvironmentDeps {
        let conf: &'static RigdConf = Box::leak(Box::new(RigdConf::test_conf(dir)));
        std::fs::create_dir_all(&conf.temp_base).unwrap();
        let mut types = ServiceTypes::builtin(None);
        types.register(Arc::new(StubKind));
        EnvironmentDeps {
            conf,
            ports: Arc::new(PortAllocator::new()),
            cache: Arc::new(ArtifactCache::new(conf.cache_dir()).unwrap()),
            types: Arc::new(types),
        }
    }

    fn spec_from(value: serde_json::Value) -> EnvironmentSpec {
        serde_json::from_value(value).unwrap()
    }

    fn seq_of(events: &[Event], kind: EventType, service: Option<&str>) -> Option<u64> {
        events
            .iter()
            .find(|e| e.kind == kind && e.service.as_deref() == service)
            .map(|e| e.seq)
    }

    async fn wait_up(environment: &Arc<Environment>) {
        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            environment
                .log()
                .wait_for(&cancel, |e| e.kind == EventType::EnvironmentUp),
        )
        .await
        .expect("environment did not come up")
        .unwrap();
    }

    #[tokio::test]
    async fn zero_ingress_service_reaches_ready_and_down_is_last() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let environment = Environment::create(
            deps,
            spec_from(serde_json::json!({
                "name": "solo",
                "services": {"worker": {"type": "stub"}}
            })),
        )
        .unwrap();
        wait_up(&environment).await;

        environment.cancel();
        let outcome = environment.wait_terminal().await.unwrap();
        assert_eq!(outcome, Outcome::Passed);

        let events = environment.log().events();
        let kinds: Vec<EventType> = events.iter().map(|e| e.kind).collect();
        // No publish, probe, or proxy steps for a service with no
        // ingresses; the canonical order still holds.
        assert!(!kinds.contains(&EventType::IngressPublished));
        let starting = seq_of(&events, EventType::ServiceStarting, Some("worker")).unwrap();
        let healthy = seq_of(&events, EventType::ServiceHealthy, Some("worker")).unwrap();
        let ready = seq_of(&events, EventType::ServiceReady, Some("worker")).unwrap();
        let up = seq_of(&events, EventType::EnvironmentUp, None).unwrap();
        let stopped = seq_of(&events, EventType::ServiceStopped, Some("worker")).unwrap();
        assert!(starting < healthy && healthy < ready && ready < up && up < stopped);
        assert_eq!(events.last().unwrap().kind, EventType::EnvironmentDown);

        // Seq values are gap-free from 1.
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.seq, index as u64 + 1);
        }
    }

    #[tokio::test]
    async fn egress_waits_for_target_ready_and_up_lists_all_ingresses() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let environment = Environment::create(
            deps,
            spec_from(serde_json::json!({
                "name": "pair",
                "services": {
                    "db": {
                        "type": "stub",
                        "ingresses": {"default": {"protocol": "tcp"}}
                    },
                    "api": {
                        "type": "stub",
                        "egresses": {"database": {"service": "db", "ingress": "default"}}
                    }
                }
            })),
        )
        .unwrap();
        wait_up(&environment).await;

        let events = environment.log().events();
        let db_ready = seq_of(&events, EventType::ServiceReady, Some("db")).unwrap();
        let api_wired = seq_of(&events, EventType::WiringResolved, Some("api")).unwrap();
        assert!(db_ready < api_wired, "egress resolved before target ready");

        let up = events
            .iter()
            .find(|e| e.kind == EventType::EnvironmentUp)
            .unwrap();
        let table = up.ingresses.as_ref().unwrap();
        let db_endpoint = &table["db"]["default"];
        assert_eq!(db_endpoint.host, "127.0.0.1");
        assert!(db_endpoint.port > 0);
        assert!(table["api"].is_empty());

        // The endpoint api resolved equals the published one.
        let published = events
            .iter()
            .find(|e| e.kind == EventType::IngressPublished && e.service.as_deref() == Some("db"))
            .unwrap();
        assert_eq!(published.endpoint.as_ref().unwrap(), db_endpoint);

        environment.cancel();
        environment.wait_terminal().await.unwrap();
    }

    #[tokio::test]
    async fn crash_fails_environment_without_up() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let environment = Environment::create(
            deps,
            spec_from(serde_json::json!({
                "name": "crashy",
                "services": {
                    "crasher": {"type": "stub", "config": {"crash": true}},
                    "bystander": {"type": "stub"}
                }
            })),
        )
        .unwrap();

        // The failure cancels the environment on its own.
        let outcome = tokio::time::timeout(Duration::from_secs(10), environment.wait_terminal())
            .await
            .expect("environment did not wind down")
            .unwrap();
        assert_eq!(outcome, Outcome::Failed);

        let events = environment.log().events();
        let failed = seq_of(&events, EventType::ServiceFailed, Some("crasher")).unwrap();
        let failing = events
            .iter()
            .find(|e| e.kind == EventType::EnvironmentFailing)
            .unwrap();
        assert!(failed < failing.seq);
        assert_eq!(failing.service.as_deref(), Some("crasher"));
        assert!(failing.error.as_ref().unwrap().contains("stub crashed"));
        assert!(seq_of(&events, EventType::EnvironmentUp, None).is_none());
        assert_eq!(events.last().unwrap().kind, EventType::EnvironmentDown);
    }

    #[tokio::test]
    async fn prestart_sees_egresses_init_does_not() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let environment = Environment::create(
            deps,
            spec_from(serde_json::json!({
                "name": "hooks",
                "services": {
                    "db": {
                        "type": "stub",
                        "ingresses": {"default": {"protocol": "tcp"}}
                    },
                    "api": {
                        "type": "stub",
                        "egresses": {"database": {"service": "db", "ingress": "default"}},
                        "prestart": [{"kind": "client_function", "name": "migrate"}],
                        "init": [{"kind": "client_function", "name": "seed"}]
                    }
                }
            })),
        )
        .unwrap();

        // Play the client: answer both callback requests, checking the
        // wiring each carries.
        let cancel = CancellationToken::new();
        let log = Arc::clone(environment.log());
        for (name, expect_egresses) in [("migrate", true), ("seed", false)] {
            let request = tokio::time::timeout(
                Duration::from_secs(10),
                log.wait_for(&cancel, |e| {
                    e.kind == EventType::CallbackRequest
                        && e.callback.as_ref().map_or(false, |c| c.name == name)
                }),
            )
            .await
            .unwrap_or_else(|_| panic!("no callback.request for {name}"))
            .unwrap();

            let callback = request.callback.unwrap();
            let wiring = callback.wiring.unwrap();
            assert_eq!(
                wiring.egresses.contains_key("database"),
                expect_egresses,
                "unexpected egresses for hook {name}: {wiring:?}"
            );
            assert!(!wiring.temp_dir.is_empty());

            let mut response = Event::new(EventType::CallbackResponse);
            response.callback = Some(CallbackPayload {
                request_id: callback.request_id,
                name: name.to_string(),
                kind: rig_api::events::CallbackKind::Hook,
                wiring: None,
                error: None,
            });
            log.publish(response);
        }

        wait_up(&environment).await;
        let events = environment.log().events();
        let prestart = seq_of(&events, EventType::ServicePrestart, Some("api")).unwrap();
        let starting = seq_of(&events, EventType::ServiceStarting, Some("api")).unwrap();
        let init = seq_of(&events, EventType::ServiceInit, Some("api")).unwrap();
        let ready = seq_of(&events, EventType::ServiceReady, Some("api")).unwrap();
        assert!(prestart < starting && starting < init && init < ready);

        environment.cancel();
        environment.wait_terminal().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_destroys_resolve_exactly_once() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let mgr = EnvironmentMgr::new(deps);
        let environment = match mgr.create(spec_from(serde_json::json!({
            "name": "once",
            "services": {"worker": {"type": "stub"}}
        }))) {
            Ok(environment) => environment,
            Err(_) => panic!("create failed"),
        };
        wait_up(&environment).await;
        let id = environment.id();
        drop(environment);

        let (a, b) = tokio::join!(mgr.destroy(id, false), mgr.destroy(id, false));
        assert!(a.is_some() != b.is_some(), "exactly one destroy must win");
        assert!(mgr.get(id).is_none());
    }

    #[tokio::test]
    async fn validation_rejects_unknown_type_via_mgr() {
        let dir = camino_tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let mgr = EnvironmentMgr::new(deps);
        let result = mgr.create(spec_from(serde_json::json!({
            "name": "bad",
            "services": {"w": {"type": "widget"}}
        })));
        match result {
            Err(crate::mgr::CreateError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("unknown type")));
            }
            _ => panic!("expected validation failure"),
        }
    }
}
