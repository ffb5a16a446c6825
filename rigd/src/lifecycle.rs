//! Per-service lifecycle: an explicit state machine driven through
//! publish, wait-egresses, prestart, and a supervised run in which the
//! service process races its own readiness continuation.
//!
//! Ordering guarantees all derive from the environment log:
//! `ingress.published` precedes `service.healthy` for the same service;
//! `service.ready(target)` precedes `wiring.resolved(consumer)`; init
//! hooks complete before `service.ready`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use rig_api::events::{Event, EventType};
use rig_api::spec::{HookSpec, IngressSpec, ServiceSpec};
use rig_api::wiring::{expand_templates, Endpoint, WiringContext};
use tracing::{debug, info_span, Instrument};

use crate::artifact::Output;
use crate::callback;
use crate::environment::EnvHandle;
use crate::observe::{self, EdgeLabels, ObservePlan, EXTERNAL_SOURCE};
use crate::ports::PortAllocator;
use crate::ready;
use crate::service::{HookParams, PublishParams, RunnerParams, ServiceKind};
use crate::RigdConf;

/// The states a service moves through. Terminal states are `Stopped`
/// and `Failed`; everything in between is strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Published,
    Wired,
    Prestarted,
    Starting,
    Healthy,
    Initialized,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

pub(crate) struct ServiceFailure {
    pub service: String,
    pub error: anyhow::Error,
}

pub(crate) struct LifecycleCtx {
    pub conf: &'static RigdConf,
    pub env: Arc<EnvHandle>,
    pub ports: Arc<PortAllocator>,
    pub kind: Arc<dyn ServiceKind>,
    pub observe: Option<Arc<ObservePlan>>,
    pub artifacts: Arc<HashMap<String, Output>>,
    pub service: String,
    pub spec: ServiceSpec,
}

impl LifecycleCtx {
    fn emit(&self, kind: EventType) {
        self.env.log.publish(Event::service(kind, self.service.as_str()));
    }

    fn advance(&self, state: &mut ServiceState, next: ServiceState) {
        debug_assert!(*state < next, "illegal transition {state} -> {next}");
        debug!("{}: {state} -> {next}", self.service);
        *state = next;
    }
}

/// Drive one service from `Pending` to a terminal state. On failure the
/// single `service.failed` for this service is emitted here and the
/// error returned for the orchestrator to record.
pub(crate) async fn run_service(ctx: LifecycleCtx) -> Result<(), ServiceFailure> {
    let service = ctx.service.clone();
    match drive(&ctx).instrument(info_span!("service", %service)).await {
        Ok(()) => Ok(()),
        Err(error) if ctx.env.cancel.is_cancelled() => {
            // Teardown interrupted a step (an egress wait, a probe, a
            // hook). That is not a cause, just a side effect of the
            // cancellation; the service winds down as stopped.
            debug!("{service} interrupted by teardown: {error:#}");
            ctx.env
                .log
                .publish(Event::service(EventType::ServiceStopped, service.as_str()));
            Ok(())
        }
        Err(error) => {
            ctx.env.log.publish(
                Event::service(EventType::ServiceFailed, service.as_str()).with_error(&error),
            );
            Err(ServiceFailure { service, error })
        }
    }
}

async fn drive(ctx: &LifecycleCtx) -> anyhow::Result<()> {
    let mut state = ServiceState::Pending;

    // --- Publish -------------------------------------------------------
    let ingress_list: Vec<(String, IngressSpec)> = ctx
        .spec
        .ingresses
        .iter()
        .map(|(name, ingress)| (name.clone(), ingress.clone()))
        .collect();

    // Backing endpoints are where the service itself binds; visible
    // endpoints are what everyone else dials (the observe proxy when the
    // environment is observed).
    let mut backing_endpoints: BTreeMap<String, Endpoint> = BTreeMap::new();
    let mut visible_endpoints: BTreeMap<String, Endpoint> = BTreeMap::new();

    if !ingress_list.is_empty() {
        let allocated = ctx
            .ports
            .allocate(&ctx.env.id.to_string(), ingress_list.len())
            .context("allocate ingress ports")?;

        let published = ctx
            .kind
            .publish(PublishParams {
                service: &ctx.service,
                spec: &ctx.spec,
                ingresses: &ingress_list,
                ports: &allocated,
            })
            .await
            .context("publish ingresses")?;

        for (name, _) in &ingress_list {
            let backing = published
                .get(name)
                .with_context(|| format!("type did not publish ingress {name}"))?
                .clone();

            let visible = match external_proxy_port(ctx, name) {
                Some(proxy_port) => {
                    let plan = ctx.observe.as_ref().expect("port implies a plan");
                    plan.record_backing(&ctx.service, name, backing.clone());
                    observe::spawn_relay(
                        ctx.env.cancel.child_token(),
                        Arc::clone(&ctx.env.log),
                        EdgeLabels {
                            source: EXTERNAL_SOURCE.to_string(),
                            target: ctx.service.clone(),
                        },
                        proxy_port,
                        backing.clone(),
                    )
                    .with_context(|| format!("start external proxy for {name}"))?;
                    let proxied = observe::proxied_endpoint(&backing, proxy_port);
                    ctx.env.log.publish(
                        Event::service(EventType::ProxyPublished, &ctx.service)
                            .with_ingress(name.clone())
                            .with_endpoint(proxied.clone()),
                    );
                    proxied
                }
                None => backing.clone(),
            };

            ctx.env.log.publish(
                Event::service(EventType::IngressPublished, &ctx.service)
                    .with_ingress(name.clone())
                    .with_endpoint(visible.clone()),
            );
            backing_endpoints.insert(name.clone(), backing);
            visible_endpoints.insert(name.clone(), visible);
        }
    }
    ctx.advance(&mut state, ServiceState::Published);

    // --- Wait for egresses --------------------------------------------
    let mut egress_endpoints: BTreeMap<String, Endpoint> = BTreeMap::new();
    for (egress_name, egress) in &ctx.spec.egresses {
        let target = egress.service.clone();
        debug!("waiting for {target} to become ready");
        ctx.env
            .log
            .wait_for(&ctx.env.cancel, |event| {
                event.kind == EventType::ServiceReady && event.service.as_deref() == Some(&target)
            })
            .await
            .with_context(|| format!("wait for {target} to become ready"))?;

        let published = ctx
            .env
            .log
            .wait_for(&ctx.env.cancel, |event| {
                event.kind == EventType::IngressPublished
                    && event.service.as_deref() == Some(&target)
                    && event.ingress.as_deref() == Some(&egress.ingress)
            })
            .await
            .with_context(|| format!("wait for {target}.{} to publish", egress.ingress))?;
        let published_endpoint = published
            .endpoint
            .with_context(|| format!("ingress.published for {target} carried no endpoint"))?;

        let endpoint = match edge_proxy_port(ctx, egress_name) {
            Some(proxy_port) => {
                let plan = ctx.observe.as_ref().expect("port implies a plan");
                let backing = plan
                    .backing(&target, &egress.ingress)
                    .unwrap_or_else(|| published_endpoint.clone());
                observe::spawn_relay(
                    ctx.env.cancel.child_token(),
                    Arc::clone(&ctx.env.log),
                    EdgeLabels {
                        source: ctx.service.clone(),
                        target: target.clone(),
                    },
                    proxy_port,
                    backing.clone(),
                )
                .with_context(|| format!("start egress proxy for {egress_name}"))?;
                observe::proxied_endpoint(&backing, proxy_port)
            }
            None => published_endpoint,
        };
        egress_endpoints.insert(egress_name.clone(), endpoint);
    }
    ctx.emit(EventType::WiringResolved);
    ctx.advance(&mut state, ServiceState::Wired);

    // --- Wiring --------------------------------------------------------
    let env_dir = ctx.conf.env_dir(ctx.env.id);
    let service_dir = ctx.conf.service_dir(ctx.env.id, &ctx.service);

    // The runner binds its real ports; hooks dial the addresses the rest
    // of the world sees.
    let runner_wiring = WiringContext {
        ingresses: backing_endpoints.clone(),
        egresses: egress_endpoints.clone(),
        temp_dir: service_dir.to_string(),
        env_dir: env_dir.to_string(),
        attributes: BTreeMap::new(),
    };
    let hook_wiring = WiringContext {
        ingresses: visible_endpoints.clone(),
        egresses: egress_endpoints.clone(),
        temp_dir: service_dir.to_string(),
        env_dir: env_dir.to_string(),
        attributes: BTreeMap::new(),
    };

    // --- Prestart hooks ------------------------------------------------
    if !ctx.spec.prestart.is_empty() {
        for hook in &ctx.spec.prestart {
            dispatch_hook(ctx, hook, hook_wiring.clone())
                .await
                .with_context(|| format!("prestart hook {}", hook.label()))?;
        }
        ctx.emit(EventType::ServicePrestart);
    }
    ctx.advance(&mut state, ServiceState::Prestarted);

    // --- Supervised run ------------------------------------------------
    ctx.emit(EventType::ServiceStarting);
    ctx.advance(&mut state, ServiceState::Starting);

    let env_vars = runner_wiring.env_map(&ctx.service);
    let args: Vec<String> = ctx
        .spec
        .args
        .iter()
        .map(|arg| expand_templates(arg, &env_vars))
        .collect();

    let runner = ctx
        .kind
        .runner(RunnerParams {
            env: Arc::clone(&ctx.env),
            service: ctx.service.clone(),
            spec: ctx.spec.clone(),
            args,
            env_vars,
            wiring: runner_wiring,
            endpoints: backing_endpoints.clone(),
            artifacts: Arc::clone(&ctx.artifacts),
            service_dir,
        })
        .await
        .context("build runner")?;

    let runner_cancel = ctx.env.cancel.child_token();
    let mut runner_task = tokio::spawn(runner.run(runner_cancel.clone()));

    let continuation = async {
        for (name, ingress) in &ingress_list {
            let endpoint = &backing_endpoints[name];
            let checker = ctx
                .kind
                .ready_check(&ctx.env, &ctx.service)
                .unwrap_or_else(|| ready::checker_for(ingress.protocol, ingress.ready.as_ref()));
            ready::poll(
                &ctx.env.cancel,
                &ctx.env.log,
                &ctx.service,
                name,
                &endpoint.host,
                endpoint.port,
                checker.as_ref(),
                ingress.ready.as_ref(),
            )
            .await?;
        }
        ctx.emit(EventType::ServiceHealthy);

        if !ctx.spec.init.is_empty() {
            ctx.emit(EventType::ServiceInit);
            for hook in &ctx.spec.init {
                // Init hooks see ingresses only; the egress map is
                // deliberately empty.
                dispatch_hook(ctx, hook, hook_wiring.ingresses_only())
                    .await
                    .with_context(|| format!("init hook {}", hook.label()))?;
            }
        }
        ctx.emit(EventType::ServiceReady);

        // Stay parked so the supervision group lives until teardown.
        std::future::pending::<()>().await;
        Ok::<(), anyhow::Error>(())
    };
    tokio::pin!(continuation);

    let mut runner_joined = false;
    let result = tokio::select! {
        joined = &mut runner_task => {
            runner_joined = true;
            // The runner exiting on its own is a failure whether it was
            // before READY (never came up) or after (crashed); teardown
            // is the only clean way out.
            match joined {
                _ if ctx.env.cancel.is_cancelled() => Ok(()),
                Ok(Ok(())) => Err(anyhow::anyhow!("service exited before teardown")),
                Ok(Err(error)) => Err(error),
                Err(join_error) => Err(anyhow::anyhow!("runner panicked: {join_error}")),
            }
        }
        step = &mut continuation => {
            // Only reachable on error: the happy path parks forever.
            runner_cancel.cancel();
            let _ = (&mut runner_task).await;
            runner_joined = true;
            match step {
                Err(error) => Err(error),
                Ok(()) => Err(anyhow::anyhow!("lifecycle continuation ended unexpectedly")),
            }
        }
        _ = ctx.env.cancel.cancelled() => Ok(()),
    };

    match result {
        Ok(()) => {
            // Teardown: stop the runner and report it.
            ctx.emit(EventType::ServiceStopping);
            ctx.advance(&mut state, ServiceState::Stopping);
            runner_cancel.cancel();
            if !runner_joined {
                let _ = (&mut runner_task).await;
            }
            ctx.emit(EventType::ServiceStopped);
            ctx.advance(&mut state, ServiceState::Stopped);
            Ok(())
        }
        Err(error) => Err(error),
    }
}

fn external_proxy_port(ctx: &LifecycleCtx, ingress: &str) -> Option<u16> {
    ctx.observe
        .as_ref()
        .and_then(|plan| plan.external_port(&ctx.service, ingress))
}

fn edge_proxy_port(ctx: &LifecycleCtx, egress: &str) -> Option<u16> {
    ctx.observe
        .as_ref()
        .and_then(|plan| plan.edge_port(&ctx.service, egress))
}

async fn dispatch_hook(
    ctx: &LifecycleCtx,
    hook: &HookSpec,
    wiring: WiringContext,
) -> anyhow::Result<()> {
    match hook {
        HookSpec::ClientFunction { name } => {
            callback::call_hook(&ctx.env, &ctx.service, name, wiring).await
        }
        server_side => {
            ctx.kind
                .run_hook(
                    HookParams {
                        env: &ctx.env,
                        service: &ctx.service,
                        spec: &ctx.spec,
                        wiring: &wiring,
                    },
                    server_side,
                )
                .await
        }
    }
}
