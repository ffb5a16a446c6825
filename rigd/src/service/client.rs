//! In-test function services: the "service" is a function inside the
//! client process. The daemon publishes its ingresses like any other
//! service, asks the client to start the function, and supervises it
//! through the `service.error` side of the callback channel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rig_api::wiring::Endpoint;
use tokio_util::sync::CancellationToken;

use super::{PublishParams, Runnable, RunnerParams, ServiceKind};
use crate::callback;

pub struct ClientFunctionKind;

#[async_trait]
impl ServiceKind for ClientFunctionKind {
    fn tag(&self) -> &'static str {
        "function"
    }

    async fn publish(
        &self,
        params: PublishParams<'_>,
    ) -> anyhow::Result<BTreeMap<String, Endpoint>> {
        // The client function binds the allocated ports itself, inside
        // the test process.
        Ok(params.default_endpoints())
    }

    async fn runner(&self, params: RunnerParams) -> anyhow::Result<Box<dyn Runnable>> {
        Ok(Box::new(ClientRunner { params }))
    }
}

struct ClientRunner {
    params: RunnerParams,
}

#[async_trait]
impl Runnable for ClientRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let env = &self.params.env;
        let service = &self.params.service;

        // An error posted by the client before teardown fails the
        // service; teardown itself resolves the run cleanly (the client
        // observes cancellation through the event stream ending).
        let mut errors = env.register_client_service(service);
        callback::request_client_start(env, service, self.params.wiring.clone());

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            error = errors.recv() => match error {
                Some(error) => anyhow::bail!("client service {service} failed: {error}"),
                None => Ok(()),
            },
        }
    }
}
