//! The callback channel: code that must run inside the client process
//! (client-function hooks, in-test services) is dispatched as a
//! `callback.request` event and answered through the POST-events
//! endpoint. The lifecycle logically suspends on the log until the
//! correlated `callback.response` appears.

use rig_api::events::{CallbackKind, CallbackPayload, Event, EventType};
use rig_api::wiring::WiringContext;
use utils::id::EnvironmentId;

use crate::environment::EnvHandle;

/// `instanceId-serviceName-callbackName`: unique within an environment.
pub fn request_id(env_id: EnvironmentId, service: &str, name: &str) -> String {
    format!("{env_id}-{service}-{name}")
}

/// Dispatch a client-function hook and block until the client answers or
/// the environment is cancelled. The client's startup budget bounds this
/// wait; the daemon itself imposes no clock.
pub async fn call_hook(
    env: &EnvHandle,
    service: &str,
    name: &str,
    wiring: WiringContext,
) -> anyhow::Result<()> {
    let request_id = request_id(env.id, service, name);

    let mut request = Event::service(EventType::CallbackRequest, service);
    request.callback = Some(CallbackPayload {
        request_id: request_id.clone(),
        name: name.to_string(),
        kind: CallbackKind::Hook,
        wiring: Some(wiring),
        error: None,
    });
    env.log.publish(request);

    let response = env
        .log
        .wait_for(&env.cancel, |event| {
            event.kind == EventType::CallbackResponse
                && event
                    .callback
                    .as_ref()
                    .map_or(false, |c| c.request_id == request_id)
        })
        .await?;

    match response.callback.and_then(|c| c.error) {
        Some(error) => anyhow::bail!("client hook {name} failed: {error}"),
        None => Ok(()),
    }
}

/// Ask the client to start an in-test service function. Non-blocking:
/// the client acknowledges by simply running it; failures come back as
/// `service.error` posts.
pub fn request_client_start(env: &EnvHandle, service: &str, wiring: WiringContext) {
    let mut request = Event::service(EventType::CallbackRequest, service);
    request.callback = Some(CallbackPayload {
        request_id: request_id(env.id, service, "start"),
        name: service.to_string(),
        kind: CallbackKind::Start,
        wiring: Some(wiring),
        error: None,
    });
    env.log.publish(request);
}
