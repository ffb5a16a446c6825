//! The daemon's HTTP API: environment CRUD, the SSE event stream, and
//! the unified client-to-server event channel.

use std::sync::Arc;

use bytes::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use rig_api::events::{CallbackPayload, Event, EventType, LogLinePayload};
use rig_api::models::{
    ClientEventBody, DaemonStatus, EnvironmentCreateResponse, ResolvedEnvironment,
    ValidationErrorsBody,
};
use rig_api::spec::EnvironmentSpec;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use utils::http::endpoint::{self, request_span};
use utils::http::error::ApiError;
use utils::http::json::{json_request, json_response};
use utils::http::request::{parse_query_param, parse_request_param};
use utils::http::{RequestExt, RouterBuilder};
use utils::id::EnvironmentId;

use crate::mgr::{CreateError, EnvironmentMgr};

pub struct State {
    pub mgr: Arc<EnvironmentMgr>,
}

fn get_state(request: &Request<Body>) -> &State {
    request
        .data::<Arc<State>>()
        .expect("unknown state type")
        .as_ref()
}

async fn health_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(
        StatusCode::OK,
        DaemonStatus {
            pid: std::process::id(),
            version: crate::VERSION.to_string(),
        },
    )
}

async fn environment_create_handler(
    mut request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let spec: EnvironmentSpec = json_request(&mut request).await?;
    match get_state(&request).mgr.create(spec) {
        Ok(environment) => json_response(
            StatusCode::CREATED,
            EnvironmentCreateResponse {
                id: environment.id(),
            },
        ),
        Err(CreateError::Validation(validation_errors)) => json_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            ValidationErrorsBody {
                error: "invalid environment spec".to_string(),
                validation_errors,
            },
        ),
        Err(CreateError::Internal(e)) => Err(ApiError::InternalServerError(e)),
    }
}

fn lookup(
    request: &Request<Body>,
) -> Result<(EnvironmentId, Arc<crate::environment::Environment>), ApiError> {
    let id: EnvironmentId = parse_request_param(request, "environment_id")?;
    let environment = get_state(request)
        .mgr
        .get(id)
        .ok_or_else(|| ApiError::NotFound(anyhow::anyhow!("environment {id} not found")))?;
    Ok((id, environment))
}

async fn environment_get_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let (id, environment) = lookup(&request)?;
    json_response(
        StatusCode::OK,
        ResolvedEnvironment {
            id,
            name: environment.handle.name.clone(),
            services: environment.resolved(),
        },
    )
}

/// SSE: replay from the requested cursor (`from_seq` query or
/// `Last-Event-ID` header, default 0), then stream live. One frame per
/// event; the event name is the storage class, the id is the seq, so a
/// reconnecting client resumes with no loss and no duplicates.
async fn environment_events_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let (_, environment) = lookup(&request)?;

    let from_seq = match parse_query_param::<_, u64>(&request, "from_seq")? {
        Some(seq) => seq,
        None => request
            .headers()
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
    };

    let subscription_cancel = CancellationToken::new();
    let mut events = environment
        .log()
        .subscribe(subscription_cancel.clone(), from_seq, None);

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    tokio::spawn(async move {
        // Cancel the subscription when the client goes away or the log
        // terminates; environment.down is always the last frame.
        let _guard = subscription_cancel.drop_guard();
        while let Some(event) = events.recv().await {
            let done = event.kind == EventType::EnvironmentDown;
            let frame = match serde_json::to_string(&event) {
                Ok(data) => format!(
                    "event: {}\nid: {}\ndata: {data}\n\n",
                    event.class().sse_event_name(),
                    event.seq
                ),
                Err(_) => continue,
            };
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return;
            }
            if done {
                return;
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(Body::wrap_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Ok(response)
}

/// The client -> server channel. Everything lands on the environment
/// log; `service.error` is additionally routed to the client-service
/// runner so it can fail its lifecycle.
async fn environment_events_post_handler(
    mut request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let body: ClientEventBody = json_request(&mut request).await?;
    let (_, environment) = lookup(&request)?;
    let handle = &environment.handle;

    match body {
        ClientEventBody::CallbackResponse { request_id, error } => {
            let mut event = Event::new(EventType::CallbackResponse);
            event.callback = Some(CallbackPayload {
                request_id,
                name: String::new(),
                kind: rig_api::events::CallbackKind::Hook,
                wiring: None,
                error,
            });
            handle.log.publish(event);
        }
        ClientEventBody::ServiceError { service, error } => {
            if !handle.deliver_client_error(&service, error.clone()) {
                // No registered client service: record it anyway so the
                // timeline shows what the client tried to report.
                handle.log.publish(
                    Event::service(EventType::ServiceFailed, service).with_error(error),
                );
            }
        }
        ClientEventBody::TestNote { service, note } => {
            let mut event = Event::new(EventType::TestNote);
            event.service = service;
            event.note = Some(note);
            handle.log.publish(event);
        }
        ClientEventBody::ServiceLog {
            service,
            stream,
            line,
        } => {
            let mut event = Event::service(EventType::ServiceLog, service);
            event.line = Some(LogLinePayload { stream, line });
            handle.log.publish(event);
        }
    }

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

async fn environment_delete_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let id: EnvironmentId = parse_request_param(&request, "environment_id")?;
    let persist_log = parse_query_param(&request, "log")?.unwrap_or(false);

    match get_state(&request).mgr.destroy(id, persist_log).await {
        Some(response) => json_response(StatusCode::OK, response),
        None => Err(ApiError::NotFound(anyhow::anyhow!(
            "environment {id} not found"
        ))),
    }
}

pub fn make_router(state: Arc<State>) -> RouterBuilder<hyper::Body, ApiError> {
    endpoint::make_router()
        .data(state)
        .get("/health", |r| request_span(r, health_handler))
        .post("/environments", |r| {
            request_span(r, environment_create_handler)
        })
        .get("/environments/:environment_id", |r| {
            request_span(r, environment_get_handler)
        })
        .get("/environments/:environment_id/events", |r| {
            request_span(r, environment_events_handler)
        })
        .post("/environments/:environment_id/events", |r| {
            request_span(r, environment_events_post_handler)
        })
        .delete("/environments/:environment_id", |r| {
            request_span(r, environment_delete_handler)
        })
}
