//! L7 relay for gRPC edges: an HTTP/2 reverse proxy that decodes the
//! service/method from the request path and the result from the
//! `grpc-status` trailer, and captures the raw request frames.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use rig_api::events::{Event, EventType, GrpcCallInfo};
use rig_api::wiring::Endpoint;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http::{OnDone, TeeBody};
use super::{EdgeLabels, BODY_CAPTURE_LIMIT};
use crate::eventlog::EventLog;

pub fn spawn(
    cancel: CancellationToken,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    listener: std::net::TcpListener,
    backing: Endpoint,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let client = hyper::Client::builder().http2_only(true).build_http::<Body>();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("observe grpc accept failed: {e}");
                    continue;
                }
            };

            let client = client.clone();
            let log = Arc::clone(&log);
            let labels = labels.clone();
            let backing = backing.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    relay_call(
                        client.clone(),
                        Arc::clone(&log),
                        labels.clone(),
                        backing.clone(),
                        request,
                    )
                });
                let connection = hyper::server::conn::Http::new()
                    .http2_only(true)
                    .serve_connection(stream, service);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = connection => {
                        if let Err(e) = result {
                            debug!("observe grpc connection ended: {e}");
                        }
                    }
                }
            });
        }
    });
    Ok(())
}

fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((service, method)) => (service.to_string(), method.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

/// grpc-status from the trailers, falling back to the response headers
/// for trailers-only responses.
fn grpc_status(
    headers: &hyper::HeaderMap,
    trailers: Option<&hyper::HeaderMap>,
) -> Option<String> {
    trailers
        .and_then(|t| t.get("grpc-status"))
        .or_else(|| headers.get("grpc-status"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn relay_call(
    client: hyper::Client<hyper::client::HttpConnector>,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    backing: Endpoint,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let started_at = Instant::now();
    let path = request.uri().path().to_string();
    let (grpc_service, grpc_method) = split_path(&path);

    let (parts, body) = request.into_parts();
    let request_body = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("observe grpc failed to read request: {e}");
            return Ok(h2_error_response());
        }
    };
    let frames = request_body.slice(..request_body.len().min(BODY_CAPTURE_LIMIT));

    let uri = format!("http://{}:{}{path}", backing.host, backing.port);
    let mut outbound = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        if name != hyper::header::HOST {
            outbound = outbound.header(name, value);
        }
    }
    let outbound = match outbound.body(Body::from(request_body)) {
        Ok(outbound) => outbound,
        Err(e) => {
            debug!("observe grpc failed to build request: {e}");
            return Ok(h2_error_response());
        }
    };

    let response = match client.request(outbound).await {
        Ok(response) => response,
        Err(e) => {
            debug!("observe grpc upstream error: {e}");
            emit_call(&log, &labels, grpc_service, grpc_method, None, started_at, &frames);
            return Ok(h2_error_response());
        }
    };

    let response_headers = response.headers().clone();
    let (parts, body) = response.into_parts();
    let on_done: OnDone = Box::new(move |_captured, trailers| {
        let status = grpc_status(&response_headers, trailers.as_ref());
        emit_call(&log, &labels, grpc_service, grpc_method, status, started_at, &frames);
    });
    let (mut sender, relayed_body) = Body::channel();
    let mut tee = TeeBody::new(body, on_done);
    tokio::spawn(async move {
        use hyper::body::HttpBody;
        loop {
            match futures::future::poll_fn(|cx| std::pin::Pin::new(&mut tee).poll_data(cx)).await {
                Some(Ok(chunk)) => {
                    if sender.send_data(chunk).await.is_err() {
                        return;
                    }
                }
                Some(Err(_)) => {
                    sender.abort();
                    return;
                }
                None => break,
            }
        }
        match futures::future::poll_fn(|cx| std::pin::Pin::new(&mut tee).poll_trailers(cx)).await {
            Ok(Some(trailers)) => {
                let _ = sender.send_trailers(trailers).await;
            }
            Ok(None) => {}
            Err(_) => sender.abort(),
        }
    });
    Ok(Response::from_parts(parts, relayed_body))
}

fn h2_error_response() -> Response<Body> {
    // An unreachable backend renders as the UNAVAILABLE status code in
    // gRPC terms, delivered trailers-only.
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/grpc")
        .header("grpc-status", "14")
        .body(Body::empty())
        .expect("static response")
}

fn emit_call(
    log: &EventLog,
    labels: &EdgeLabels,
    service: String,
    method: String,
    status: Option<String>,
    started_at: Instant,
    frames: &Bytes,
) {
    let mut event = Event::new(EventType::GrpcCallCompleted);
    event.grpc = Some(GrpcCallInfo {
        source: labels.source.clone(),
        target: labels.target.clone(),
        service,
        method,
        status,
        latency_ms: started_at.elapsed().as_millis() as u64,
        frames_hex: if frames.is_empty() {
            None
        } else {
            Some(hex::encode(frames))
        },
    });
    log.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_splits_into_service_and_method() {
        let (service, method) = split_path("/helloworld.Greeter/SayHello");
        assert_eq!(service, "helloworld.Greeter");
        assert_eq!(method, "SayHello");
    }

    #[test]
    fn status_prefers_trailers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("grpc-status", "0".parse().unwrap());
        let mut trailers = hyper::HeaderMap::new();
        trailers.insert("grpc-status", "13".parse().unwrap());
        assert_eq!(grpc_status(&headers, Some(&trailers)).as_deref(), Some("13"));
        assert_eq!(grpc_status(&headers, None).as_deref(), Some("0"));
    }
}
