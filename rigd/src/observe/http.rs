//! L7 HTTP reverse proxy for observed edges. Requests pass through
//! unmodified; method, path, status, latency, headers, and up to 64 KiB
//! of each body are reported as `request.completed` events once the
//! response has fully streamed.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Request, Response, StatusCode};
use rig_api::events::{Event, EventType, HttpRequestInfo};
use rig_api::wiring::Endpoint;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EdgeLabels, BODY_CAPTURE_LIMIT};
use crate::eventlog::EventLog;

/// Called exactly once when the wrapped body finishes (or is dropped),
/// with the captured prefix and any trailers that arrived.
pub(crate) type OnDone = Box<dyn FnOnce(Bytes, Option<HeaderMap>) + Send>;

/// Pass-through body that captures a bounded prefix of what flows
/// through it. The capture never delays or truncates the real stream.
pub(crate) struct TeeBody {
    inner: Body,
    captured: BytesMut,
    on_done: Option<OnDone>,
}

impl TeeBody {
    pub(crate) fn new(inner: Body, on_done: OnDone) -> Self {
        TeeBody {
            inner,
            captured: BytesMut::new(),
            on_done: Some(on_done),
        }
    }
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let room = BODY_CAPTURE_LIMIT.saturating_sub(this.captured.len());
                if room > 0 {
                    this.captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_trailers(cx) {
            Poll::Ready(Ok(trailers)) => {
                if let Some(on_done) = this.on_done.take() {
                    on_done(std::mem::take(&mut this.captured).freeze(), trailers.clone());
                }
                Poll::Ready(Ok(trailers))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // The peer may disconnect mid-stream; report what we saw.
        if let Some(on_done) = self.on_done.take() {
            on_done(std::mem::take(&mut self.captured).freeze(), None);
        }
    }
}

pub(crate) fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn capture_to_string(bytes: &Bytes) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).to_string())
    }
}

pub fn spawn(
    cancel: CancellationToken,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    listener: std::net::TcpListener,
    backing: Endpoint,
) -> anyhow::Result<()> {
    let client = hyper::Client::new();
    let make_svc = make_service_fn(move |_conn| {
        let client = client.clone();
        let log = Arc::clone(&log);
        let labels = labels.clone();
        let backing = backing.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                proxy_request(
                    client.clone(),
                    Arc::clone(&log),
                    labels.clone(),
                    backing.clone(),
                    request,
                )
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await });
    tokio::spawn(async move {
        if let Err(e) = server.await {
            debug!("observe http proxy exited: {e}");
        }
    });
    Ok(())
}

async fn proxy_request(
    client: hyper::Client<hyper::client::HttpConnector>,
    log: Arc<EventLog>,
    labels: EdgeLabels,
    backing: Endpoint,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let started_at = Instant::now();
    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let request_headers = headers_to_map(request.headers());

    // Requests in a test environment are bounded; buffer to keep the
    // forwarding simple. Responses stream through a capturing tee.
    let (parts, body) = request.into_parts();
    let request_body = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("observe proxy failed to read request body: {e}");
            return Ok(error_response(StatusCode::BAD_GATEWAY));
        }
    };
    let request_capture = request_body.slice(..request_body.len().min(BODY_CAPTURE_LIMIT));

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
            debug!("observe proxy failed to build request: {e}");
            return Ok(error_response(StatusCode::BAD_GATEWAY));
        }
    };

    let response = match client.request(outbound).await {
        Ok(response) => response,
        Err(e) => {
            debug!("observe proxy upstream error: {e}");
            emit_completed(
                &log,
                &labels,
                &method,
                &path,
                StatusCode::BAD_GATEWAY.as_u16(),
                started_at,
                request_headers,
                BTreeMap::new(),
                &request_capture,
                &Bytes::new(),
            );
            return Ok(error_response(StatusCode::BAD_GATEWAY));
        }
    };

    let status = response.status().as_u16();
    let response_headers = headers_to_map(response.headers());
    let (parts, body) = response.into_parts();
    let on_done: OnDone = {
        let log = Arc::clone(&log);
        let labels = labels.clone();
        let method = method.clone();
        let path = path.clone();
        Box::new(move |response_capture, _trailers| {
            emit_completed(
                &log,
                &labels,
                &method,
                &path,
                status,
                started_at,
                request_headers,
                response_headers,
                &request_capture,
                &response_capture,
            );
        })
    };
    Ok(Response::from_parts(parts, Body::wrap_stream(BodyStream(TeeBody::new(body, on_done)))))
}

fn error_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

#[allow(clippy::too_many_arguments)]
fn emit_completed(
    log: &EventLog,
    labels: &EdgeLabels,
    method: &str,
    path: &str,
    status: u16,
    started_at: Instant,
    request_headers: BTreeMap<String, String>,
    response_headers: BTreeMap<String, String>,
    request_capture: &Bytes,
    response_capture: &Bytes,
) {
    let mut event = Event::new(EventType::RequestCompleted);
    event.request = Some(HttpRequestInfo {
        source: labels.source.clone(),
        target: labels.target.clone(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms: started_at.elapsed().as_millis() as u64,
        request_headers,
        response_headers,
        request_body: capture_to_string(request_capture),
        response_body: capture_to_string(response_capture),
    });
    log.publish(event);
}

/// Adapter from `HttpBody` to the `Stream` shape `Body::wrap_stream`
/// wants.
struct BodyStream(TeeBody);

impl futures::Stream for BodyStream {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.0).poll_data(cx) {
            Poll::Ready(None) => {
                // Trailers are irrelevant to plain HTTP edges, but the
                // tee fires its completion callback there; poll it.
                match Pin::new(&mut this.0).poll_trailers(cx) {
                    Poll::Ready(_) => Poll::Ready(None),
                    Poll::Pending => Poll::Pending,
                }
            }
            other => other,
        }
    }
}
