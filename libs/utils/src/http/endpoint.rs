use std::future::Future;

use hyper::{Body, Request, Response};
use routerify::{Middleware, RequestInfo, Router, RouterBuilder};
use tracing::{info, info_span, Instrument};

use super::error::{route_error_handler, ApiError};

/// Adds a tracing span to a handler. Use this to distinguish between
/// logging of different HTTP requests: every request handler is wrapped
/// in a span that contains the request method and path.
pub async fn request_span<R, H>(request: Request<Body>, handler: H) -> R::Output
where
    R: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
    H: FnOnce(Request<Body>) -> R + Send + Sync + 'static,
{
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let method = request.method();
    let path = request.uri().path();
    let request_span = info_span!("request", %method, %path, %request_id);

    async move {
        let cancellation_guard = RequestCancelled::warn_when_dropped_without_responding();
        let result = handler(request).await;
        cancellation_guard.disarm();
        result
    }
    .instrument(request_span)
    .await
}

/// Drop guard to WARN in case the request was dropped before completion.
struct RequestCancelled {
    warn: Option<tracing::Span>,
}

impl RequestCancelled {
    /// Create the drop guard using the [`tracing::Span`] of the request handler.
    fn warn_when_dropped_without_responding() -> Self {
        RequestCancelled {
            warn: Some(tracing::Span::current()),
        }
    }

    /// Consume the drop guard without logging anything.
    fn disarm(mut self) {
        self.warn = None;
    }
}

impl Drop for RequestCancelled {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // we are unwinding due to panicking, assume we are not dropped for cancellation
        } else if let Some(span) = self.warn.take() {
            // the span has all of the info already, but the outer `.instrument(span)` has already
            // been dropped, so we need to manually re-enter it for this message.
            let _g = span.entered();
            tracing::warn!("request was dropped before completing");
        }
    }
}

async fn logger_middleware(res: Response<Body>, info: RequestInfo) -> Result<Response<Body>, ApiError> {
    info!(
        "{} {} -> {}",
        info.method(),
        info.uri().path(),
        res.status().as_u16()
    );
    Ok(res)
}

pub fn make_router() -> RouterBuilder<hyper::Body, ApiError> {
    Router::builder()
        .middleware(Middleware::post_with_info(logger_middleware))
        .err_handler(route_error_handler)
}
