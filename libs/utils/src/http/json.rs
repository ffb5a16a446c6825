use hyper::{header, Body, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use super::error::ApiError;

pub async fn json_request<T: DeserializeOwned>(request: &mut Request<Body>) -> Result<T, ApiError> {
    let whole_body = hyper::body::to_bytes(request.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(e.into()))?;
    serde_json::from_slice(&whole_body)
        .map_err(|e| ApiError::BadRequest(anyhow::anyhow!("Failed to parse json request: {e}")))
}

pub fn json_response<T: Serialize>(
    status: StatusCode,
    data: T,
) -> Result<Response<Body>, ApiError> {
    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json))
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Ok(response)
}
