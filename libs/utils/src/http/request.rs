use std::str::FromStr;

use hyper::body::HttpBody;
use hyper::{Body, Request};
use routerify::ext::RequestExt;

use super::error::ApiError;

pub fn get_request_param<'a>(
    request: &'a Request<Body>,
    param_name: &str,
) -> Result<&'a str, ApiError> {
    match request.param(param_name) {
        Some(arg) => Ok(arg),
        None => Err(ApiError::BadRequest(anyhow::anyhow!(
            "no {param_name} specified in request path"
        ))),
    }
}

pub fn parse_request_param<T: FromStr>(
    request: &Request<Body>,
    param_name: &str,
) -> Result<T, ApiError> {
    match get_request_param(request, param_name)?.parse() {
        Ok(v) => Ok(v),
        Err(_) => Err(ApiError::BadRequest(anyhow::anyhow!(
            "failed to parse {param_name}"
        ))),
    }
}

pub fn get_query_param<'a>(
    request: &'a Request<Body>,
    param_name: &str,
) -> Result<Option<&'a str>, ApiError> {
    let query = match request.uri().query() {
        Some(q) => q,
        None => return Ok(None),
    };
    let mut values = query.split('&').filter_map(|pair| {
        pair.split_once('=')
            .filter(|(key, _)| *key == param_name)
            .map(|(_, value)| value)
    });
    let value1 = values.next();
    if values.next().is_some() {
        return Err(ApiError::BadRequest(anyhow::anyhow!(
            "param {param_name} specified more than once"
        )));
    }
    Ok(value1)
}

pub fn parse_query_param<E: std::fmt::Display, T: FromStr<Err = E>>(
    request: &Request<Body>,
    param_name: &str,
) -> Result<Option<T>, ApiError> {
    get_query_param(request, param_name)?
        .map(|v| {
            v.parse().map_err(|e| {
                ApiError::BadRequest(anyhow::anyhow!("cannot parse query param {param_name}: {e}"))
            })
        })
        .transpose()
}

pub async fn ensure_no_body(request: &mut Request<Body>) -> Result<(), ApiError> {
    match request.body_mut().data().await {
        Some(_) => Err(ApiError::BadRequest(anyhow::anyhow!(
            "Unexpected request body"
        ))),
        None => Ok(()),
    }
}
