//! `?target=` passthrough (§4.7, opt-in via `--enable-proxy`): an opaque
//! reverse proxy to whatever absolute URL the caller names, independent of
//! the Session Manager entirely. Header filtering, body passthrough, and the
//! SSE-content-type response handling mirror a plain request-forwarding
//! reverse proxy; no telemetry/event-sink or WebSocket-upgrade path here.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::http::AppState;

const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &["host", "connection", "transfer-encoding", "upgrade"];
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["transfer-encoding", "connection"];

#[derive(Debug, Deserialize)]
pub struct PassthroughQuery {
    pub target: Option<String>,
}

/// Forward the request verbatim to `?target=`, streaming the response body
/// back unmodified. `404` if passthrough wasn't enabled or no target was
/// given; `502` if the upstream couldn't be reached at all.
pub async fn handle(
    State(state): State<AppState>,
    Query(query): Query<PassthroughQuery>,
    req: Request<Body>,
) -> Response {
    if !state.enable_proxy {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(target) = query.target else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let method = req.method().clone();
    let headers = req.headers().clone();

    let body_bytes = match axum::body::to_bytes(req.into_body(), crate::http::MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read passthrough request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let client = reqwest::Client::new();
    let mut upstream_req = client.request(method, &target);
    upstream_req = forward_request_headers(upstream_req, &headers);
    if !body_bytes.is_empty() {
        upstream_req = upstream_req.body(body_bytes.to_vec());
    }

    let upstream_response = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, target = %target, "passthrough upstream request failed");
            return (StatusCode::BAD_GATEWAY, format!("upstream request failed: {e}")).into_response();
        }
    };

    let status = upstream_response.status().as_u16();
    let resp_headers = upstream_response.headers().clone();
    let body = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read passthrough upstream response body");
            return (StatusCode::BAD_GATEWAY, "failed to read upstream response body").into_response();
        }
    };

    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in resp_headers.iter() {
        if HOP_BY_HOP_RESPONSE_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn forward_request_headers(
    mut upstream_req: reqwest::RequestBuilder,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_REQUEST_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            upstream_req = upstream_req.header(name.clone(), v);
        }
    }
    upstream_req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_without_target_deserializes_to_none() {
        let q: PassthroughQuery = serde_urlencoded::from_str("").unwrap();
        assert!(q.target.is_none());
    }

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(HOP_BY_HOP_REQUEST_HEADERS.contains(&"host"));
        assert!(HOP_BY_HOP_RESPONSE_HEADERS.contains(&"connection"));
    }
}
