//! HTTP Front End (§4.7): one axum [`Router`] fronting both server
//! transports plus the optional `?target=` passthrough. Permissive CORS and
//! the bounded/lenient body reading are shared here so `server::sse` and
//! `server::streamable_http` don't each reimplement them.

pub mod passthrough;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use serde_json::Value;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use mcp_relay_core::protocol::{self, Envelope, Id, JsonRpcError};

use crate::config::Config;
use crate::error::ProxyError;
use crate::server::{sse, streamable_http, ChannelRegistry};
use crate::session_manager::SessionManager;

/// A request body larger than this is rejected before it ever reaches a
/// codec — generous enough for any real MCP payload, small enough to bound
/// memory per in-flight request.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// §6: clients echo this on every request after `initialize`.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub sse_channels: Arc<ChannelRegistry>,
    pub stream_channels: Arc<ChannelRegistry>,
    pub enable_proxy: bool,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, enable_proxy: bool) -> Self {
        let event_store = manager.event_store();
        Self {
            sse_channels: Arc::new(ChannelRegistry::new(event_store.clone())),
            stream_channels: Arc::new(ChannelRegistry::new(event_store)),
            manager,
            enable_proxy,
        }
    }
}

/// Build the top-level router per §6's `--server` selection, wiring whichever
/// of the SSE/StreamableHTTP server transports was requested and the
/// `?target=` passthrough if `--enable-proxy` was passed.
pub fn build_router(config: &Config, manager: Arc<SessionManager>) -> Router {
    let state = AppState::new(manager, config.enable_proxy);

    let mut router = Router::new().route("/healthz", get(health));

    if config.server.wants_sse() {
        router = router
            .route(&config.sse_endpoint, get(sse::get_stream).post(sse::post_message));
    }
    if config.server.wants_stream() {
        router = router.route(
            &config.stream_endpoint,
            get(streamable_http::get_stream)
                .post(streamable_http::post_message)
                .delete(streamable_http::delete_session),
        );
    }
    if config.enable_proxy {
        router = router.route("/", any(passthrough::handle));
    }

    router
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(permissive_cors())
}

async fn health() -> &'static str {
    "ok"
}

/// §4.7: echo `Origin` and the requested headers back rather than a literal
/// `*` (wildcards are rejected once credentials are allowed), allow
/// credentials, and the listed methods. `OPTIONS` preflight is handled by
/// this layer directly, short-circuiting to 204.
fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
}

/// §4.7 "on JSON parse failure the body is treated as `null` and the request
/// still dispatched" — the transport then errors with a JSON-RPC parse error
/// instead of the HTTP layer rejecting the request outright.
pub fn parse_body_lenient(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

/// Decode a request body into an [`Envelope`], or — on malformed JSON — a
/// ready-made JSON-RPC parse-error response envelope to send straight back
/// rather than reject the HTTP request outright (§4.1, §4.7, §7 BodyParse).
pub fn decode_request_body(bytes: &[u8]) -> Result<Envelope, Envelope> {
    protocol::decode(bytes)
        .map_err(|e| Envelope::error_response(Id::Null, JsonRpcError::parse_error(e.to_string())))
}

/// `mcp-session-id` from the header, falling back to the `sessionId` query
/// parameter (§6: "session id in header or query").
pub fn session_id_from(headers: &HeaderMap, query_session_id: Option<&str>) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_session_id.map(str::to_string))
}

/// Render a successful envelope as a `200 application/json` response.
pub fn json_response(envelope: &Envelope) -> Response {
    json_body(StatusCode::OK, envelope)
}

fn json_body(status: StatusCode, envelope: &Envelope) -> Response {
    let body = protocol::encode_string(envelope);
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Render a [`ProxyError`] as the JSON-RPC error envelope §4.6/§7/§8 call
/// for: lifecycle errors (missing/unknown session, connection lost) always
/// report `id: null` even when the original request's id is known — the
/// proxy couldn't resolve which upstream call it belongs to — while a
/// relayed upstream error is propagated verbatim under the client's
/// original id (§7 Relay).
pub fn error_response(err: &ProxyError, original_id: Option<Id>) -> Response {
    let id = if err.correlates_with_request() {
        original_id.unwrap_or(Id::Null)
    } else {
        Id::Null
    };
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::OK);
    json_body(status, &err.into_envelope(id))
}
