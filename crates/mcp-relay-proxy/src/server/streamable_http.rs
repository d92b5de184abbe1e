//! StreamableHTTP server transport (§4.4): one endpoint for both directions
//! (`POST`/`GET`/`DELETE /mcp` over one shared state), terminating the
//! Session Manager's client side rather than reverse-proxying to a real
//! upstream, mirroring `server::sse`'s dispatch but without a second
//! endpoint.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, StreamExt};
use mcp_relay_core::event_store::StoredEvent;
use mcp_relay_core::protocol::{self, Envelope};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::http::{AppState, SESSION_ID_HEADER};

use super::SessionChannel;

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

/// `POST /mcp` — the transport's primary direction. An `initialize` request
/// arrives here with no prior GET (§4.6 step 1 onward); every other request
/// or notification requires the session id the client received on its
/// `initialize` response (§6).
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    body: axum::body::Bytes,
) -> Response {
    let envelope = match crate::http::decode_request_body(&body) {
        Ok(envelope) => envelope,
        Err(parse_error) => return crate::http::json_response(&parse_error),
    };

    if envelope.is_initialize_request() {
        let sid = crate::http::session_id_from(&headers, query.session_id.as_deref())
            .unwrap_or_else(|| state.manager.resolve_session_id(None));
        let channel: std::sync::Arc<SessionChannel> = state.stream_channels.get_or_create(&sid);
        return match state.manager.initialize(sid.clone(), envelope, channel).await {
            Ok(response) => {
                let mut resp = crate::http::json_response(&response);
                if let Ok(value) = HeaderValue::from_str(&sid) {
                    resp.headers_mut().insert(SESSION_ID_HEADER, value);
                }
                resp
            }
            Err(e) => crate::http::error_response(&e, None),
        };
    }

    let Some(sid) = crate::http::session_id_from(&headers, query.session_id.as_deref()) else {
        return crate::http::error_response(&crate::error::ProxyError::MissingSession, None);
    };

    if envelope.is_notification() {
        return match state.manager.dispatch_notification(Some(sid), envelope).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => crate::http::error_response(&e, None),
        };
    }

    let original_id = envelope.id.clone();
    match state.manager.dispatch_request(Some(sid), envelope).await {
        Ok(response) => crate::http::json_response(&response),
        Err(e) => crate::http::error_response(&e, original_id),
    }
}

/// `GET /mcp` — opens the server-push stream for an already-initialized
/// session (§4.4: "the server MAY open an SSE stream" on GET). Symmetric to
/// [`crate::server::sse::get_stream`]: a reconnect rebinds the bridge's sink
/// and, given `Last-Event-ID`, replays from the event store first.
pub async fn get_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(sid) = crate::http::session_id_from(&headers, query.session_id.as_deref()) else {
        return crate::http::error_response(&crate::error::ProxyError::MissingSession, None);
    };

    let (channel, rx, existed) = state.stream_channels.reconnect(&sid);
    if existed {
        let sink: std::sync::Arc<dyn crate::bridge::ServerSink> = channel.clone();
        state.manager.rebind_sink(&sid, sink).await;
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let replay: Vec<StoredEvent> = match last_event_id {
        Some(id) => state.manager.event_store().replay_from(&sid, id).await,
        None => Vec::new(),
    };

    let replay_stream = stream::iter(replay.into_iter().map(|e| Ok::<_, Infallible>(stored_event(e))));
    let live_stream =
        UnboundedReceiverStream::new(rx).map(|(event_id, envelope)| Ok::<_, Infallible>(live_event(event_id, envelope)));

    let sse = Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default());
    sse.into_response()
}

fn stored_event(e: StoredEvent) -> Event {
    Event::default()
        .id(e.event_id.to_string())
        .data(String::from_utf8_lossy(&e.payload).into_owned())
}

fn live_event(event_id: u64, envelope: Envelope) -> Event {
    Event::default()
        .id(event_id.to_string())
        .data(protocol::encode_string(&envelope))
}

/// `DELETE /mcp` — an explicit session close (§4.4 supplemental): unbinds
/// the session from its connection and drops its local channel and replay
/// buffer. Idempotent — closing an already-closed or unknown session still
/// answers `204`.
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(sid) = crate::http::session_id_from(&headers, query.session_id.as_deref()) else {
        return crate::http::error_response(&crate::error::ProxyError::MissingSession, None);
    };
    state.manager.on_session_closed(&sid).await;
    state.stream_channels.remove(&sid);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_query_prefers_explicit_session_id() {
        let q: SessionQuery = serde_urlencoded::from_str("sessionId=xyz").unwrap();
        assert_eq!(q.session_id.as_deref(), Some("xyz"));
    }
}
