//! SSE server transport (§4.4): a long-lived GET event stream paired with a
//! correlated POST message endpoint. Unlike a plain reverse-proxy SSE
//! handler that forwards an upstream stream body byte-for-byte, these
//! handlers terminate the client side of the Session Manager's connection,
//! sourcing the stream from the per-session [`EventStore`] instead.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
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

fn resolve_sid(state: &AppState, headers: &HeaderMap, query: &SessionQuery) -> String {
    crate::http::session_id_from(headers, query.session_id.as_deref())
        .unwrap_or_else(|| state.manager.resolve_session_id(None))
}

/// `GET {sseEndpoint}` — opens (or resumes) the event stream for a session.
/// Mints a session id if none was supplied (the first-ever GET for a brand
/// new session); a later reconnect with the same id rebinds the Session
/// Manager's live sink to a fresh channel (§4.6 step 10's inverse — the
/// *client* reconnecting rather than disconnecting) and, with `Last-Event-ID`
/// set, replays everything still resident in the event store before
/// resuming live delivery (§4.2, §8 scenario 5).
pub async fn get_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Response {
    let sid = resolve_sid(&state, &headers, &query);

    let (channel, rx, existed) = state.sse_channels.reconnect(&sid);
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
    let mut response = sse.into_response();
    if let Ok(value) = HeaderValue::from_str(&sid) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
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

/// `POST {sseEndpoint}` — a client-to-server message for an existing (or,
/// for `initialize`, brand new) SSE session. Dispatches through the Session
/// Manager so lifecycle errors (`SessionNotFound`, `ConnectionLost`, ...) and
/// capability gating (§4.5) apply uniformly with the StreamableHTTP variant,
/// rather than proxying straight to a real upstream and returning its raw
/// response.
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    body: axum::body::Bytes,
) -> Response {
    let Some(sid) = crate::http::session_id_from(&headers, query.session_id.as_deref()) else {
        return crate::http::error_response(&crate::error::ProxyError::MissingSession, None);
    };

    let envelope = match crate::http::decode_request_body(&body) {
        Ok(envelope) => envelope,
        Err(parse_error) => return crate::http::json_response(&parse_error),
    };

    if envelope.is_initialize_request() {
        let channel: std::sync::Arc<SessionChannel> = state.sse_channels.get_or_create(&sid);
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

    if envelope.is_notification() {
        return match state.manager.dispatch_notification(Some(sid), envelope).await {
            Ok(()) => axum::http::StatusCode::ACCEPTED.into_response(),
            Err(e) => crate::http::error_response(&e, None),
        };
    }

    let original_id = envelope.id.clone();
    match state.manager.dispatch_request(Some(sid), envelope).await {
        Ok(response) => crate::http::json_response(&response),
        Err(e) => crate::http::error_response(&e, original_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_query_deserializes_session_id_alias() {
        let q: SessionQuery = serde_urlencoded::from_str("sessionId=abc").unwrap();
        assert_eq!(q.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn session_query_defaults_to_none() {
        let q: SessionQuery = serde_urlencoded::from_str("").unwrap();
        assert_eq!(q.session_id, None);
    }
}
