//! Remote streamable-HTTP client transport (§4.3): POSTs each outgoing
//! envelope to the upstream URL and consumes a streamed response (SSE or
//! chunked JSON lines), emitting decoded envelopes as they arrive. Built on
//! `reqwest`'s `Client`/`bytes_stream()` with SSE content-type sniffing, as a
//! `ClientTransport` the Proxy Bridge talks to like any other transport
//! rather than a one-off reverse-proxy handler.

use async_trait::async_trait;
use futures::StreamExt;
use mcp_relay_core::protocol::{self, Envelope};
use mcp_relay_core::transport::TransportError;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{EventSender, TransportEvent};

pub struct RemoteStreamableHttpTransport {
    server_url: String,
    client: Client,
    events: Mutex<Option<EventSender>>,
    /// Set from the upstream's response to the first POST (typically
    /// `initialize`) and echoed on every subsequent request, mirroring the
    /// `mcp-session-id` contract the proxy itself exposes downstream.
    upstream_session_id: Mutex<Option<String>>,
}

impl RemoteStreamableHttpTransport {
    pub fn new(server_url: String) -> Self {
        Self {
            server_url,
            client: Client::new(),
            events: Mutex::new(None),
            upstream_session_id: Mutex::new(None),
        }
    }

    async fn dispatch_response(&self, response: reqwest::Response, events: EventSender) {
        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.upstream_session_id.lock().await = Some(session_id.to_string());
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let mut stream = response.bytes_stream();
            tokio::spawn(async move {
                let mut buf = String::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            buf.push_str(&String::from_utf8_lossy(&bytes));
                            while let Some(pos) = buf.find("\n\n") {
                                let event = buf[..pos].to_string();
                                buf.drain(..pos + 2);
                                if let Some(payload) = parse_sse_data(&event) {
                                    emit_payload(&events, payload.as_bytes());
                                }
                            }
                        }
                        Err(e) => {
                            let _ = events.send(TransportEvent::Error(TransportError::UpstreamIo(
                                e.to_string(),
                            )));
                            break;
                        }
                    }
                }
            });
        } else {
            match response.bytes().await {
                Ok(bytes) if !bytes.is_empty() => emit_payload(&events, &bytes),
                Ok(_) => {}
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(TransportError::UpstreamIo(
                        e.to_string(),
                    )));
                }
            }
        }
    }
}

fn emit_payload(events: &EventSender, payload: &[u8]) {
    match protocol::decode(payload) {
        Ok(envelope) => {
            let _ = events.send(TransportEvent::Message(envelope));
        }
        Err(e) => {
            tracing::warn!("remote streamable http: malformed frame: {}", e);
        }
    }
}

fn parse_sse_data(event: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[async_trait]
impl super::ClientTransport for RemoteStreamableHttpTransport {
    /// Remote HTTP keeps no persistent socket open; `connect()` only records
    /// the event sender that later `send()` calls will push decoded
    /// responses into. Reachability is only proven by the first real POST.
    async fn connect(&self, events: EventSender) -> Result<(), TransportError> {
        *self.events.lock().await = Some(events);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let events = self
            .events
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let mut request = self
            .client
            .post(&self.server_url)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream");

        if let Some(session_id) = self.upstream_session_id.lock().await.clone() {
            request = request.header("mcp-session-id", session_id);
        }

        let body = protocol::encode(envelope);
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::UpstreamIo(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::UpstreamIo(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        self.dispatch_response(response, events).await;
        Ok(())
    }

    async fn close(&self) {
        self.events.lock().await.take();
        self.upstream_session_id.lock().await.take();
    }
}

pub fn from_config(server_url: String) -> Arc<RemoteStreamableHttpTransport> {
    Arc::new(RemoteStreamableHttpTransport::new(server_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientTransport;
    use mcp_relay_core::protocol::Id;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_single_line_sse_data() {
        let event = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1}";
        assert_eq!(
            parse_sse_data(event),
            Some(r#"{"jsonrpc":"2.0","id":1}"#.to_string())
        );
    }

    #[test]
    fn comment_only_event_has_no_data() {
        assert_eq!(parse_sse_data(": heartbeat"), None);
    }

    #[tokio::test]
    async fn send_decodes_a_json_response_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_raw(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#, "application/json"),
            )
            .mount(&mock_server)
            .await;

        let transport = RemoteStreamableHttpTransport::new(mock_server.uri());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let request = Envelope::request(serde_json::json!(1), "ping", None);
        transport.send(&request).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(TransportEvent::Message(envelope))) => {
                assert_eq!(envelope.id, Some(Id::from(serde_json::json!(1))));
                assert_eq!(envelope.result, Some(serde_json::json!({"ok": true})));
            }
            other => panic!("expected a decoded message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_decodes_an_sse_streamed_response() {
        let mock_server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let transport = RemoteStreamableHttpTransport::new(mock_server.uri());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let request = Envelope::request(serde_json::json!(2), "ping", None);
        transport.send(&request).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(TransportEvent::Message(envelope))) => {
                assert_eq!(envelope.id, Some(Id::from(serde_json::json!(2))));
            }
            other => panic!("expected a decoded message event, got {other:?}"),
        }
    }
}
