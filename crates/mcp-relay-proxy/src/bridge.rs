//! Proxy Bridge (§4.5): given a connection's client transport and the
//! capability set negotiated with it, decides which request methods are
//! forwarded and which notification kinds are relayed, and owns the
//! request/response correlation table for everything in flight on that
//! connection.
//!
//! The source's "map of schema → closure keyed by capability" (§9 design
//! notes) becomes, in typed Rust, two small match-based gating functions
//! plus one generic forwarding path — there is no per-method closure
//! catalog to maintain, because every method not named in the §4.5 table is
//! pass-through by construction (§4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcp_relay_core::capabilities::Capabilities;
use mcp_relay_core::protocol::{Envelope, Id};
use mcp_relay_core::transport::TransportError;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::client::{ClientTransport, TransportEvent};

/// Default upstream request timeout (§5): 30s.
pub const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// §4.5 capability → server-side-handler gating table. Methods absent from
/// this table are always forwarded (§4.1: no closed method universe).
pub fn request_allowed(method: &str, caps: &Capabilities) -> bool {
    match method {
        "prompts/get" | "prompts/list" => caps.prompts,
        "resources/list" | "resources/templates/list" | "resources/read" => caps.resources,
        "resources/subscribe" | "resources/unsubscribe" => caps.resources_subscribe,
        "tools/call" | "tools/list" => caps.tools,
        _ => true,
    }
}

/// §4.5 notification relay gating. `resourceUpdated` only relays
/// upstream→downstream when `resources.subscribe` was negotiated;
/// `loggingMessage` relays in both directions only when `logging` was
/// negotiated. Every other notification kind relays unconditionally.
pub fn notification_relay_allowed(method: &str, caps: &Capabilities) -> bool {
    match method {
        "notifications/resources/updated" => caps.resources_subscribe,
        "notifications/message" => caps.logging,
        _ => true,
    }
}

/// Something the bridge can hand a decoded server-bound envelope to. Each
/// server transport session implements this; the bridge doesn't care
/// whether delivery ends up as an SSE `message` event or a buffered
/// streamable-HTTP chunk.
#[async_trait::async_trait]
pub trait ServerSink: Send + Sync {
    async fn send(&self, envelope: Envelope);
}

fn id_key(id: &Id) -> String {
    serde_json::to_string(&id.as_value()).unwrap_or_default()
}

/// Per-Connection bridge state: the pending-request correlation table and
/// the set of sessions currently bound to this connection (more than one
/// only for the global-connection fallback, §3/§4.6 step 9).
///
/// Pending requests are keyed by the outbound envelope's raw `id` alone, not
/// `(session_id, id)` — id uniqueness is only guaranteed *within* a session
/// (§3), so two sessions sharing the global connection that both happen to
/// pick the same request id at the same moment is a known, undefended edge
/// of the global-singleton fallback (recorded in DESIGN.md rather than
/// solved with invented id namespacing).
pub struct UpstreamLink {
    connection_id: String,
    client: Arc<dyn ClientTransport>,
    capabilities: Mutex<Capabilities>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    sinks: Mutex<HashMap<String, Arc<dyn ServerSink>>>,
}

impl UpstreamLink {
    pub fn new(connection_id: String, client: Arc<dyn ClientTransport>, capabilities: Capabilities) -> Self {
        Self {
            connection_id,
            client,
            capabilities: Mutex::new(capabilities),
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_capabilities(&self, caps: Capabilities) {
        *self.capabilities.lock().await = caps;
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.capabilities.lock().await.clone()
    }

    pub async fn bind_session(&self, session_id: String, sink: Arc<dyn ServerSink>) {
        self.sinks.lock().await.insert(session_id, sink);
    }

    pub async fn unbind_session(&self, session_id: &str) {
        self.sinks.lock().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sinks.lock().await.len()
    }

    /// Forward a request upstream and await its correlated response, or
    /// `TransportError::Timeout` past [`UPSTREAM_REQUEST_TIMEOUT`].
    pub async fn call(&self, envelope: Envelope) -> Result<Envelope, TransportError> {
        let id = envelope
            .id
            .clone()
            .ok_or_else(|| TransportError::InvalidConfig("request envelope has no id".into()))?;
        let key = id_key(&id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = self.client.send(&envelope).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(UPSTREAM_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::UpstreamClosed),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Send a notification upstream, no correlation, best-effort.
    pub async fn notify(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.client.send(&envelope).await
    }

    async fn relay_to_sessions(&self, envelope: Envelope) {
        let sinks = self.sinks.lock().await;
        for sink in sinks.values() {
            sink.send(envelope.clone()).await;
        }
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Envelope::error_response(
                Id::Null,
                mcp_relay_core::protocol::JsonRpcError::internal("upstream connection closed"),
            ));
        }
    }

    /// Drive the transport's event stream for the lifetime of the
    /// connection. Spawned once per connection by the Session Manager right
    /// after `connect()`. `closed_tx` lets the pump tell the Session Manager
    /// the connection died without the bridge needing a reference back into
    /// the session tables (that would make connections and the manager an
    /// ownership cycle).
    pub async fn run_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        closed_tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(envelope) => {
                    if envelope.is_response() {
                        if let Some(id) = &envelope.id {
                            let key = id_key(id);
                            if let Some(tx) = self.pending.lock().await.remove(&key) {
                                let _ = tx.send(envelope);
                                continue;
                            }
                        }
                        tracing::debug!(
                            connection = %self.connection_id,
                            "response with no matching pending request, dropping"
                        );
                    } else if envelope.is_notification() {
                        let caps = self.capabilities().await;
                        let method = envelope.method.as_deref().unwrap_or("");
                        if notification_relay_allowed(method, &caps) {
                            self.relay_to_sessions(envelope).await;
                        }
                    } else {
                        // Server-initiated request from upstream (e.g.
                        // sampling). Relayed generically; the proxy does
                        // not broker a reply back upstream for these.
                        self.relay_to_sessions(envelope).await;
                    }
                }
                TransportEvent::Stderr(line) => {
                    tracing::debug!(connection = %self.connection_id, "upstream stderr: {}", line);
                }
                TransportEvent::Closed => {
                    tracing::info!(connection = %self.connection_id, "upstream transport closed");
                    self.fail_all_pending().await;
                    let _ = closed_tx.send(self.connection_id.clone());
                    break;
                }
                TransportEvent::Error(e) => {
                    tracing::error!(connection = %self.connection_id, "upstream transport error: {}", e);
                    self.fail_all_pending().await;
                    let _ = closed_tx.send(self.connection_id.clone());
                    break;
                }
            }
        }
    }

    pub async fn close(&self) {
        self.client.close().await;
        self.fail_all_pending().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::capabilities::Capabilities;

    #[test]
    fn gated_methods_require_their_capability() {
        let empty = Capabilities::default();
        assert!(!request_allowed("tools/list", &empty));
        assert!(!request_allowed("resources/subscribe", &empty));
        assert!(request_allowed("completion/complete", &empty));
        assert!(request_allowed("some/unknown/method", &empty));
    }

    #[test]
    fn notification_gating_matches_table() {
        let empty = Capabilities::default();
        assert!(!notification_relay_allowed(
            "notifications/resources/updated",
            &empty
        ));
        assert!(!notification_relay_allowed("notifications/message", &empty));
        assert!(notification_relay_allowed("notifications/progress", &empty));
    }
}
