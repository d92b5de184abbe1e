//! Server Transport (§4.4): the client-facing half of a Connection. Both
//! variants are axum routers rather than a boxed `handleRequest` trait
//! object — axum already gives each handler its own request/response types,
//! so a single shared request-handling contract collapses naturally into
//! one handler function per HTTP verb+path pair (see `sse.rs`,
//! `streamable_http.rs`).
//!
//! What *is* shared between the two variants is how a message gets from the
//! Proxy Bridge to a specific session's client: [`SessionChannel`]
//! implements [`crate::bridge::ServerSink`] by appending to the session's
//! [`EventStore`] log (so SSE `Last-Event-ID` replay and streamable-HTTP's
//! server-push GET stream both source from the same place) and forwarding
//! to whichever HTTP handler currently holds the live receiving end.

pub mod sse;
pub mod streamable_http;

use std::sync::Arc;

use async_trait::async_trait;
use mcp_relay_core::event_store::EventStore;
use mcp_relay_core::protocol::{self, Envelope};
use tokio::sync::mpsc;

use crate::bridge::ServerSink;

/// One live event destined for a session's client: the event-store id it was
/// assigned (for the SSE `id:` field) paired with the envelope itself.
pub type SessionEvent = (u64, Envelope);

/// The live, per-session delivery channel a server transport hands to the
/// bridge when a session is bound to a connection (§4.6 step 7-8). Dropping
/// the receiver (client disconnected) doesn't lose anything: the event is
/// already durable in the [`EventStore`] for the next `Last-Event-ID` resume.
pub struct SessionChannel {
    session_id: String,
    event_store: Arc<EventStore>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionChannel {
    /// Create a channel and return the paired sink (for the bridge) and
    /// receiver (for whichever HTTP handler reads it live).
    pub fn new(
        session_id: String,
        event_store: Arc<EventStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                session_id,
                event_store,
                tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl ServerSink for SessionChannel {
    async fn send(&self, envelope: Envelope) {
        let bytes = protocol::encode(&envelope);
        let event_id = self.event_store.append(&self.session_id, bytes).await;
        // A disconnected receiver just means nobody is live-streaming right
        // now; the event store already retains it for replay on reconnect.
        let _ = self.tx.send((event_id, envelope));
    }
}

/// The current live [`SessionChannel`] per session id, shared between a
/// transport's GET handler (which owns the live stream's receiver) and its
/// POST handler (which needs the matching sink to hand the Session Manager
/// on `initialize`). Neither SSE nor StreamableHTTP is guaranteed to see GET
/// before POST — SSE conventionally opens the stream first, StreamableHTTP's
/// `initialize` is usually the very first POST with no GET yet — so
/// [`Self::get_or_create`] and [`Self::reconnect`] both tolerate being first.
pub struct ChannelRegistry {
    event_store: Arc<EventStore>,
    sessions: std::sync::Mutex<std::collections::HashMap<String, Arc<SessionChannel>>>,
}

impl ChannelRegistry {
    pub fn new(event_store: Arc<EventStore>) -> Self {
        Self {
            event_store,
            sessions: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// The sink currently on file for `sid`, minting one if this is the
    /// first time the registry has seen it (e.g. an `initialize` POST that
    /// arrived with no prior GET stream).
    pub fn get_or_create(&self, sid: &str) -> Arc<SessionChannel> {
        let mut sessions = self.sessions.lock().expect("channel registry lock");
        sessions
            .entry(sid.to_string())
            .or_insert_with(|| SessionChannel::new(sid.to_string(), self.event_store.clone()).0)
            .clone()
    }

    /// A GET handler (re)attaching its live stream always mints a fresh
    /// channel — reusing the old one's receiver isn't possible once it may
    /// already have been taken by a prior connection of the same stream.
    /// Returns whether a channel already existed for `sid`, which tells the
    /// caller whether this is a genuine reconnect (and so the Session
    /// Manager's bound sink needs rebinding) or the session's first attach.
    pub fn reconnect(&self, sid: &str) -> (Arc<SessionChannel>, mpsc::UnboundedReceiver<SessionEvent>, bool) {
        let (channel, rx) = SessionChannel::new(sid.to_string(), self.event_store.clone());
        let mut sessions = self.sessions.lock().expect("channel registry lock");
        let existed = sessions.insert(sid.to_string(), channel.clone()).is_some();
        (channel, rx, existed)
    }

    pub fn remove(&self, sid: &str) {
        self.sessions.lock().expect("channel registry lock").remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_stable_across_calls() {
        let registry = ChannelRegistry::new(Arc::new(EventStore::default()));
        let a = registry.get_or_create("s1");
        let b = registry.get_or_create("s1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn reconnect_reports_whether_a_channel_already_existed() {
        let registry = ChannelRegistry::new(Arc::new(EventStore::default()));
        let (_, _, existed_first) = registry.reconnect("s1");
        assert!(!existed_first);
        let (_, _, existed_second) = registry.reconnect("s1");
        assert!(existed_second);
    }

    #[tokio::test]
    async fn reconnect_always_mints_a_fresh_channel() {
        let registry = ChannelRegistry::new(Arc::new(EventStore::default()));
        let (first, _, _) = registry.reconnect("s1");
        let (second, _, _) = registry.reconnect("s1");
        assert!(!Arc::ptr_eq(&first, &second));
        // get_or_create now sees the reconnected channel, not the original.
        let current = registry.get_or_create("s1");
        assert!(Arc::ptr_eq(&current, &second));
    }
}
