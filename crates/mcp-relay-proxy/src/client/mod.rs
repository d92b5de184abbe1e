//! Client Transport (§4.3): the upstream-facing half of a Connection.
//!
//! Both variants are driven the same way: `connect()` spawns whatever
//! background plumbing the transport needs and wires it to push
//! [`TransportEvent`]s into the sender handed to it, `send()` writes one
//! envelope upstream, `close()` tears the plumbing down. There is no
//! separate `onMessage`/`onClose`/`onError` callback registration — in
//! async Rust that's naturally a channel rather than stored closures, so
//! [`TransportEvent`] folds all three into one stream the bridge reads from.

pub mod remote_http;
pub mod subprocess;

use async_trait::async_trait;
use mcp_relay_core::protocol::Envelope;
use mcp_relay_core::transport::TransportError;
use tokio::sync::mpsc;

pub use remote_http::RemoteStreamableHttpTransport;
pub use subprocess::SubprocessTransport;

/// Something the upstream side reported. Pushed into the sender supplied to
/// `connect()`; the Proxy Bridge reads these from the receiving end.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded envelope arrived from upstream.
    Message(Envelope),
    /// Diagnostic stderr output (subprocess transport only).
    Stderr(String),
    /// The upstream closed the connection.
    Closed,
    /// The upstream transport hit an unrecoverable error.
    Error(TransportError),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Establish the upstream connection and start pushing [`TransportEvent`]s
    /// into `events` until `close()` is called or the upstream goes away.
    async fn connect(&self, events: EventSender) -> Result<(), TransportError>;

    /// Write one envelope upstream. Ordering within a single transport is
    /// preserved by construction (§5): each transport serializes its own
    /// writes internally.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Idempotent: closing an already-closed transport is a no-op.
    async fn close(&self);
}
