//! mcp-relay core
//!
//! Framework-independent types shared by the proxy: the JSON-RPC Frame
//! Codec, the Event Store used for SSE resumption, the Session/Connection
//! data model, and capability-set parsing. None of this depends on axum,
//! reqwest, or tokio's networking features — only the proxy crate wires
//! these into a running server.
//!
//! # Modules
//!
//! - [`protocol`] — JSON-RPC 2.0 envelope types, `decode`/`encode`
//! - [`event_store`] — bounded per-session event ring for SSE resume
//! - [`session`] — Connection/session bookkeeping fields (§3)
//! - [`transport`] — client transport configuration and error taxonomy
//! - [`capabilities`] — capability-set parsing for the Proxy Bridge
//! - [`error`] — codec error type

pub mod capabilities;
pub mod error;
pub mod event_store;
pub mod protocol;
pub mod session;
pub mod transport;

pub use capabilities::Capabilities;
pub use error::CodecError;
pub use event_store::{EventStore, StoredEvent};
pub use protocol::{Envelope, EnvelopeKind, Id, InitializeResult, JsonRpcError};
pub use session::{new_session_id, ConnectionMeta, ConnectionState, GLOBAL_CONNECTION_ID};
pub use transport::{TransportConfig, TransportError, TransportType};
