//! Client Transport configuration and error taxonomy (§4.3).
//!
//! The concrete transports (spawning a subprocess, POSTing to a remote
//! streamable-HTTP upstream) live in the proxy crate, where the heavier I/O
//! dependencies are — this module only carries the configuration shape and
//! the error enum both variants report through, kept framework-independent
//! so the core crate never needs a networking dependency.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of upstream-facing client transport a connection uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Locally spawned subprocess, newline-delimited JSON on stdin/stdout.
    Subprocess,
    /// Remote MCP server reached over the streamable HTTP transport.
    RemoteStreamableHttp,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Subprocess => write!(f, "subprocess"),
            TransportType::RemoteStreamableHttp => write!(f, "remote-streamable-http"),
        }
    }
}

/// Configuration for establishing the upstream client transport (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn `command args...` with an optional shell wrapper.
    Subprocess {
        command: String,
        args: Vec<String>,
        #[serde(default)]
        shell: Option<String>,
    },
    /// POST to `server_url`, consuming its streamed/chunked response.
    RemoteStreamableHttp { server_url: String },
}

impl TransportConfig {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportConfig::Subprocess { .. } => TransportType::Subprocess,
            TransportConfig::RemoteStreamableHttp { .. } => TransportType::RemoteStreamableHttp,
        }
    }
}

/// Errors a client transport can report (§4.3, §7, §10.2).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already connected")]
    AlreadyConnected,

    #[error("transport not connected")]
    NotConnected,

    #[error("failed to establish upstream connection: {0}")]
    ConnectFailed(String),

    #[error("upstream closed the connection")]
    UpstreamClosed,

    #[error("upstream I/O error: {0}")]
    UpstreamIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request to upstream timed out")]
    Timeout,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl From<TransportError> for String {
    fn from(err: TransportError) -> String {
        err.to_string()
    }
}
