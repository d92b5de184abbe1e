//! Proxy-side error taxonomy (§7): the lifecycle, transport-setup, and relay
//! errors the Session Manager and Proxy Bridge raise, and the JSON-RPC shape
//! each renders as on the wire.

use mcp_relay_core::protocol::{Envelope, Id, JsonRpcError};
use mcp_relay_core::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No `mcp-session-id` header on a non-initialize request (§4.6).
    #[error("Missing session ID")]
    MissingSession,

    /// Session id doesn't resolve to any known connection (§4.6, §8 scenario 4).
    #[error("Session not found")]
    SessionNotFound,

    /// Connection failed validation or the upstream closed (§4.6, §7 Relay/ConnectionLost).
    #[error("Connection lost, please reinitialize")]
    ConnectionLost,

    /// Failure to connect/initialize a brand new upstream connection (§7 TransportSetup).
    #[error("failed to connect to upstream: {0}")]
    TransportSetup(String),

    /// Upstream returned a structured JSON-RPC error for a forwarded
    /// request; propagated verbatim under the client's original id (§7 Relay).
    #[error("upstream error {0:?}")]
    Relay(JsonRpcError),

    /// Anything else unexpected; rendered with the generic internal code.
    #[error("{0}")]
    Internal(String),

    /// Request method is gated behind a capability the upstream didn't
    /// negotiate (§4.5 table). Standard JSON-RPC "method not found".
    #[error("method not found: {0}")]
    MethodNotAvailable(String),
}

impl ProxyError {
    /// HTTP status the front end should answer with. Only a wholly absent
    /// session header is a 400; every other lifecycle failure is carried as
    /// a JSON-RPC-level error on an otherwise-200 response (§4.6, §8).
    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::MissingSession => 400,
            _ => 200,
        }
    }

    pub fn into_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            ProxyError::MissingSession
            | ProxyError::SessionNotFound
            | ProxyError::ConnectionLost => JsonRpcError::session_lifecycle(self.to_string()),
            ProxyError::TransportSetup(_) | ProxyError::Internal(_) => {
                JsonRpcError::internal(self.to_string())
            }
            ProxyError::Relay(e) => e.clone(),
            ProxyError::MethodNotAvailable(_) => JsonRpcError {
                code: -32601,
                message: self.to_string(),
                data: None,
            },
        }
    }

    pub fn into_envelope(&self, id: Id) -> Envelope {
        Envelope::error_response(id, self.into_jsonrpc_error())
    }

    /// Whether this error should be reported under the client's original
    /// request id. Only a relayed upstream error does (§7 Relay: "propagated
    /// verbatim ... under the client's original request id"); every
    /// lifecycle error reports `id: null` instead, per §8 scenario 4, since
    /// the proxy couldn't resolve the request to any upstream call at all.
    pub fn correlates_with_request(&self) -> bool {
        matches!(self, ProxyError::Relay(_))
    }
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::UpstreamClosed => ProxyError::ConnectionLost,
            TransportError::Timeout => ProxyError::Internal("request to upstream timed out".into()),
            TransportError::ConnectFailed(msg) => ProxyError::TransportSetup(msg),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_session_is_the_only_400() {
        assert_eq!(ProxyError::MissingSession.http_status(), 400);
        assert_eq!(ProxyError::SessionNotFound.http_status(), 200);
        assert_eq!(ProxyError::ConnectionLost.http_status(), 200);
    }

    #[test]
    fn lifecycle_errors_use_session_lifecycle_code() {
        let err = ProxyError::SessionNotFound.into_jsonrpc_error();
        assert_eq!(err.code, mcp_relay_core::protocol::error_codes::SESSION_LIFECYCLE);
        assert_eq!(err.message, "Session not found");
    }

    #[test]
    fn relay_errors_pass_through_verbatim() {
        let upstream_err = JsonRpcError {
            code: -32001,
            message: "custom upstream failure".to_string(),
            data: None,
        };
        let err = ProxyError::Relay(upstream_err.clone());
        assert_eq!(err.into_jsonrpc_error(), upstream_err);
    }

    #[test]
    fn only_relay_errors_correlate_with_the_original_request_id() {
        let relay = ProxyError::Relay(JsonRpcError {
            code: -32001,
            message: "x".to_string(),
            data: None,
        });
        assert!(relay.correlates_with_request());
        assert!(!ProxyError::SessionNotFound.correlates_with_request());
        assert!(!ProxyError::MissingSession.correlates_with_request());
        assert!(!ProxyError::ConnectionLost.correlates_with_request());
    }
}
