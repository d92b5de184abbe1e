//! Frame Codec — JSON-RPC 2.0 envelope types and (de)serialization.
//!
//! An [`Envelope`] is the single wire shape for MCP traffic: requests carry
//! `method` + `id`, responses carry `id` + (`result` | `error`), notifications
//! carry `method` with no `id`. The proxy never rewrites `id`, and unknown
//! methods decode and re-encode losslessly so pass-through doesn't require a
//! closed method catalog.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodecError, Result};

/// The `id` field of a JSON-RPC message, distinguishing "absent" (a
/// notification has no `id` key at all) from "explicitly `null`" (a response
/// that couldn't be correlated to any request still has to round-trip an
/// `id` key whose value is JSON `null` — see §6/§8 scenario 4). A plain
/// `Option<Value>` can't express this because serde maps JSON `null` and a
/// missing key to the same `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Id {
    Value(Value),
    Null,
}

impl Id {
    pub fn as_value(&self) -> Value {
        match self {
            Id::Value(v) => v.clone(),
            Id::Null => Value::Null,
        }
    }
}

impl From<Value> for Id {
    fn from(v: Value) -> Self {
        if v.is_null() {
            Id::Null
        } else {
            Id::Value(v)
        }
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.as_value().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        Ok(Id::from(Value::deserialize(d)?))
    }
}

/// One JSON-RPC 2.0 message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Which of the three JSON-RPC message shapes an envelope takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    Notification,
    /// Has neither `method` nor (`id` + `result`/`error`) — still forwarded
    /// opaquely, never rejected outright.
    Malformed,
}

/// Error codes the proxy itself is allowed to mint (§6). Upstream error codes
/// are always passed through verbatim instead.
pub mod error_codes {
    /// Session lifecycle errors: missing/unknown/dead session.
    pub const SESSION_LIFECYCLE: i64 = -32000;
    /// Relay/handler failure with no more specific upstream code available.
    pub const INTERNAL: i64 = -32603;
    /// Malformed JSON body.
    pub const PARSE_ERROR: i64 = -32700;
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        let has_payload = self.result.is_some() || self.error.is_some();
        match (&self.method, &self.id, has_payload) {
            (Some(_), Some(_), _) => EnvelopeKind::Request,
            (Some(_), None, _) => EnvelopeKind::Notification,
            // A response's `id` may be `Id::Null` (uncorrelated request) or a
            // real echoed id — either way, presence of `result`/`error` with
            // no `method` is what makes this a response.
            (None, _, true) => EnvelopeKind::Response,
            _ => EnvelopeKind::Malformed,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind(), EnvelopeKind::Request)
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.kind(), EnvelopeKind::Notification)
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind(), EnvelopeKind::Response)
    }

    /// A request envelope for `method` with the given id and params.
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Id::from(id)),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// A notification envelope (no id).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// A success response correlated to `id`.
    pub fn response(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// An error response correlated to `id`. `id` is [`Id::Null`] when the
    /// request couldn't be correlated at all (§6, "Session not found").
    pub fn error_response(id: Id, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// `true` iff this is the MCP `initialize` request (method + id present).
    pub fn is_initialize_request(&self) -> bool {
        self.is_request() && self.method.as_deref() == Some("initialize")
    }
}

impl JsonRpcError {
    pub fn session_lifecycle(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::SESSION_LIFECYCLE,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::INTERNAL,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::PARSE_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

/// The shape of an `initialize` response's `result` field. Only the fields the
/// Session Manager needs are typed; everything else in the MCP schema catalog
/// passes through the surrounding `Envelope.result` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: Value,
}

/// Decode one newline-delimited JSON-RPC frame. Returns a [`CodecError`] on
/// malformed JSON; the caller (a server transport) is responsible for turning
/// that into a JSON-RPC parse-error response rather than rejecting the HTTP
/// request outright.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(CodecError::from)
}

/// Decode from an already-parsed [`serde_json::Value`], e.g. a body an HTTP
/// framework parsed for us.
pub fn decode_value(value: Value) -> Result<Envelope> {
    serde_json::from_value(value).map_err(CodecError::from)
}

/// Encode an envelope. The codec never emits embedded newlines, so the result
/// is safe to use directly as a single line of NDJSON subprocess framing.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // serde_json's compact writer escapes control characters, so a single
    // call is sufficient to satisfy the "no embedded newlines" framing
    // contract even when `params`/`result` contain raw `\n` in a string.
    serde_json::to_vec(envelope).expect("Envelope serializes infallibly")
}

pub fn encode_string(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).expect("Envelope serializes infallibly")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_request() {
        let raw = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Request);
        assert_eq!(env.method.as_deref(), Some("tools/list"));
    }

    #[test]
    fn decodes_notification() {
        let raw = br#"{"jsonrpc":"2.0","method":"notifications/resourceUpdated","params":{}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Notification);
    }

    #[test]
    fn decodes_response_with_result() {
        let raw = br#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
    }

    #[test]
    fn decodes_response_with_error() {
        let raw = br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32000,"message":"Session not found"}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
        assert_eq!(env.id, Some(Id::Null));
        assert_eq!(env.error.unwrap().code, -32000);
    }

    #[test]
    fn error_response_with_null_id_serializes_id_as_explicit_null() {
        let env = Envelope::error_response(Id::Null, JsonRpcError::session_lifecycle("Session not found"));
        let encoded = encode_string(&env);
        assert!(encoded.contains("\"id\":null"));
        // and round-trips back to the same kind/id
        let decoded = decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.kind(), EnvelopeKind::Response);
        assert_eq!(decoded.id, Some(Id::Null));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let raw = b"{not json";
        assert!(decode(raw).is_err());
    }

    #[test]
    fn is_initialize_request_requires_method_and_id() {
        let init = Envelope::request(json!(1), "initialize", Some(json!({})));
        assert!(init.is_initialize_request());

        let notif = Envelope::notification("initialize", None);
        assert!(!notif.is_initialize_request());

        let other = Envelope::request(json!(1), "tools/list", None);
        assert!(!other.is_initialize_request());
    }

    #[test]
    fn round_trip_preserves_id_and_method() {
        let original = Envelope::request(json!("abc"), "tools/call", Some(json!({"x": 1})));
        let bytes = encode(&original);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn encode_never_embeds_a_newline() {
        let env = Envelope::notification("log", Some(json!({"text": "line1\nline2"})));
        let encoded = encode_string(&env);
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn ids_are_never_rewritten_across_decode_encode() {
        for id in [json!(1), json!("string-id"), json!(0)] {
            let env = Envelope::request(id.clone(), "ping", None);
            let decoded = decode(&encode(&env)).unwrap();
            assert_eq!(decoded.id, Some(Id::from(id)));
        }
    }
}
