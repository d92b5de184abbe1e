//! Error types shared across the relay core.

use thiserror::Error;

/// Errors raised while decoding or encoding JSON-RPC envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("not a JSON-RPC 2.0 envelope: {0}")]
    NotAnEnvelope(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
