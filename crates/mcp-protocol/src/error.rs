//! The protocol-facing error type and its mapping onto JSON-RPC error
//! codes. `mcp-server::error::EngineError` wraps this one for handler- and
//! session-level failures; this type covers envelope parsing, registry
//! registration, and cursor verification.

use thiserror::Error;

use crate::jsonrpc::JsonRpcErrorCode;

/// Errors raised while parsing envelopes, registering entries, or decoding
/// cursors, tagged with the JSON-RPC error code each maps to.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The payload was valid JSON but not a well-formed JSON-RPC envelope
    /// (wrong `jsonrpc` version, empty batch, missing `method`, a request
    /// id colliding with one already in flight, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No registry entry matches the requested method/name/URI.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Parameters failed validation against the expected shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Two registry entries (resource URI templates) would produce an
    /// ambiguous match for some concrete URI.
    #[error("ambiguous URI templates: {new_template:?} conflicts with {existing_template:?}")]
    AmbiguousTemplate {
        new_template: String,
        existing_template: String,
    },

    /// A registry entry with this name/kind was already registered.
    #[error("{kind} {name:?} is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    /// A cursor failed signature verification or was malformed.
    #[error("invalid cursor")]
    InvalidCursor,
}

impl ProtocolError {
    /// The JSON-RPC error code this error maps to.
    pub fn error_code(&self) -> JsonRpcErrorCode {
        match self {
            Self::ParseError(_) => JsonRpcErrorCode::ParseError,
            Self::InvalidRequest(_) => JsonRpcErrorCode::InvalidRequest,
            Self::MethodNotFound(_) => JsonRpcErrorCode::MethodNotFound,
            Self::InvalidParams(_) | Self::InvalidCursor => JsonRpcErrorCode::InvalidParams,
            Self::AmbiguousTemplate { .. } | Self::AlreadyRegistered { .. } => {
                JsonRpcErrorCode::InvalidRequest
            }
        }
    }
}
