//! Session and dispatch failures and their mapping onto JSON-RPC error
//! codes.

use mcp_protocol::jsonrpc::{JsonRpcError, JsonRpcErrorCode};
use mcp_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the session actor and dispatcher.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A malformed envelope, bad params, unknown method, ambiguous
    /// registration, or invalid cursor — delegated to the protocol crate's
    /// classification.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A method was called in a session state that does not permit it
    /// (e.g. anything but `initialize` while `NEW`).
    #[error("server not initialized: {0} is not permitted before initialize/initialized")]
    NotInitialized(String),

    /// A request id is already in flight on this session.
    #[error("request id {0} is already in flight on this session")]
    DuplicateRequestId(String),

    /// A handler's deferred reply never arrived before its deadline.
    #[error("request timed out waiting for deferred reply")]
    Timeout,

    /// The request was cancelled via `notifications/cancelled` before the
    /// handler finished.
    #[error("request was cancelled")]
    Cancelled,

    /// A handler panicked; the original payload went to the logging sink,
    /// this variant carries only a redacted message to the client.
    #[error("handler panicked")]
    HandlerPanicked,

    /// A handler returned `Err` (as opposed to panicking).
    #[error("handler error: {0}")]
    Handler(String),

    /// The session referenced by a request header does not exist, or has
    /// already been closed.
    #[error("unknown or closed session")]
    UnknownSession,

    /// The `Origin` header did not match the configured allowlist.
    #[error("origin not allowed")]
    OriginRejected,

    /// A tool's result did not match its declared `outputSchema` while the
    /// engine is configured to enforce it. Unlike
    /// `Handler`, the detail is not redacted — it describes a contract
    /// violation in the tool's own declared schema, not a leaked internal.
    #[error("tool result did not match its declared output schema: {0}")]
    OutputSchemaViolation(String),
}

impl EngineError {
    /// The JSON-RPC error code this error maps to.
    pub fn error_code(&self) -> JsonRpcErrorCode {
        match self {
            Self::Protocol(e) => e.error_code(),
            Self::NotInitialized(_) => JsonRpcErrorCode::ServerNotInitialized,
            Self::DuplicateRequestId(_) => JsonRpcErrorCode::InvalidRequest,
            Self::Timeout => JsonRpcErrorCode::RequestTimedOut,
            Self::Cancelled => JsonRpcErrorCode::RequestCancelled,
            Self::HandlerPanicked | Self::Handler(_) | Self::OutputSchemaViolation(_) => {
                JsonRpcErrorCode::InternalError
            }
            Self::UnknownSession | Self::OriginRejected => JsonRpcErrorCode::InvalidRequest,
        }
    }

    /// Build the JSON-RPC error object to send the client. Internal-error
    /// messages are redacted to avoid leaking handler internals; the
    /// original error is expected to already have been logged via `tracing`
    /// by the caller.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let code = self.error_code();
        match self {
            Self::HandlerPanicked | Self::Handler(_) => {
                JsonRpcError::new(code.code(), "internal error")
            }
            other => JsonRpcError::new(code.code(), other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_are_redacted() {
        let err = EngineError::Handler("leaked database password".to_string());
        let jsonrpc = err.to_jsonrpc_error();
        assert_eq!(jsonrpc.code, -32603);
        assert_eq!(jsonrpc.message, "internal error");
    }

    #[test]
    fn not_initialized_maps_to_dash_32002() {
        let err = EngineError::NotInitialized("tools/list".to_string());
        assert_eq!(err.error_code().code(), -32002);
    }
}
