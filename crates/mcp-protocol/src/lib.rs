//! Transport-neutral JSON-RPC envelope handling, MCP message types, and
//! signed-cursor pagination for the MCP session & dispatch engine.
//!
//! This crate owns components A (envelope codec), H (pagination), and the
//! protocol-facing half of I (error codes). The session actor, dispatcher,
//! registry, and streaming transport live in `mcp-server`.

pub mod error;
pub mod jsonrpc;
pub mod pagination;
pub mod types;

pub use error::ProtocolError;
pub use jsonrpc::{
    IncomingMessage, IncomingUnit, JsonRpcError, JsonRpcErrorCode, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RequestId,
};
pub use pagination::{CursorKey, DEFAULT_PAGE_SIZE};
