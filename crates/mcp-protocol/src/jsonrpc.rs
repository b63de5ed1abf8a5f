//! JSON-RPC 2.0 envelope types.
//!
//! Parses a single JSON value or a batched array into requests,
//! notifications, or (for server-initiated round trips) responses, and
//! serializes replies back out in the same shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// The one legal value of the `jsonrpc` field. Serializes to `"2.0"`;
/// deserializing anything else is an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version {s:?}, expected \"2.0\""
            )))
        }
    }
}

/// A JSON-RPC request/response id: a string or an integer (MCP never uses
/// fractional ids). Uniqueness is per direction within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

/// A JSON-RPC request: `id` is always present (absence makes it a
/// notification instead, a distinct type here rather than an `Option` field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with an explicit id.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// `params` as an object if present, substituting an empty object when
    /// absent.
    pub fn params_or_empty(&self) -> Value {
        self.params
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

/// A JSON-RPC notification: no `id`, no reply is ever emitted for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }

    pub fn params_or_empty(&self) -> Value {
        self.params
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

/// A single JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum JsonRpcResponsePayload {
    Success { result: Value },
    Error { error: JsonRpcError },
}

/// A JSON-RPC response: exactly one of `result` or `error`. `id` is
/// `Option` only because a request that failed to parse at all (so no id
/// could be recovered) must still reply with `id: null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    payload: JsonRpcResponsePayload,
}

impl JsonRpcResponse {
    /// A successful reply.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: JsonRpcResponsePayload::Success { result },
        }
    }

    /// An error reply for a known id.
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: JsonRpcResponsePayload::Error { error },
        }
    }

    /// An error reply for a request whose id could not be recovered
    /// (unparseable envelope).
    pub fn error_without_id(error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            payload: JsonRpcResponsePayload::Error { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.payload, JsonRpcResponsePayload::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            JsonRpcResponsePayload::Success { result } => Some(result),
            JsonRpcResponsePayload::Error { .. } => None,
        }
    }

    pub fn error_payload(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            JsonRpcResponsePayload::Error { error } => Some(error),
            JsonRpcResponsePayload::Success { .. } => None,
        }
    }
}

/// The JSON-RPC error codes this engine emits: the standard
/// parse/invalid-request/method-not-found/invalid-params/internal-error
/// range plus the engine-specific codes for lifecycle and dispatch
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerNotInitialized,
    RequestTimedOut,
    RequestCancelled,
    /// Any other code in the `-32000`..`-32099` server-defined range, or an
    /// application-specific code outside the reserved ranges entirely.
    Application(i32),
}

impl JsonRpcErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerNotInitialized => -32002,
            Self::RequestTimedOut => -32001,
            Self::RequestCancelled => -32800,
            Self::Application(code) => code,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ServerNotInitialized => "Server not initialized",
            Self::RequestTimedOut => "Request timed out",
            Self::RequestCancelled => "Request cancelled",
            Self::Application(_) => "Application error",
        }
    }

    /// Build a `JsonRpcError` with this code's default message.
    pub fn into_error(self) -> JsonRpcError {
        JsonRpcError::new(self.code(), self.message())
    }
}

impl From<i32> for JsonRpcErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32002 => Self::ServerNotInitialized,
            -32001 => Self::RequestTimedOut,
            -32800 => Self::RequestCancelled,
            other => Self::Application(other),
        }
    }
}

impl fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// One inbound unit: either a client request expecting a reply, a
/// notification, or a reply to a server-initiated request (elicitation,
/// `roots/list`, ...). Untagged matching relies on requests being tried
/// before notifications (both have `method`; only requests require `id`)
/// and responses never having a `method` field at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncomingUnit {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// A parsed POST body: one unit, or a non-empty batch of units.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Single(IncomingUnit),
    Batch(Vec<IncomingUnit>),
}

/// Parse a raw JSON-RPC payload (single value or batch array).
pub fn parse_message(raw: &[u8]) -> Result<IncomingMessage, ProtocolError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ProtocolError::ParseError(e.to_string()))?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ProtocolError::InvalidRequest(
                    "batch array must contain at least one element".to_string(),
                ));
            }
            let units = items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(item)
                        .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(IncomingMessage::Batch(units))
        }
        other => {
            let unit = serde_json::from_value(other)
                .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?;
            Ok(IncomingMessage::Single(unit))
        }
    }
}

/// Serialize one or more responses back into the same single-vs-batch shape
/// the request arrived in.
pub fn serialize_responses(responses: &[JsonRpcResponse]) -> Value {
    match responses {
        [single] => serde_json::to_value(single).expect("JsonRpcResponse always serializes"),
        many => serde_json::to_value(many).expect("JsonRpcResponse always serializes"),
    }
}
