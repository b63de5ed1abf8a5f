//! The Streamable HTTP transport surface: request/response shapes, origin
//! validation, and the "decide before the first byte" logic that picks a
//! JSON reply, an SSE stream, or a 202-Accepted for each POST.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mcp_protocol::jsonrpc::{
    parse_message, serialize_responses, IncomingMessage, IncomingUnit, JsonRpcError,
    JsonRpcResponse, RequestId,
};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::session::{SessionHandle, SessionId, SessionState, SessionStore};
use crate::sse::{SseEncoder, SseEvent};

/// HTTP methods the Streamable HTTP transport distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum HttpMethod {
    /// Establish an SSE stream for server-initiated messages on an existing
    /// session.
    Get,
    /// Send a JSON-RPC request or notification; receive a JSON reply, an
    /// SSE stream, or 202 Accepted.
    #[default]
    Post,
    /// Terminate a session.
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseHttpMethodError(pub String);

impl fmt::Display for ParseHttpMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown HTTP method: {}", self.0)
    }
}

impl FromStr for HttpMethod {
    type Err = ParseHttpMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseHttpMethodError(s.to_string())),
        }
    }
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of checking the `Origin` header against the configured allowlist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginValidation {
    Valid,
    Missing,
    Invalid(String),
}

impl OriginValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Whether the origin check passed, given whether an origin is
    /// actually required.
    pub fn passed(&self, require_origin: bool) -> bool {
        match self {
            Self::Valid => true,
            Self::Missing => !require_origin,
            Self::Invalid(_) => false,
        }
    }

    pub fn validate(origin: Option<&str>, allowed: &[String]) -> Self {
        match origin {
            None => Self::Missing,
            Some(_) if allowed.is_empty() => Self::Valid,
            Some(o) if allowed.iter().any(|a| a == o) => Self::Valid,
            Some(o) => Self::Invalid(o.to_string()),
        }
    }
}

/// A parsed Streamable HTTP request, independent of any particular HTTP
/// server crate — an embedder maps its framework's request type into this
/// shape.
#[derive(Clone, Debug, Default)]
pub struct StreamableRequest {
    pub method: HttpMethod,
    pub session_id: Option<String>,
    pub last_event_id: Option<String>,
    pub origin: Option<String>,
    pub accept: Option<String>,
    pub body: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
}

impl StreamableRequest {
    pub fn get(session_id: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            session_id: Some(session_id.into()),
            accept: Some("text/event-stream".to_string()),
            ..Default::default()
        }
    }

    pub fn post(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn delete(session_id: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Delete,
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn accepts_sse(&self) -> bool {
        self.accept.as_ref().is_some_and(|a| a.contains("text/event-stream"))
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn is_replay(&self) -> bool {
        self.last_event_id.is_some()
    }
}

/// The outcome of handling one `StreamableRequest`. The response mode
/// (`Json` vs `Sse` vs `Accepted`) is decided before anything is written to
/// the wire.
#[derive(Debug)]
pub enum StreamableResponse {
    /// A single JSON-RPC response (or batch): none of this POST's requests
    /// pushed a progress/log notification or deferred before replying.
    Json { status: u16, session_id: Option<String>, body: String },
    /// An SSE stream: either a long-lived GET stream, or a POST answered
    /// over SSE because dispatching it produced at least one progress/log
    /// push or a deferred reply — decided from the dispatch itself, not
    /// from the client's `Accept` header.
    Sse { session_id: Option<String>, initial_events: Vec<String> },
    /// A POST containing only notifications/responses — no reply body.
    Accepted,
    /// A DELETE that tore a session down (or a no-op because it was
    /// already gone, both are this shape with different status).
    Empty { status: u16 },
    Error { status: u16, message: String },
}

impl StreamableResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Json { status, .. } => *status,
            Self::Sse { .. } => 200,
            Self::Accepted => 202,
            Self::Empty { status } => *status,
            Self::Error { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() < 400
    }
}

/// Errors surfaced by the transport layer itself, before a request ever
/// reaches the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    SessionNotFound,
    SessionClosed,
    InvalidOrigin(String),
    MissingOrigin,
    InvalidMethod(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound => write!(f, "session not found"),
            Self::SessionClosed => write!(f, "session has been terminated"),
            Self::InvalidOrigin(o) => write!(f, "origin not allowed: {o}"),
            Self::MissingOrigin => write!(f, "origin header required"),
            Self::InvalidMethod(m) => write!(f, "invalid method: {m}"),
        }
    }
}

impl From<TransportError> for StreamableResponse {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::SessionNotFound => StreamableResponse::Error {
                status: 404,
                message: err.to_string(),
            },
            TransportError::SessionClosed => StreamableResponse::Error {
                status: 410,
                message: err.to_string(),
            },
            TransportError::InvalidOrigin(_) | TransportError::MissingOrigin => StreamableResponse::Error {
                status: 403,
                message: err.to_string(),
            },
            TransportError::InvalidMethod(_) => StreamableResponse::Error {
                status: 405,
                message: err.to_string(),
            },
        }
    }
}

/// Wires `StreamableRequest`/`StreamableResponse` to the session store and
/// dispatcher. One instance per running engine.
pub struct StreamableTransport {
    sessions: Arc<SessionStore>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl StreamableTransport {
    pub fn new(sessions: Arc<SessionStore>, dispatcher: Arc<Dispatcher>, config: EngineConfig) -> Self {
        Self {
            sessions,
            dispatcher,
            config,
        }
    }

    fn validate_origin(&self, request: &StreamableRequest) -> Result<(), TransportError> {
        let validation = OriginValidation::validate(request.origin.as_deref(), &self.config.allowed_origins);
        let require_origin = !self.config.allowed_origins.is_empty();
        if validation.passed(require_origin) {
            Ok(())
        } else {
            match validation {
                OriginValidation::Invalid(o) => Err(TransportError::InvalidOrigin(o)),
                _ => Err(TransportError::MissingOrigin),
            }
        }
    }

    fn lookup_session(&self, request: &StreamableRequest) -> Result<SessionHandle, TransportError> {
        let id = request.session_id.as_deref().ok_or(TransportError::SessionNotFound)?;
        let session = self
            .sessions
            .get(&id.parse::<SessionId>().expect("SessionId parsing is infallible"))
            .ok_or(TransportError::SessionNotFound)?;
        if session.state() == SessionState::Closed {
            return Err(TransportError::SessionClosed);
        }
        Ok(session)
    }

    /// Handle a POST: parse the body, create a session if this is an
    /// `initialize` call without one, dispatch every unit, and decide the
    /// response shape before any bytes are written.
    pub async fn handle_post(
        &self,
        request: StreamableRequest,
        sink_factory: impl FnOnce(SessionId) -> Arc<dyn crate::session::SessionEventSink>,
    ) -> StreamableResponse {
        if let Err(err) = self.validate_origin(&request) {
            return err.into();
        }
        let body = match &request.body {
            Some(b) => b.as_slice(),
            None => return TransportError::InvalidMethod("POST requires a body".to_string()).into(),
        };
        let message = match parse_message(body) {
            Ok(message) => message,
            Err(err) => {
                let jsonrpc_error = JsonRpcError::new(err.error_code().code(), err.to_string());
                let response = JsonRpcResponse::error_without_id(jsonrpc_error);
                let body = serde_json::to_string(&serialize_responses(&[response]))
                    .expect("dispatch replies always serialize");
                return StreamableResponse::Json {
                    status: 400,
                    session_id: None,
                    body,
                };
            }
        };

        let session = match request.session_id.as_deref() {
            Some(id) => match self.lookup_session(&request) {
                Ok(session) => session,
                Err(err) => return err.into(),
            },
            None => {
                // Generate the id once and thread it through both the sink
                // factory and the session itself, so the id an embedder's
                // sink was built against always matches the id the client is
                // handed and the session is stored under.
                let id = SessionId::generate();
                let cursor_key = self.config.cursor_signing_key.derive_for_session(id.as_str());
                let session = SessionHandle::with_id(id.clone(), sink_factory(id), cursor_key);
                self.sessions.insert(session.clone());
                session
            }
        };

        // Install a capture for every request unit before dispatching, so
        // any progress/log notification posted while its handler runs lands
        // here instead of being lost to the session's sink: a POST whose
        // handler pushes progress/log gets its own SSE stream carrying
        // those notifications followed by the final reply.
        let request_ids = request_ids(&message);
        for id in &request_ids {
            session.begin_capture(id.clone());
        }

        let reply = self.dispatcher.dispatch_message(&session, message).await;

        let mut pushed = Vec::new();
        let mut deferred_any = false;
        for id in &request_ids {
            pushed.extend(session.end_capture(id));
            deferred_any |= session.take_deferred_mark(id);
        }

        match reply {
            // `dispatch_message` only yields `Some` when the batch contained
            // at least one request awaiting a reply; notification-only
            // bodies always fall through here as a 202 Accepted.
            None => StreamableResponse::Accepted,
            Some(value) => {
                let body = serde_json::to_string(&value).expect("dispatch replies always serialize");
                if pushed.is_empty() && !deferred_any {
                    // Decided purely from what dispatching this request
                    // actually did, independent of the client's `Accept`
                    // header.
                    StreamableResponse::Json {
                        status: 200,
                        session_id: Some(session.id().to_string()),
                        body,
                    }
                } else {
                    let mut initial_events: Vec<String> = pushed
                        .iter()
                        .map(|notification| {
                            let data = serde_json::to_string(notification)
                                .expect("JsonRpcNotification always serializes");
                            SseEncoder::encode_string(&SseEvent::message(data))
                        })
                        .collect();
                    initial_events.push(SseEncoder::encode_string(&SseEvent::message(body)));
                    StreamableResponse::Sse {
                        session_id: Some(session.id().to_string()),
                        initial_events,
                    }
                }
            }
        }
    }

    /// Handle a GET: open a long-lived SSE stream on an existing session.
    /// `Last-Event-ID` replay is best-effort — there is no durable log of
    /// past events, so a replay request just resumes the live stream from
    /// here (see `DESIGN.md`'s Open Question notes).
    pub fn handle_get(&self, request: StreamableRequest) -> StreamableResponse {
        if let Err(err) = self.validate_origin(&request) {
            return err.into();
        }
        match self.lookup_session(&request) {
            Ok(session) => StreamableResponse::Sse {
                session_id: Some(session.id().to_string()),
                initial_events: Vec::new(),
            },
            Err(err) => err.into(),
        }
    }

    /// Handle a DELETE: terminate the named session.
    pub fn handle_delete(&self, request: StreamableRequest) -> StreamableResponse {
        if let Err(err) = self.validate_origin(&request) {
            return err.into();
        }
        let id = match request.session_id.as_deref() {
            Some(id) => id.parse::<SessionId>().expect("SessionId parsing is infallible"),
            None => return TransportError::SessionNotFound.into(),
        };
        if self.sessions.terminate(&id) {
            StreamableResponse::Empty { status: 204 }
        } else {
            TransportError::SessionNotFound.into()
        }
    }
}

/// Every request-unit id in a parsed POST body, in arrival order. Used to
/// install and later drain per-request notification captures around a
/// single dispatch.
fn request_ids(message: &IncomingMessage) -> Vec<RequestId> {
    match message {
        IncomingMessage::Single(IncomingUnit::Request(req)) => vec![req.id.clone()],
        IncomingMessage::Single(_) => Vec::new(),
        IncomingMessage::Batch(units) => units
            .iter()
            .filter_map(|unit| match unit {
                IncomingUnit::Request(req) => Some(req.id.clone()),
                _ => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
    use mcp_protocol::types::Implementation;
    use crate::registry::Registry;

    struct NullSink;
    impl crate::session::SessionEventSink for NullSink {
        fn send_notification(&self, _n: JsonRpcNotification) {}
        fn send_request(&self, _r: JsonRpcRequest) {}
        fn send_response(&self, _r: JsonRpcResponse) {}
    }

    fn transport() -> StreamableTransport {
        let sessions = Arc::new(SessionStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Registry::new()),
            EngineConfig::new(),
            Implementation {
                name: "test-engine".to_string(),
                version: "0.0.0".to_string(),
            },
        ));
        StreamableTransport::new(sessions, dispatcher, EngineConfig::new())
    }

    #[test]
    fn http_method_parses_case_insensitively() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("DELETE".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!("PATCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn origin_validation_allows_empty_allowlist() {
        assert!(OriginValidation::validate(Some("https://any.example"), &[]).is_valid());
    }

    #[test]
    fn origin_validation_rejects_unlisted_origin() {
        let allowed = vec!["https://good.example".to_string()];
        assert!(!OriginValidation::validate(Some("https://evil.example"), &allowed).is_valid());
    }

    #[tokio::test]
    async fn post_without_session_creates_one_on_initialize() {
        let transport = transport();
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            }
        })
        .to_string();
        let request = StreamableRequest::post(body.into_bytes());
        let response = transport.handle_post(request, |_id| Arc::new(NullSink)).await;
        assert!(response.is_success());
        assert_eq!(transport.sessions.len(), 1);
    }

    /// A body that isn't valid JSON still gets a JSON-RPC error envelope
    /// (with an absent `id`, since none could be recovered), not a bare
    /// string in an ad hoc error shape.
    #[tokio::test]
    async fn malformed_json_body_yields_jsonrpc_parse_error() {
        let transport = transport();
        let request = StreamableRequest::post(b"not json at all".to_vec());
        let response = transport.handle_post(request, |_id| Arc::new(NullSink)).await;
        let StreamableResponse::Json { status, body, .. } = response else {
            panic!("expected a JSON response, got {response:?}");
        };
        assert_eq!(status, 400);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"]["code"], -32700);
        assert!(value["id"].is_null());
    }

    /// A request that never pushes or defers gets a plain JSON reply even
    /// when the client asks for `text/event-stream` — the decision is made
    /// from the dispatch, not the `Accept` header.
    #[tokio::test]
    async fn accept_header_does_not_force_sse_when_nothing_was_pushed() {
        let transport = transport();
        let init_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            }
        })
        .to_string();
        let response = transport
            .handle_post(StreamableRequest::post(init_body.into_bytes()), |_id| Arc::new(NullSink))
            .await;
        let StreamableResponse::Json { session_id, .. } = response else {
            panic!("expected a JSON response, got {response:?}");
        };
        let session_id = session_id.unwrap();

        let initialized = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
            .to_string()
            .into_bytes();
        let response = transport
            .handle_post(
                StreamableRequest::post(initialized).with_session_id(session_id.clone()),
                |_id| unreachable!(),
            )
            .await;
        assert!(matches!(response, StreamableResponse::Accepted));

        let ping_body = serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})
            .to_string()
            .into_bytes();
        let response = transport
            .handle_post(
                StreamableRequest::post(ping_body)
                    .with_session_id(session_id)
                    .with_accept("text/event-stream"),
                |_id| unreachable!(),
            )
            .await;
        assert!(matches!(response, StreamableResponse::Json { .. }));
    }

    #[test]
    fn delete_of_unknown_session_is_404() {
        let transport = transport();
        let response = transport.handle_delete(StreamableRequest::delete("mcp-doesnotexist"));
        assert_eq!(response.status(), 404);
    }
}
