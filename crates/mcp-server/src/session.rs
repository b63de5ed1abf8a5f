//! The per-connection session actor: lifecycle state machine,
//! pending-request bookkeeping, subscriptions, and the channel-based
//! primitives `RequestContext` rides on to post progress/log/elicitation
//! traffic and deferred replies.
//!
//! The pending-request/elicitation bookkeeping follows a "shared map
//! guarded by a lock, correlated via oneshot channels" actor-adjacent
//! pattern, scoped down to a single session rather than a process-wide
//! table.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mcp_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use mcp_protocol::pagination::CursorKey;
use mcp_protocol::types::{
    ClientCapabilities, ElicitAction, ElicitResult, Implementation, LogLevel, LogMessageParams,
    ProgressParams,
};
use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};

/// Opaque session identifier handed to the client as a `Mcp-Session-Id`
/// header: `mcp-` followed by 32 lowercase hex characters (128 bits of
/// randomness), matching the reference transport's session id shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes)
            .expect("system RNG must be available to mint a session id");
        let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(format!("mcp-{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// The session lifecycle state machine:
/// `New -> Initializing -> Active -> Closed`, with `Closed` reachable from
/// any state (idle timeout, `DELETE`, or a fatal transport error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Initializing,
    Active,
    Closed,
}

impl SessionState {
    /// Whether `method` is permitted in this state, independent of whether
    /// the method itself exists in the registry.
    pub fn permits(self, method: &str) -> bool {
        match self {
            SessionState::New => method == "initialize",
            SessionState::Initializing => method == "notifications/initialized",
            SessionState::Active => method != "initialize",
            SessionState::Closed => false,
        }
    }
}

/// Where a session pushes messages it originates: progress/log
/// notifications, server-initiated requests (elicitation), and deferred
/// replies. The streaming transport implements this against its live SSE
/// connection; tests can implement it against a channel.
pub trait SessionEventSink: Send + Sync {
    fn send_notification(&self, notification: JsonRpcNotification);
    fn send_request(&self, request: JsonRpcRequest);
    fn send_response(&self, response: JsonRpcResponse);
}

struct NegotiatedInfo {
    protocol_version: String,
    client_info: Implementation,
    client_capabilities: ClientCapabilities,
}

struct Inner {
    id: SessionId,
    sink: Arc<dyn SessionEventSink>,
    cursor_key: CursorKey,
    state: RwLock<SessionState>,
    negotiated: RwLock<Option<NegotiatedInfo>>,
    log_level: RwLock<LogLevel>,
    last_activity: RwLock<Instant>,
    subscriptions: DashMap<String, ()>,
    /// Requests this session sent to the client (elicitation, ...),
    /// awaiting the client's JSON-RPC response.
    pending_outbound: DashMap<RequestId, oneshot::Sender<EngineResult<Value>>>,
    /// Inbound requests whose handler called `RequestContext::defer`,
    /// awaiting that handler's eventual reply.
    pending_deferred: DashMap<RequestId, oneshot::Sender<EngineResult<Value>>>,
    /// Every inbound request id currently being processed, for duplicate-id
    /// rejection and `notifications/cancelled` routing.
    in_flight: DashMap<RequestId, tokio_util::sync::CancellationToken>,
    next_outbound_id: std::sync::atomic::AtomicI64,
    /// Per-request notification capture, installed by the streaming
    /// transport around a single POST's dispatch so it can fold progress/log
    /// pushes into that POST's own SSE stream instead of losing them to
    /// whatever the sink happens to be wired to. Absent an active capture
    /// for an id, a notification falls through to `sink` (the session's GET
    /// stream).
    captures: DashMap<RequestId, Mutex<Vec<JsonRpcNotification>>>,
    /// Ids whose handler returned `HandlerOutcome::Deferred`, so the
    /// transport can pick an SSE response even for a deferred request that
    /// never actually emitted a progress/log push before finishing.
    deferred_ids: DashMap<RequestId, ()>,
}

/// A cheaply cloneable handle to a session actor. All session state lives
/// behind the shared `Inner`; cloning a handle never clones session state.
#[derive(Clone)]
pub struct SessionHandle(Arc<Inner>);

impl SessionHandle {
    /// Build a session with a freshly generated id. Most callers that also
    /// need to hand the id to an external sink factory should use
    /// [`SessionHandle::with_id`] instead, so the id baked into the sink
    /// matches the id the session is actually stored and looked up under.
    pub fn new(sink: Arc<dyn SessionEventSink>, cursor_key: CursorKey) -> Self {
        Self::with_id(SessionId::generate(), sink, cursor_key)
    }

    pub fn with_id(id: SessionId, sink: Arc<dyn SessionEventSink>, cursor_key: CursorKey) -> Self {
        Self(Arc::new(Inner {
            id,
            sink,
            cursor_key,
            state: RwLock::new(SessionState::New),
            negotiated: RwLock::new(None),
            log_level: RwLock::new(LogLevel::default()),
            last_activity: RwLock::new(Instant::now()),
            subscriptions: DashMap::new(),
            pending_outbound: DashMap::new(),
            pending_deferred: DashMap::new(),
            in_flight: DashMap::new(),
            next_outbound_id: std::sync::atomic::AtomicI64::new(1),
            captures: DashMap::new(),
            deferred_ids: DashMap::new(),
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.0.id
    }

    pub fn state(&self) -> SessionState {
        *self.0.state.read()
    }

    pub fn cursor_key(&self) -> &CursorKey {
        &self.0.cursor_key
    }

    pub fn touch(&self) {
        *self.0.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.0.last_activity.read().elapsed()
    }

    /// `New -> Initializing`, recording the negotiated version/capabilities
    /// from a successful `initialize` call.
    pub fn begin_initialize(
        &self,
        protocol_version: String,
        client_info: Implementation,
        client_capabilities: ClientCapabilities,
    ) -> EngineResult<()> {
        let mut state = self.0.state.write();
        if *state != SessionState::New {
            return Err(EngineError::NotInitialized(
                "initialize may only be called once, in the New state".to_string(),
            ));
        }
        *self.0.negotiated.write() = Some(NegotiatedInfo {
            protocol_version,
            client_info,
            client_capabilities,
        });
        *state = SessionState::Initializing;
        Ok(())
    }

    /// `Initializing -> Active`, on `notifications/initialized`.
    pub fn complete_initialize(&self) -> EngineResult<()> {
        let mut state = self.0.state.write();
        if *state != SessionState::Initializing {
            return Err(EngineError::NotInitialized(
                "notifications/initialized arrived outside the Initializing state".to_string(),
            ));
        }
        *state = SessionState::Active;
        Ok(())
    }

    /// Any state -> `Closed`: idle timeout, `DELETE`, or a fatal transport
    /// error. Wakes every pending outbound/deferred waiter with a
    /// cancellation so no task hangs past session teardown.
    pub fn close(&self) {
        *self.0.state.write() = SessionState::Closed;
        let outbound: Vec<RequestId> = self.0.pending_outbound.iter().map(|e| e.key().clone()).collect();
        for id in outbound {
            if let Some((_, tx)) = self.0.pending_outbound.remove(&id) {
                let _ = tx.send(Err(EngineError::Cancelled));
            }
        }
        let deferred: Vec<RequestId> = self.0.pending_deferred.iter().map(|e| e.key().clone()).collect();
        for id in deferred {
            if let Some((_, tx)) = self.0.pending_deferred.remove(&id) {
                let _ = tx.send(Err(EngineError::Cancelled));
            }
        }
        let in_flight: Vec<RequestId> = self.0.in_flight.iter().map(|e| e.key().clone()).collect();
        for id in in_flight {
            if let Some((_, token)) = self.0.in_flight.remove(&id) {
                token.cancel();
            }
        }
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.0
            .negotiated
            .read()
            .as_ref()
            .map(|n| n.protocol_version.clone())
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.0
            .negotiated
            .read()
            .as_ref()
            .map(|n| n.client_capabilities.clone())
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *self.0.log_level.write() = level;
    }

    pub fn log_level(&self) -> LogLevel {
        *self.0.log_level.read()
    }

    pub fn subscribe(&self, uri: impl Into<String>) {
        self.0.subscriptions.insert(uri.into(), ());
    }

    pub fn unsubscribe(&self, uri: &str) {
        self.0.subscriptions.remove(uri);
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.0.subscriptions.contains_key(uri)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.0.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// Send `notifications/progress` if the session is still open. A no-op
    /// past `Closed` rather than an error — progress is best-effort. Routed
    /// onto `id`'s own POST stream if the transport has an active capture
    /// for it, otherwise out through the session's sink.
    pub async fn post_progress(&self, id: &RequestId, progress_token: Value, progress: f64, total: Option<f64>) {
        if self.state() == SessionState::Closed {
            return;
        }
        let params = ProgressParams {
            progress_token,
            progress,
            total,
        };
        let notification = JsonRpcNotification::new(
            "notifications/progress",
            Some(serde_json::to_value(params).expect("ProgressParams always serializes")),
        );
        self.route_notification(id, notification);
    }

    /// Send `notifications/message` if `level` clears this session's
    /// negotiated threshold. Routed the same way as
    /// [`SessionHandle::post_progress`].
    pub async fn post_log(&self, id: &RequestId, level: LogLevel, logger: Option<String>, data: Value) {
        if self.state() == SessionState::Closed || level < self.log_level() {
            return;
        }
        let params = LogMessageParams { level, logger, data };
        let notification = JsonRpcNotification::new(
            "notifications/message",
            Some(serde_json::to_value(params).expect("LogMessageParams always serializes")),
        );
        self.route_notification(id, notification);
    }

    /// Deliver one request-scoped notification onto whichever stream owns
    /// it right now: the capture buffer the transport installed for `id`'s
    /// in-flight POST (the POST's own SSE stream carries its pushes before
    /// the final reply), or the session's sink if no such capture is active
    /// (the long-lived GET stream, or a test mock).
    fn route_notification(&self, id: &RequestId, notification: JsonRpcNotification) {
        if let Some(buffer) = self.0.captures.get(id) {
            buffer.lock().push(notification);
        } else {
            self.0.sink.send_notification(notification);
        }
    }

    /// Start capturing notifications posted against `id` instead of routing
    /// them to the sink. Called by the streaming transport (component F)
    /// before dispatching a request unit, so any progress/log emitted while
    /// that request's handler runs lands on its own POST's SSE stream.
    pub(crate) fn begin_capture(&self, id: RequestId) {
        self.0.captures.insert(id, Mutex::new(Vec::new()));
    }

    /// Stop capturing `id` and return whatever was captured, in emission
    /// order. A no-op (empty) capture is the common case: most requests
    /// never push anything before replying.
    pub(crate) fn end_capture(&self, id: &RequestId) -> Vec<JsonRpcNotification> {
        self.0
            .captures
            .remove(id)
            .map(|(_, buffer)| buffer.into_inner())
            .unwrap_or_default()
    }

    /// Record that `id`'s handler returned `HandlerOutcome::Deferred`, so
    /// the transport can choose an SSE response for it even if it never
    /// posted a progress/log notification before its deferred reply landed.
    pub(crate) fn mark_deferred(&self, id: RequestId) {
        self.0.deferred_ids.insert(id, ());
    }

    /// Consume the deferred mark for `id`, if one was set.
    pub(crate) fn take_deferred_mark(&self, id: &RequestId) -> bool {
        self.0.deferred_ids.remove(id).is_some()
    }

    fn allocate_outbound_id(&self) -> RequestId {
        let n = self
            .0
            .next_outbound_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        RequestId::Number(n)
    }

    /// Issue a server-initiated `elicitation/create` request and await the
    /// client's reply, bounded by `deadline` (the default 60s is supplied by
    /// the dispatcher via `EngineConfig`).
    pub async fn elicit_with_deadline(
        &self,
        message: String,
        requested_schema: Value,
        deadline: Duration,
    ) -> EngineResult<ElicitResult> {
        let id = self.allocate_outbound_id();
        let (tx, rx) = oneshot::channel();
        self.0.pending_outbound.insert(id.clone(), tx);
        let params = mcp_protocol::types::ElicitCreateParams {
            message,
            requested_schema,
        };
        self.0.sink.send_request(JsonRpcRequest::new(
            id.clone(),
            "elicitation/create",
            Some(serde_json::to_value(params).expect("ElicitCreateParams always serializes")),
        ));
        let outcome = tokio::time::timeout(deadline, rx).await;
        self.0.pending_outbound.remove(&id);
        match outcome {
            Ok(Ok(Ok(value))) => {
                serde_json::from_value(value).map_err(|e| {
                    EngineError::Handler(format!("malformed elicitation response: {e}"))
                })
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_canceled)) => Err(EngineError::Cancelled),
            Err(_elapsed) => Err(EngineError::Timeout),
        }
    }

    /// Convenience for callers without access to an `EngineConfig` (e.g.
    /// code driving a `SessionHandle` directly in tests); uses a 60s
    /// deadline. `RequestContext::elicit` instead threads the engine's
    /// configured `elicitation_deadline` through `elicit_with_deadline`.
    pub async fn elicit(&self, message: String, requested_schema: Value) -> EngineResult<ElicitResult> {
        self.elicit_with_deadline(message, requested_schema, Duration::from_secs(60))
            .await
    }

    /// Route a reply arriving on the transport back to whichever map is
    /// waiting on `id`: an outbound server-initiated request, if one is
    /// pending; otherwise a no-op (stray/late reply).
    pub fn resolve_outbound(&self, id: RequestId, result: Result<Value, String>) {
        if let Some((_, tx)) = self.0.pending_outbound.remove(&id) {
            let _ = tx.send(result.map_err(EngineError::Handler));
        }
    }

    /// Reserve a slot for a deferred reply before invoking a handler, giving
    /// back a future the dispatcher awaits in parallel with the deadline
    /// timer it owns.
    pub(crate) fn register_deferred(&self, id: RequestId) -> oneshot::Receiver<EngineResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.0.pending_deferred.insert(id, tx);
        rx
    }

    pub(crate) fn cancel_deferred(&self, id: &RequestId) {
        self.0.pending_deferred.remove(id);
    }

    /// Mark `id` as in flight, rejecting a collision with a request this
    /// session is already processing (see `DESIGN.md`: "reject with
    /// -32600").
    pub(crate) fn begin_request(&self, id: RequestId) -> EngineResult<tokio_util::sync::CancellationToken> {
        let token = tokio_util::sync::CancellationToken::new();
        match self.0.in_flight.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::DuplicateRequestId(id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    pub(crate) fn end_request(&self, id: &RequestId) {
        self.0.in_flight.remove(id);
    }

    /// Cancel an in-flight request by id, per `notifications/cancelled`.
    /// A no-op if the request has already finished.
    pub fn cancel_request(&self, id: &RequestId) {
        if let Some((_, token)) = self.0.in_flight.remove(id) {
            token.cancel();
        }
    }

    /// Fulfil a previously-registered deferred reply (`DeferredReply::reply`
    /// / `DeferredReply::error`, the "noreply" contract).
    pub async fn post_deferred_reply(&self, id: RequestId, result: Result<Value, String>) {
        if let Some((_, tx)) = self.0.pending_deferred.remove(&id) {
            let _ = tx.send(result.map_err(EngineError::Handler));
        }
    }

    pub fn send_response(&self, response: JsonRpcResponse) {
        self.0.sink.send_response(response);
    }

    pub fn send_notification(&self, notification: JsonRpcNotification) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.0.sink.send_notification(notification);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .finish()
    }
}

/// The process-wide table of live sessions, keyed by `SessionId`. Owns
/// creation, lookup for subsequent requests on the same session, explicit
/// termination (`DELETE`), and idle-timeout eviction — sessions that sit
/// without activity past `session_idle_timeout` are reclaimed.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionHandle) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Terminate and drop a session (`DELETE`). Returns whether a session
    /// with this id existed.
    pub fn terminate(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close and remove every session idle for longer than `idle_timeout`.
    /// Intended to run on a periodic background tick owned by whatever
    /// embeds this engine.
    pub fn sweep_idle(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() >= idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.terminate(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        notifications: Mutex<Vec<JsonRpcNotification>>,
        requests: Mutex<Vec<JsonRpcRequest>>,
    }

    impl SessionEventSink for RecordingSink {
        fn send_notification(&self, notification: JsonRpcNotification) {
            self.notifications.lock().unwrap().push(notification);
        }
        fn send_request(&self, request: JsonRpcRequest) {
            self.requests.lock().unwrap().push(request);
        }
        fn send_response(&self, _response: JsonRpcResponse) {}
    }

    fn handle() -> (SessionHandle, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        (SessionHandle::new(sink.clone(), key), sink)
    }

    #[test]
    fn session_id_has_expected_shape() {
        let id = SessionId::generate();
        assert!(id.as_str().starts_with("mcp-"));
        assert_eq!(id.as_str().len(), 4 + 32);
    }

    #[test]
    fn lifecycle_rejects_out_of_order_transitions() {
        let (session, _sink) = handle();
        assert!(session.complete_initialize().is_err());
        session
            .begin_initialize(
                "2025-06-18".to_string(),
                Implementation {
                    name: "test".to_string(),
                    version: "0".to_string(),
                },
                ClientCapabilities::default(),
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Initializing);
        assert!(session
            .begin_initialize(
                "2025-06-18".to_string(),
                Implementation {
                    name: "test".to_string(),
                    version: "0".to_string()
                },
                ClientCapabilities::default()
            )
            .is_err());
        session.complete_initialize().unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn state_permits_matches_method_gating_table() {
        assert!(SessionState::New.permits("initialize"));
        assert!(!SessionState::New.permits("tools/list"));
        assert!(SessionState::Initializing.permits("notifications/initialized"));
        assert!(!SessionState::Initializing.permits("tools/list"));
        assert!(SessionState::Active.permits("tools/list"));
        assert!(!SessionState::Closed.permits("ping"));
    }

    #[tokio::test]
    async fn log_below_threshold_is_suppressed() {
        let (session, sink) = handle();
        session.set_log_level(LogLevel::Warning);
        let id = RequestId::Number(1);
        session.post_log(&id, LogLevel::Debug, None, serde_json::json!("noise")).await;
        session.post_log(&id, LogLevel::Error, None, serde_json::json!("boom")).await;
        assert_eq!(sink.notifications.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn log_is_captured_instead_of_sent_to_the_sink_while_a_capture_is_active() {
        let (session, sink) = handle();
        let id = RequestId::Number(1);
        session.begin_capture(id.clone());
        session.post_log(&id, LogLevel::Info, None, serde_json::json!("hello")).await;
        assert!(sink.notifications.lock().unwrap().is_empty());
        let captured = session.end_capture(&id);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].method, "notifications/message");
        // capture is gone now; the same id's next post falls through to the sink
        session.post_log(&id, LogLevel::Info, None, serde_json::json!("later")).await;
        assert_eq!(sink.notifications.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn elicitation_times_out_without_a_reply() {
        let (session, _sink) = handle();
        let result = session
            .elicit_with_deadline(
                "need input".to_string(),
                serde_json::json!({"type": "object"}),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(EngineError::Timeout)));
    }

    #[tokio::test]
    async fn elicitation_resolves_from_the_matching_outbound_id() {
        let (session, sink) = handle();
        let session_for_reply = session.clone();
        let reply_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let id = {
                let requests = sink.requests.lock().unwrap();
                requests.last().unwrap().id.clone()
            };
            session_for_reply.resolve_outbound(id, Ok(serde_json::json!({"action": "accept"})));
        });
        let result = session
            .elicit_with_deadline(
                "need input".to_string(),
                serde_json::json!({"type": "object"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        reply_task.await.unwrap();
        assert_eq!(result.action, ElicitAction::Accept);
    }

    #[tokio::test]
    async fn deferred_reply_round_trips() {
        let (session, _sink) = handle();
        let id = RequestId::Number(42);
        let mut rx = session.register_deferred(id.clone());
        session
            .post_deferred_reply(id, Ok(serde_json::json!({"ok": true})))
            .await;
        let result = rx.try_recv();
        assert!(result.is_ok());
    }

    #[test]
    fn closing_wakes_pending_waiters() {
        let (session, _sink) = handle();
        let id = RequestId::Number(1);
        let rx = session.register_deferred(id);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        drop(rx);
    }

    #[test]
    fn store_tracks_insert_lookup_and_terminate() {
        let (session, _sink) = handle();
        let id = session.id().clone();
        let store = SessionStore::new();
        store.insert(session);
        assert_eq!(store.len(), 1);
        assert!(store.get(&id).is_some());
        assert!(store.terminate(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.terminate(&id));
    }

    #[tokio::test]
    async fn store_sweeps_only_idle_sessions() {
        let (fresh, _sink_a) = handle();
        let (stale, _sink_b) = handle();
        let fresh_id = fresh.id().clone();
        let stale_id = stale.id().clone();
        *stale.0.last_activity.write() = Instant::now() - Duration::from_secs(600);
        let store = SessionStore::new();
        store.insert(fresh);
        store.insert(stale);
        let evicted = store.sweep_idle(Duration::from_secs(300));
        assert_eq!(evicted, vec![stale_id.clone()]);
        assert!(store.get(&fresh_id).is_some());
        assert!(store.get(&stale_id).is_none());
    }
}
