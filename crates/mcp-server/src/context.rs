//! The value handlers receive alongside their typed params: request
//! identity, cancellation, and the capability to post progress/log
//! notifications or a deferred reply.

use std::time::Instant;

use mcp_protocol::jsonrpc::RequestId;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::session::SessionHandle;

/// Handed to every handler invocation. Handlers must treat session state as
/// opaque apart from this accessor surface.
#[derive(Clone)]
pub struct RequestContext {
    pub(crate) request_id: RequestId,
    pub(crate) session: SessionHandle,
    pub(crate) progress_token: Option<Value>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) started_at: Instant,
    pub(crate) elicitation_deadline: std::time::Duration,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        session: SessionHandle,
        progress_token: Option<Value>,
        cancellation: CancellationToken,
        elicitation_deadline: std::time::Duration,
    ) -> Self {
        Self {
            request_id,
            session,
            progress_token,
            cancellation,
            started_at: Instant::now(),
            elicitation_deadline,
        }
    }

    /// The id of the request this handler is processing.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The session this request arrived on.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Whether the request opted into progress notifications via
    /// `_meta.progressToken`.
    pub fn progress_token(&self) -> Option<&Value> {
        self.progress_token.as_ref()
    }

    /// Cooperative cancellation signal: handlers should check this
    /// periodically during long-running work and `select!` on it around
    /// awaits.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// True if `notifications/cancelled` has already arrived for this
    /// request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time elapsed since the handler was invoked.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Post a `notifications/progress` message on this request's stream.
    /// A no-op if the request did not supply a progress token.
    pub async fn progress(&self, progress: f64, total: Option<f64>) {
        if let Some(token) = self.progress_token.clone() {
            self.session.post_progress(&self.request_id, token, progress, total).await;
        }
    }

    /// Forward a log record through the session's level-filtered
    /// `ClientLogger` channel.
    pub async fn log(&self, level: mcp_protocol::types::LogLevel, logger: Option<String>, data: Value) {
        self.session.post_log(&self.request_id, level, logger, data).await;
    }

    /// Take ownership of this request's reply: the dispatcher will keep the
    /// stream open until the returned handle is used (or the handler
    /// deadline elapses). This is the "noreply" contract — the handler
    /// returns immediately and posts its result later.
    pub fn defer(&self) -> DeferredReply {
        DeferredReply {
            request_id: self.request_id.clone(),
            session: self.session.clone(),
        }
    }

    /// Ask the client to supply structured input. Resolves once the client
    /// replies or the engine's configured elicitation deadline elapses.
    pub async fn elicit(
        &self,
        message: impl Into<String>,
        requested_schema: Value,
    ) -> crate::error::EngineResult<mcp_protocol::types::ElicitResult> {
        self.session
            .elicit_with_deadline(message.into(), requested_schema, self.elicitation_deadline)
            .await
    }
}

/// A handle a handler can stash to post its deferred ("noreply") reply
/// later.
#[derive(Clone)]
pub struct DeferredReply {
    pub(crate) request_id: RequestId,
    pub(crate) session: SessionHandle,
}

impl DeferredReply {
    /// Post the deferred success result.
    pub async fn reply(self, result: Value) {
        self.session.post_deferred_reply(self.request_id, Ok(result)).await;
    }

    /// Post a deferred handler error.
    pub async fn error(self, message: impl Into<String>) {
        self.session
            .post_deferred_reply(self.request_id, Err(message.into()))
            .await;
    }
}
