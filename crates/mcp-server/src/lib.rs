//! The MCP session & dispatch engine.
//!
//! This crate owns the session actor, the dispatcher, the streamable HTTP
//! transport, the progress/log/elicitation channels, the registry, and the
//! session/dispatch half of error mapping. `mcp-protocol` owns the
//! transport-neutral envelope, message types, and pagination;
//! `mcp-uri-template` owns RFC 6570 Level 1 matching.
//!
//! An embedder builds a [`Registry`](registry::Registry), wraps it (plus an
//! [`EngineConfig`](config::EngineConfig)) in an [`Engine`], and drives
//! [`Engine::transport`] from whatever HTTP stack or stdio framer it hosts —
//! both are external collaborators this crate never depends on directly.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;
pub mod sse;
pub mod transport;

pub use config::EngineConfig;
pub use context::{DeferredReply, RequestContext};
pub use dispatcher::Dispatcher;
pub use error::{EngineError, EngineResult};
pub use registry::{
    CompletionHandler, HandlerOutcome, PromptHandler, Registry, ResourceHandler, ToolHandler,
};
pub use session::{SessionEventSink, SessionHandle, SessionId, SessionState, SessionStore};
pub use sse::{SseEncoder, SseEvent, SseParser};
pub use transport::{HttpMethod, StreamableRequest, StreamableResponse, StreamableTransport};

use std::sync::Arc;

use mcp_protocol::types::Implementation;

/// Ties a [`Registry`], an [`EngineConfig`], a [`SessionStore`], and a
/// [`StreamableTransport`] together into the one value an embedder needs to
/// hold. Cheap to clone — every field is already reference-counted.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionStore>,
    transport: Arc<StreamableTransport>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine from a populated registry, a server identity
    /// advertised during `initialize`, and a configuration (use
    /// [`EngineConfig::new`] for sensible defaults).
    pub fn new(registry: Registry, server_info: Implementation, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        let sessions = Arc::new(SessionStore::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), config.clone(), server_info));
        let transport = Arc::new(StreamableTransport::new(
            sessions.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        Self {
            registry,
            dispatcher,
            sessions,
            transport,
            config,
        }
    }

    /// The registry this engine was built from.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The dispatcher, for embedders wiring a transport other than
    /// [`StreamableTransport`] (e.g. a stdio framer).
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The live session table, for an idle-sweep background task or admin
    /// introspection.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The Streamable HTTP transport surface: feed it parsed
    /// `StreamableRequest`s from whatever HTTP stack hosts this engine.
    pub fn transport(&self) -> &Arc<StreamableTransport> {
        &self.transport
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Close every idle session past `config().session_idle_timeout`,
    /// returning the ids that were evicted. Intended to run on a periodic
    /// tick owned by the hosting binary.
    pub fn sweep_idle_sessions(&self) -> Vec<SessionId> {
        self.sessions.sweep_idle(self.config.session_idle_timeout)
    }
}

/// A take-to-run wrapper for handing an assembled [`Engine`] to a hosting
/// transport loop exactly once. Cloning shares the same underlying slot, so
/// monitoring/introspection can hold a handle that survives past the point
/// the engine itself is taken and driven.
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<tokio::sync::Mutex<Option<Engine>>>,
}

impl SharedEngine {
    /// Wrap an engine for thread-safe sharing across tasks.
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Some(engine))),
        }
    }

    /// A clone of the engine, for read-mostly access (metrics, health
    /// checks) from a task that does not own the run loop.
    pub async fn peek(&self) -> Option<Engine> {
        self.inner.lock().await.clone()
    }

    /// Take the engine out, consuming this handle's claim on it. Returns
    /// `None` if another task already took it.
    pub async fn take(&self) -> Option<Engine> {
        self.inner.lock().await.take()
    }
}

/// Convenience re-exports for embedders wiring up a new engine.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::context::{DeferredReply, RequestContext};
    pub use crate::registry::{
        CompletionHandler, HandlerOutcome, PromptHandler, Registry, ResourceHandler, ToolHandler,
    };
    pub use crate::session::{SessionHandle, SessionId, SessionStore};
    pub use crate::transport::{HttpMethod, StreamableRequest, StreamableResponse, StreamableTransport};
    pub use crate::{Engine, SharedEngine};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_info() -> Implementation {
        Implementation {
            name: "test-engine".to_string(),
            version: "0.0.0".to_string(),
        }
    }

    #[test]
    fn engine_wires_registry_dispatcher_sessions_and_transport() {
        let engine = Engine::new(Registry::new(), server_info(), EngineConfig::new());
        assert_eq!(engine.registry().tool_count(), 0);
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn shared_engine_take_is_exclusive() {
        let engine = Engine::new(Registry::new(), server_info(), EngineConfig::new());
        let shared = SharedEngine::new(engine);
        let shared2 = shared.clone();
        assert!(shared.take().await.is_some());
        assert!(shared2.take().await.is_none());
    }

    #[tokio::test]
    async fn shared_engine_peek_does_not_consume() {
        let engine = Engine::new(Registry::new(), server_info(), EngineConfig::new());
        let shared = SharedEngine::new(engine);
        assert!(shared.peek().await.is_some());
        assert!(shared.take().await.is_some());
    }
}
