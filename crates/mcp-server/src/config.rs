//! Ambient configuration: a plain struct with a fluent builder. This engine
//! has no files/env sources to layer, just a handful of knobs an embedder
//! sets in code.

use std::time::Duration;

use mcp_protocol::pagination::{CursorKey, DEFAULT_PAGE_SIZE};

/// Tunables for a running engine instance. Construct with [`EngineConfig::new`]
/// and adjust via the `with_*` builders; all fields have sensible defaults
/// so `EngineConfig::new()` alone is a valid configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// `Origin` header allowlist for the streaming transport.
    /// Empty means "no Origin enforcement", matching local/dev use.
    pub allowed_origins: Vec<String>,
    /// How long a session may sit without activity before `SessionStore`
    /// reclaims it.
    pub session_idle_timeout: Duration,
    /// Default and maximum page size for `*/list` methods.
    pub page_size: usize,
    /// How long the dispatcher waits for a deferred ("noreply") handler
    /// reply before failing the request with `-32001`.
    pub handler_deadline: Duration,
    /// How long a session waits for a client's `elicitation/create` reply
    /// before giving up.
    pub elicitation_deadline: Duration,
    /// Key used to sign pagination cursors. Generated randomly at startup
    /// if not supplied; set explicitly to make cursors valid across
    /// restarts or multiple processes.
    pub cursor_signing_key: CursorKey,
    /// Whether `tools/call` results are validated against the tool's
    /// declared `outputSchema` before being sent (see `DESIGN.md` for the
    /// advisory-vs-enforced tradeoff).
    pub enforce_output_schema: bool,
    /// Free-text guidance returned in `initialize`'s `instructions` field.
    /// `None` omits the field rather than sending an empty string.
    pub instructions: Option<String>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        self.allowed_origins = origins.into_iter().collect();
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline = deadline;
        self
    }

    pub fn with_elicitation_deadline(mut self, deadline: Duration) -> Self {
        self.elicitation_deadline = deadline;
        self
    }

    pub fn with_cursor_signing_key(mut self, key: CursorKey) -> Self {
        self.cursor_signing_key = key;
        self
    }

    pub fn with_enforce_output_schema(mut self, enforce: bool) -> Self {
        self.enforce_output_schema = enforce;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            session_idle_timeout: Duration::from_secs(5 * 60),
            page_size: DEFAULT_PAGE_SIZE,
            handler_deadline: Duration::from_secs(30),
            elicitation_deadline: Duration::from_secs(60),
            cursor_signing_key: CursorKey::generate(),
            enforce_output_schema: false,
            instructions: None,
        }
    }
}
