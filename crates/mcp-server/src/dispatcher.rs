//! The method table: lifecycle gating, registry lookups, pagination, the
//! reply/deferred/panic/timeout handler contract, and cancellation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use mcp_protocol::jsonrpc::{IncomingMessage, IncomingUnit, JsonRpcRequest, JsonRpcResponse, RequestId};
use mcp_protocol::pagination::decode_cursor_or_start;
use mcp_protocol::types::*;
use mcp_protocol::ProtocolError;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::registry::{HandlerOutcome, Registry};
use crate::session::{SessionHandle, SessionState};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this engine understands, most-preferred first. A
/// client that proposes one of these gets it echoed back (real MCP
/// negotiation: the two ends settle on the client's requested version when
/// both support it); otherwise the server reports its own latest version
/// and leaves it to the client to decide whether to continue.
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2024-11-05"];

/// Ties a `Registry` and an `EngineConfig` together into the thing that
/// turns inbound JSON-RPC units into outbound responses/notifications on a
/// given session. Stateless itself — all per-connection state lives on
/// `SessionHandle`.
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: EngineConfig,
    server_info: Implementation,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: EngineConfig, server_info: Implementation) -> Self {
        Self {
            registry,
            config,
            server_info,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatch one parsed inbound payload. `Single`/each item of a `Batch`
    /// that was a request yields a response; notifications and responses to
    /// server-initiated requests never do — a batch reply contains only the
    /// responses to the requests in the batch.
    pub async fn dispatch_message(&self, session: &SessionHandle, message: IncomingMessage) -> Option<Value> {
        session.touch();
        match message {
            IncomingMessage::Single(unit) => self
                .dispatch_unit(session, unit)
                .await
                .map(|resp| mcp_protocol::jsonrpc::serialize_responses(&[resp])),
            IncomingMessage::Batch(units) => {
                let mut responses = Vec::new();
                for unit in units {
                    if let Some(resp) = self.dispatch_unit(session, unit).await {
                        responses.push(resp);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(mcp_protocol::jsonrpc::serialize_responses(&responses))
                }
            }
        }
    }

    async fn dispatch_unit(&self, session: &SessionHandle, unit: IncomingUnit) -> Option<JsonRpcResponse> {
        match unit {
            IncomingUnit::Request(request) => self.dispatch_request(session, request).await,
            IncomingUnit::Notification(notification) => {
                self.dispatch_notification(session, notification).await;
                None
            }
            IncomingUnit::Response(response) => {
                let id = response.id.clone()?;
                let result = match response.result() {
                    Some(value) => Ok(value.clone()),
                    None => Err(response
                        .error_payload()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "client returned an error with no message".to_string())),
                };
                session.resolve_outbound(id, result);
                None
            }
        }
    }

    async fn dispatch_notification(&self, session: &SessionHandle, notification: mcp_protocol::jsonrpc::JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                if let Err(err) = session.complete_initialize() {
                    tracing::warn!(error = %err, "notifications/initialized arrived in an unexpected state");
                }
            }
            "notifications/cancelled" => {
                match serde_json::from_value::<CancelledParams>(notification.params_or_empty()) {
                    Ok(params) => session.cancel_request(&params.request_id),
                    Err(err) => tracing::warn!(%err, "malformed notifications/cancelled"),
                }
            }
            other => tracing::debug!(method = other, "ignoring unrecognized notification"),
        }
    }

    /// Returns `None` when `notifications/cancelled` arrived before the
    /// handler finished: the client has already disclaimed interest in this
    /// id, so no reply is emitted for it.
    async fn dispatch_request(&self, session: &SessionHandle, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if !session.state().permits(&request.method) {
            return Some(JsonRpcResponse::error(request.id, self.state_gate_error(session.state(), &request.method).to_jsonrpc_error()));
        }
        let token = match session.begin_request(request.id.clone()) {
            Ok(token) => token,
            Err(err) => return Some(JsonRpcResponse::error(request.id, err.to_jsonrpc_error())),
        };
        let progress_token = request
            .params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|m| m.get("progressToken"))
            .cloned();
        let ctx = RequestContext::new(
            request.id.clone(),
            session.clone(),
            progress_token,
            token,
            self.config.elicitation_deadline,
        );
        let result = self.route(session, &request, ctx).await;
        session.end_request(&request.id);
        match result {
            Ok(value) => Some(JsonRpcResponse::success(request.id, value)),
            Err(EngineError::Cancelled) => None,
            Err(err) => {
                if matches!(err, EngineError::HandlerPanicked | EngineError::Handler(_)) {
                    tracing::error!(method = %request.method, error = %err, "handler failed");
                }
                Some(JsonRpcResponse::error(request.id, err.to_jsonrpc_error()))
            }
        }
    }

    fn state_gate_error(&self, state: SessionState, method: &str) -> EngineError {
        match state {
            SessionState::New | SessionState::Initializing => {
                EngineError::NotInitialized(method.to_string())
            }
            SessionState::Active => EngineError::Protocol(ProtocolError::InvalidRequest(
                "server has already been initialized".to_string(),
            )),
            SessionState::Closed => EngineError::UnknownSession,
        }
    }

    async fn route(&self, session: &SessionHandle, request: &JsonRpcRequest, ctx: RequestContext) -> EngineResult<Value> {
        let params = request.params_or_empty();
        match request.method.as_str() {
            "initialize" => self.handle_initialize(session, params).await,
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_list_tools(session, params),
            "prompts/list" => self.handle_list_prompts(session, params),
            "resources/list" => self.handle_list_resources(session, params),
            "resources/templates/list" => self.handle_list_resource_templates(session, params),
            "tools/call" => self.handle_call_tool(session, request.id.clone(), params, ctx).await,
            "prompts/get" => self.handle_get_prompt(session, request.id.clone(), params, ctx).await,
            "resources/read" => self.handle_read_resource(session, request.id.clone(), params, ctx).await,
            "resources/subscribe" => self.handle_subscribe(session, params),
            "resources/unsubscribe" => self.handle_unsubscribe(session, params),
            "completion/complete" => self.handle_complete(params, ctx).await,
            "logging/setLevel" => self.handle_set_level(session, params),
            other => Err(EngineError::Protocol(ProtocolError::MethodNotFound(other.to_string()))),
        }
    }

    async fn handle_initialize(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: InitializeParams = parse_params(params)?;
        let negotiated_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version.clone()
        } else {
            PROTOCOL_VERSION.to_string()
        };
        session.begin_initialize(negotiated_version.clone(), params.client_info, params.capabilities)?;
        let capabilities = ServerCapabilities {
            tools: (self.registry.tool_count() > 0).then_some(ListChangedCapability::default()),
            prompts: (self.registry.prompt_count() > 0).then_some(ListChangedCapability::default()),
            resources: self.registry.has_resources().then_some(ResourcesCapability {
                list_changed: Some(false),
                subscribe: Some(true),
            }),
            logging: Some(Value::Object(serde_json::Map::new())),
            completions: Some(Value::Object(serde_json::Map::new())),
        };
        let result = InitializeResult {
            protocol_version: negotiated_version,
            server_info: self.server_info.clone(),
            capabilities,
            instructions: self.config.instructions.clone(),
        };
        Ok(serde_json::to_value(result).expect("InitializeResult always serializes"))
    }

    fn handle_list_tools(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: ListParams = parse_params(params)?;
        let offset = decode_cursor_or_start(session.cursor_key(), params.cursor.as_deref())
            .map_err(EngineError::Protocol)?;
        let (tools, has_more) = self.registry.list_tools(offset, self.config.page_size);
        let next_cursor = has_more.then(|| session.cursor_key().encode(offset + tools.len() as u64));
        let result = ListToolsResult { tools, next_cursor };
        Ok(serde_json::to_value(result).expect("ListToolsResult always serializes"))
    }

    fn handle_list_prompts(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: ListParams = parse_params(params)?;
        let offset = decode_cursor_or_start(session.cursor_key(), params.cursor.as_deref())
            .map_err(EngineError::Protocol)?;
        let (prompts, has_more) = self.registry.list_prompts(offset, self.config.page_size);
        let next_cursor = has_more.then(|| session.cursor_key().encode(offset + prompts.len() as u64));
        let result = ListPromptsResult { prompts, next_cursor };
        Ok(serde_json::to_value(result).expect("ListPromptsResult always serializes"))
    }

    fn handle_list_resources(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: ListParams = parse_params(params)?;
        let offset = decode_cursor_or_start(session.cursor_key(), params.cursor.as_deref())
            .map_err(EngineError::Protocol)?;
        let (resources, has_more) = self.registry.list_resources(offset, self.config.page_size);
        let next_cursor = has_more.then(|| session.cursor_key().encode(offset + resources.len() as u64));
        let result = ListResourcesResult { resources, next_cursor };
        Ok(serde_json::to_value(result).expect("ListResourcesResult always serializes"))
    }

    fn handle_list_resource_templates(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: ListParams = parse_params(params)?;
        let offset = decode_cursor_or_start(session.cursor_key(), params.cursor.as_deref())
            .map_err(EngineError::Protocol)?;
        let (resource_templates, has_more) = self.registry.list_resource_templates(offset, self.config.page_size);
        let next_cursor = has_more.then(|| session.cursor_key().encode(offset + resource_templates.len() as u64));
        let result = ListResourceTemplatesResult {
            resource_templates,
            next_cursor,
        };
        Ok(serde_json::to_value(result).expect("ListResourceTemplatesResult always serializes"))
    }

    async fn handle_call_tool(
        &self,
        session: &SessionHandle,
        id: RequestId,
        params: Value,
        ctx: RequestContext,
    ) -> EngineResult<Value> {
        let params: CallToolParams = parse_params(params)?;
        let (tool, handler) = self
            .registry
            .get_tool(&params.name)
            .ok_or_else(|| EngineError::Protocol(ProtocolError::MethodNotFound(format!("tool {:?}", params.name))))?;
        if let Some(arguments) = &params.arguments {
            handler
                .validate_input(arguments)
                .map_err(|_| EngineError::Protocol(ProtocolError::InvalidParams(format!("arguments do not match {}'s input schema", tool.name))))?;
        }
        let fut = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            async move { handler.call(params, ctx).await }
        };
        let result: CallToolResult = self.run_handler(session, id, &ctx, fut).await?;
        if self.config.enforce_output_schema {
            if let Some(output_schema) = &tool.output_schema {
                self.validate_output_schema(output_schema, &result)?;
            }
        }
        Ok(serde_json::to_value(result).expect("CallToolResult always serializes"))
    }

    /// Validate `result.structuredContent` against a tool's declared
    /// `outputSchema`. Absent structured content with a declared schema is
    /// itself a violation — the schema exists to be checked against
    /// something.
    fn validate_output_schema(&self, schema: &Value, result: &CallToolResult) -> EngineResult<()> {
        let Some(structured) = &result.structured_content else {
            return Err(EngineError::OutputSchemaViolation(
                "tool declares an outputSchema but returned no structuredContent".to_string(),
            ));
        };
        let compiled = jsonschema::JSONSchema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .compile(schema)
            .map_err(|e| EngineError::OutputSchemaViolation(format!("invalid outputSchema: {e}")))?;
        if let Err(errors) = compiled.validate(structured) {
            let detail = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::OutputSchemaViolation(detail));
        }
        Ok(())
    }

    async fn handle_get_prompt(
        &self,
        session: &SessionHandle,
        id: RequestId,
        params: Value,
        ctx: RequestContext,
    ) -> EngineResult<Value> {
        let params: GetPromptParams = parse_params(params)?;
        let (_, handler) = self
            .registry
            .get_prompt(&params.name)
            .ok_or_else(|| EngineError::Protocol(ProtocolError::MethodNotFound(format!("prompt {:?}", params.name))))?;
        let fut = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            async move { handler.get(params, ctx).await }
        };
        let result: GetPromptResult = self.run_handler(session, id, &ctx, fut).await?;
        Ok(serde_json::to_value(result).expect("GetPromptResult always serializes"))
    }

    async fn handle_read_resource(
        &self,
        session: &SessionHandle,
        id: RequestId,
        params: Value,
        ctx: RequestContext,
    ) -> EngineResult<Value> {
        let params: ReadResourceParams = parse_params(params)?;
        let (handler, vars) = self
            .registry
            .resolve_resource(&params.uri)
            .ok_or_else(|| EngineError::Protocol(ProtocolError::MethodNotFound(format!("resource {:?}", params.uri))))?;
        let uri = params.uri.clone();
        let fut = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            async move { handler.read(&uri, &vars, ctx).await }
        };
        let result: ReadResourceResult = self.run_handler(session, id, &ctx, fut).await?;
        Ok(serde_json::to_value(result).expect("ReadResourceResult always serializes"))
    }

    fn handle_subscribe(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: SubscribeParams = parse_params(params)?;
        if self.registry.resolve_resource(&params.uri).is_none() {
            return Err(EngineError::Protocol(ProtocolError::MethodNotFound(format!("resource {:?}", params.uri))));
        }
        session.subscribe(params.uri);
        Ok(serde_json::json!({}))
    }

    fn handle_unsubscribe(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: UnsubscribeParams = parse_params(params)?;
        session.unsubscribe(&params.uri);
        Ok(serde_json::json!({}))
    }

    async fn handle_complete(&self, params: Value, ctx: RequestContext) -> EngineResult<Value> {
        let params: CompleteParams = parse_params(params)?;
        let hook_name = params
            .reference
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol(ProtocolError::InvalidParams("ref.name is required".to_string())))?;
        let handler = self
            .registry
            .completion_handler(hook_name)
            .ok_or_else(|| EngineError::Protocol(ProtocolError::MethodNotFound(format!("completion source {hook_name:?}"))))?;
        let result = handler.complete(params.argument, ctx).await?;
        Ok(serde_json::to_value(result).expect("CompleteResult always serializes"))
    }

    fn handle_set_level(&self, session: &SessionHandle, params: Value) -> EngineResult<Value> {
        let params: SetLevelParams = parse_params(params)?;
        session.set_log_level(params.level);
        Ok(serde_json::json!({}))
    }

    /// Run a handler future to completion, honoring the reply/deferred
    /// contract, the configured deadline, cooperative cancellation, and
    /// panic containment.
    async fn run_handler<T, Fut>(
        &self,
        session: &SessionHandle,
        id: RequestId,
        ctx: &RequestContext,
        fut: Fut,
    ) -> EngineResult<T>
    where
        Fut: std::future::Future<Output = EngineResult<HandlerOutcome<T>>> + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let deferred_rx = session.register_deferred(id.clone());
        let deadline = self.config.handler_deadline;
        let cancellation = ctx.cancellation().clone();

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                session.cancel_deferred(&id);
                return Err(EngineError::Cancelled);
            }
            result = tokio::time::timeout(deadline, AssertUnwindSafe(fut).catch_unwind()) => result,
        };

        let handler_result = match outcome {
            Err(_elapsed) => {
                session.cancel_deferred(&id);
                return Err(EngineError::Timeout);
            }
            Ok(Err(_panic)) => {
                session.cancel_deferred(&id);
                return Err(EngineError::HandlerPanicked);
            }
            Ok(Ok(result)) => result,
        };

        match handler_result? {
            HandlerOutcome::Reply(value) => {
                session.cancel_deferred(&id);
                Ok(value)
            }
            HandlerOutcome::Deferred => {
                session.mark_deferred(id.clone());
                match tokio::time::timeout(deadline, deferred_rx).await {
                    Ok(Ok(Ok(value))) => serde_json::from_value(value).map_err(|e| {
                        EngineError::Handler(format!("deferred reply did not match the expected shape: {e}"))
                    }),
                    Ok(Ok(Err(err))) => Err(err),
                    Ok(Err(_canceled)) => Err(EngineError::Cancelled),
                    Err(_elapsed) => Err(EngineError::Timeout),
                }
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> EngineResult<T> {
    serde_json::from_value(params).map_err(|e| EngineError::Protocol(ProtocolError::InvalidParams(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PromptHandler, ResourceHandler, ToolHandler};
    use crate::session::SessionEventSink;
    use async_trait::async_trait;
    use mcp_protocol::jsonrpc::{JsonRpcNotification, JsonRpcResponse as RawResponse};
    use mcp_protocol::pagination::CursorKey;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        notifications: Mutex<Vec<JsonRpcNotification>>,
    }

    impl SessionEventSink for RecordingSink {
        fn send_notification(&self, notification: JsonRpcNotification) {
            self.notifications.lock().unwrap().push(notification);
        }
        fn send_request(&self, _request: JsonRpcRequest) {}
        fn send_response(&self, _response: RawResponse) {}
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, params: CallToolParams, _ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            let text = params
                .arguments
                .as_ref()
                .and_then(|a| a.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(HandlerOutcome::Reply(CallToolResult::ok(vec![Content::text(text)])))
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl ToolHandler for PanickingTool {
        async fn call(&self, _params: CallToolParams, _ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            panic!("boom");
        }
    }

    struct DeferringTool;

    #[async_trait]
    impl ToolHandler for DeferringTool {
        async fn call(&self, _params: CallToolParams, ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            let reply = ctx.defer();
            tokio::spawn(async move {
                reply
                    .reply(serde_json::to_value(CallToolResult::ok(vec![Content::text("later")])).unwrap())
                    .await;
            });
            Ok(HandlerOutcome::Deferred)
        }
    }

    fn session() -> SessionHandle {
        let sink = Arc::new(RecordingSink::default());
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        SessionHandle::new(sink, key)
    }

    fn dispatcher(registry: Registry) -> Dispatcher {
        dispatcher_with_config(
            registry,
            EngineConfig::new().with_handler_deadline(std::time::Duration::from_millis(200)),
        )
    }

    fn dispatcher_with_config(registry: Registry, config: EngineConfig) -> Dispatcher {
        Dispatcher::new(
            Arc::new(registry),
            config,
            Implementation {
                name: "test-engine".to_string(),
                version: "0.0.0".to_string(),
            },
        )
    }

    async fn initialize(dispatcher: &Dispatcher, session: &SessionHandle) {
        let request = JsonRpcRequest::new(
            1,
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0"}
            })),
        );
        let resp = dispatcher.dispatch_request(session, request).await.unwrap();
        assert!(resp.is_success());
        let notif = JsonRpcNotification::new("notifications/initialized", None);
        dispatcher.dispatch_notification(session, notif).await;
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn methods_before_initialize_are_rejected() {
        let registry = Registry::new();
        let dispatcher = dispatcher(registry);
        let session = session();
        let request = JsonRpcRequest::new(1, "tools/list", None);
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.error_payload().unwrap().code, -32002);
    }

    #[tokio::test]
    async fn initialize_then_list_tools_round_trips() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "echo".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(EchoTool),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/list", None);
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
        let tools = resp.result().unwrap()["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
    }

    #[tokio::test]
    async fn tool_call_invokes_the_registered_handler() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "echo".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(EchoTool),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(
            2,
            "tools/call",
            Some(serde_json::json!({"name": "echo", "arguments": {"message": "hi"}})),
        );
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result().unwrap()["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_as_internal_error() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "boom".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(PanickingTool),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "boom"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(!resp.is_success());
        let error = resp.error_payload().unwrap();
        assert_eq!(error.code, -32603);
        assert_eq!(error.message, "internal error");
    }

    #[tokio::test]
    async fn deferred_reply_eventually_completes_the_request() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "async-echo".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(DeferringTool),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "async-echo"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result().unwrap()["content"][0]["text"], "later");
    }

    struct ElicitingTool;

    #[async_trait]
    impl ToolHandler for ElicitingTool {
        async fn call(&self, _params: CallToolParams, ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            match ctx.elicit("need a name", serde_json::json!({"type": "object"})).await {
                Err(EngineError::Timeout) => Ok(HandlerOutcome::Reply(CallToolResult::ok(vec![Content::text("timed out")]))),
                other => panic!("expected the short elicitation deadline to time out, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn ctx_elicit_honors_the_configured_elicitation_deadline() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "ask".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(ElicitingTool),
            )
            .unwrap();
        // No client ever replies; a deadline in the tens-of-milliseconds
        // range proves `RequestContext::elicit` is using this config value
        // rather than the 60s default on `SessionHandle::elicit`.
        let dispatcher = dispatcher_with_config(
            registry,
            EngineConfig::new()
                .with_handler_deadline(std::time::Duration::from_secs(5))
                .with_elicitation_deadline(std::time::Duration::from_millis(20)),
        );
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "ask"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result().unwrap()["content"][0]["text"], "timed out");
    }

    struct HangingTool;

    #[async_trait]
    impl ToolHandler for HangingTool {
        async fn call(&self, _params: CallToolParams, ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            ctx.cancellation().cancelled().await;
            Ok(HandlerOutcome::Reply(CallToolResult::ok(vec![Content::text("too late")])))
        }
    }

    #[tokio::test]
    async fn cancelled_request_yields_no_reply() {
        let registry = Registry::new();
        registry
            .register_tool(
                Tool {
                    name: "hang".to_string(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                    output_schema: None,
                },
                Arc::new(HangingTool),
            )
            .unwrap();
        let dispatcher = Arc::new(dispatcher(registry));
        let session = session();
        initialize(&dispatcher, &session).await;

        let id = RequestId::Number(7);
        let request = JsonRpcRequest::new(7, "tools/call", Some(serde_json::json!({"name": "hang"})));

        let d = dispatcher.clone();
        let s = session.clone();
        let handle = tokio::spawn(async move { d.dispatch_request(&s, request).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        session.cancel_request(&id);

        let resp = handle.await.unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn duplicate_in_flight_request_id_is_rejected() {
        let registry = Registry::new();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;
        let id = RequestId::Number(9);
        let token = session.begin_request(id.clone()).unwrap();
        let request = JsonRpcRequest::new(9, "ping", None);
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.error_payload().unwrap().code, -32600);
        session.end_request(&id);
        drop(token);
    }

    struct StructuredTool;

    #[async_trait]
    impl ToolHandler for StructuredTool {
        async fn call(&self, _params: CallToolParams, _ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            Ok(HandlerOutcome::Reply(CallToolResult::ok_with_structured(
                vec![Content::text("7")],
                serde_json::json!({"count": 7}),
            )))
        }
    }

    struct UnstructuredTool;

    #[async_trait]
    impl ToolHandler for UnstructuredTool {
        async fn call(&self, _params: CallToolParams, _ctx: RequestContext) -> EngineResult<HandlerOutcome<CallToolResult>> {
            Ok(HandlerOutcome::Reply(CallToolResult::ok(vec![Content::text("no structure")])))
        }
    }

    fn counting_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: Some(serde_json::json!({
                "type": "object",
                "properties": {"count": {"type": "integer"}},
                "required": ["count"],
            })),
        }
    }

    #[tokio::test]
    async fn output_schema_is_advisory_when_not_enforced() {
        let registry = Registry::new();
        registry
            .register_tool(counting_tool("count"), Arc::new(UnstructuredTool))
            .unwrap();
        let dispatcher = dispatcher(registry);
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "count"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn output_schema_violation_is_rejected_when_enforced() {
        let registry = Registry::new();
        registry
            .register_tool(counting_tool("count"), Arc::new(UnstructuredTool))
            .unwrap();
        let dispatcher = dispatcher_with_config(registry, EngineConfig::new().with_enforce_output_schema(true));
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "count"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.error_payload().unwrap().code, -32603);
    }

    #[tokio::test]
    async fn matching_structured_content_passes_enforcement() {
        let registry = Registry::new();
        registry
            .register_tool(counting_tool("count"), Arc::new(StructuredTool))
            .unwrap();
        let dispatcher = dispatcher_with_config(registry, EngineConfig::new().with_enforce_output_schema(true));
        let session = session();
        initialize(&dispatcher, &session).await;

        let request = JsonRpcRequest::new(2, "tools/call", Some(serde_json::json!({"name": "count"})));
        let resp = dispatcher.dispatch_request(&session, request).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result().unwrap()["structuredContent"]["count"], 7);
    }
}
