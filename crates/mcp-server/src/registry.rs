//! The static, startup-populated description of tools, prompts, resources
//! and resource templates, plus the handler traits user code implements.
//! Entries are kept in an ordered list so `*/list` pagination can walk them
//! in a stable, registration order, with a `DashMap` name index layered on
//! top for O(1) lookup by name or URI.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mcp_protocol::types::{
    CallToolParams, CallToolResult, CompleteResult, CompletionArgumentParam, GetPromptParams,
    GetPromptResult, Prompt, ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use mcp_protocol::ProtocolError;
use mcp_uri_template::UriTemplate;
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::EngineResult;

/// The handler contract for a single request: either the dispatcher emits
/// `Reply` immediately, or the handler has already called
/// `RequestContext::defer` and the dispatcher should wait for that reply
/// instead.
#[derive(Debug)]
pub enum HandlerOutcome<T> {
    Reply(T),
    Deferred,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        params: CallToolParams,
        ctx: RequestContext,
    ) -> EngineResult<HandlerOutcome<CallToolResult>>;

    /// Optional JSON-schema input validation beyond what the registry's
    /// declared schema already constrains. Default accepts everything.
    fn validate_input(&self, _input: &Value) -> EngineResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(
        &self,
        params: GetPromptParams,
        ctx: RequestContext,
    ) -> EngineResult<HandlerOutcome<GetPromptResult>>;
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// `uri` is the concrete URI requested; for a resource template match it
    /// is the original request URI (use `vars` for the captured variables).
    async fn read(
        &self,
        uri: &str,
        vars: &std::collections::HashMap<String, String>,
        ctx: RequestContext,
    ) -> EngineResult<HandlerOutcome<ReadResourceResult>>;
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn complete(
        &self,
        argument: CompletionArgumentParam,
        ctx: RequestContext,
    ) -> EngineResult<CompleteResult>;
}

pub struct ToolEntry {
    pub tool: Tool,
    pub handler: Arc<dyn ToolHandler>,
    pub completion_hook: Option<String>,
}

pub struct PromptEntry {
    pub prompt: Prompt,
    pub handler: Arc<dyn PromptHandler>,
    pub completion_hook: Option<String>,
}

pub struct ResourceEntry {
    pub resource: Resource,
    pub handler: Arc<dyn ResourceHandler>,
}

pub struct ResourceTemplateEntry {
    pub template: UriTemplate,
    pub description: ResourceTemplate,
    pub handler: Arc<dyn ResourceHandler>,
    pub completion_hook: Option<String>,
}

/// Shared immutable configuration once startup registration finishes. The
/// `RwLock` only ever takes write locks during the registration phase;
/// list/get operations take read locks.
#[derive(Default)]
pub struct Registry {
    tools: RwLock<Vec<ToolEntry>>,
    tool_names: DashMap<String, usize>,
    prompts: RwLock<Vec<PromptEntry>>,
    prompt_names: DashMap<String, usize>,
    resources: RwLock<Vec<ResourceEntry>>,
    resource_uris: DashMap<String, usize>,
    resource_templates: RwLock<Vec<ResourceTemplateEntry>>,
    completions: DashMap<String, Arc<dyn CompletionHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) -> Result<(), ProtocolError> {
        self.register_tool_with_completion(tool, handler, None)
    }

    pub fn register_tool_with_completion(
        &self,
        tool: Tool,
        handler: Arc<dyn ToolHandler>,
        completion_hook: Option<String>,
    ) -> Result<(), ProtocolError> {
        let mut tools = self.tools.write();
        if self.tool_names.contains_key(&tool.name) {
            return Err(ProtocolError::AlreadyRegistered {
                kind: "tool",
                name: tool.name,
            });
        }
        self.tool_names.insert(tool.name.clone(), tools.len());
        tools.push(ToolEntry {
            tool,
            handler,
            completion_hook,
        });
        Ok(())
    }

    pub fn register_prompt(
        &self,
        prompt: Prompt,
        handler: Arc<dyn PromptHandler>,
    ) -> Result<(), ProtocolError> {
        self.register_prompt_with_completion(prompt, handler, None)
    }

    pub fn register_prompt_with_completion(
        &self,
        prompt: Prompt,
        handler: Arc<dyn PromptHandler>,
        completion_hook: Option<String>,
    ) -> Result<(), ProtocolError> {
        let mut prompts = self.prompts.write();
        if self.prompt_names.contains_key(&prompt.name) {
            return Err(ProtocolError::AlreadyRegistered {
                kind: "prompt",
                name: prompt.name,
            });
        }
        self.prompt_names.insert(prompt.name.clone(), prompts.len());
        prompts.push(PromptEntry {
            prompt,
            handler,
            completion_hook,
        });
        Ok(())
    }

    pub fn register_resource(
        &self,
        resource: Resource,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), ProtocolError> {
        let mut resources = self.resources.write();
        if self.resource_uris.contains_key(&resource.uri) {
            return Err(ProtocolError::AlreadyRegistered {
                kind: "resource",
                name: resource.uri,
            });
        }
        self.resource_uris.insert(resource.uri.clone(), resources.len());
        resources.push(ResourceEntry { resource, handler });
        Ok(())
    }

    pub fn register_resource_template(
        &self,
        description: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
        completion_hook: Option<String>,
    ) -> Result<(), ProtocolError> {
        let template = UriTemplate::parse(&description.uri_template).map_err(|_| {
            ProtocolError::InvalidParams(format!(
                "malformed URI template {:?}",
                description.uri_template
            ))
        })?;
        let mut templates = self.resource_templates.write();
        if let Some(existing) = templates.iter().find(|e| e.template.conflicts_with(&template)) {
            return Err(ProtocolError::AmbiguousTemplate {
                new_template: template.as_str().to_string(),
                existing_template: existing.template.as_str().to_string(),
            });
        }
        templates.push(ResourceTemplateEntry {
            template,
            description,
            handler,
            completion_hook,
        });
        Ok(())
    }

    pub fn register_completion_handler(&self, name: impl Into<String>, handler: Arc<dyn CompletionHandler>) {
        self.completions.insert(name.into(), handler);
    }

    pub fn completion_handler(&self, name: &str) -> Option<Arc<dyn CompletionHandler>> {
        self.completions.get(name).map(|e| e.clone())
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().len()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.read().len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    pub fn has_resources(&self) -> bool {
        self.resource_count() > 0 || !self.resource_templates.read().is_empty()
    }

    /// List tools starting at `offset`, up to `limit` entries, in
    /// registration order. Returns the page plus whether more entries exist.
    pub fn list_tools(&self, offset: u64, limit: usize) -> (Vec<Tool>, bool) {
        let tools = self.tools.read();
        page(&tools, offset, limit, |e| e.tool.clone())
    }

    pub fn list_prompts(&self, offset: u64, limit: usize) -> (Vec<Prompt>, bool) {
        let prompts = self.prompts.read();
        page(&prompts, offset, limit, |e| e.prompt.clone())
    }

    pub fn list_resources(&self, offset: u64, limit: usize) -> (Vec<Resource>, bool) {
        let resources = self.resources.read();
        page(&resources, offset, limit, |e| e.resource.clone())
    }

    pub fn list_resource_templates(&self, offset: u64, limit: usize) -> (Vec<ResourceTemplate>, bool) {
        let templates = self.resource_templates.read();
        page(&templates, offset, limit, |e| e.description.clone())
    }

    pub fn get_tool(&self, name: &str) -> Option<(Tool, Arc<dyn ToolHandler>)> {
        let idx = *self.tool_names.get(name)?;
        let tools = self.tools.read();
        tools.get(idx).map(|e| (e.tool.clone(), e.handler.clone()))
    }

    pub fn get_prompt(&self, name: &str) -> Option<(Prompt, Arc<dyn PromptHandler>)> {
        let idx = *self.prompt_names.get(name)?;
        let prompts = self.prompts.read();
        prompts.get(idx).map(|e| (e.prompt.clone(), e.handler.clone()))
    }

    /// Resolve a concrete URI against either a registered resource link or,
    /// failing that, the best-matching resource template (longest literal
    /// prefix first, ties broken lexicographically).
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Option<(Arc<dyn ResourceHandler>, std::collections::HashMap<String, String>)> {
        if let Some(idx) = self.resource_uris.get(uri) {
            let resources = self.resources.read();
            if let Some(entry) = resources.get(*idx) {
                return Some((entry.handler.clone(), std::collections::HashMap::new()));
            }
        }
        let templates = self.resource_templates.read();
        let mut candidates: Vec<&ResourceTemplateEntry> = templates.iter().collect();
        candidates.sort_by(|a, b| {
            b.template
                .literal_prefix_len()
                .cmp(&a.template.literal_prefix_len())
                .then_with(|| a.template.as_str().cmp(b.template.as_str()))
        });
        for entry in candidates {
            if let Some(vars) = entry.template.matches(uri) {
                return Some((entry.handler.clone(), vars));
            }
        }
        None
    }
}

fn page<T, U>(entries: &[T], offset: u64, limit: usize, project: impl Fn(&T) -> U) -> (Vec<U>, bool) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(entries.len());
    let end = start.saturating_add(limit).min(entries.len());
    let page = entries[start..end].iter().map(project).collect();
    let has_more = end < entries.len();
    (page, has_more)
}
