//! In-process tool provider: a table of name → handler.
//!
//! This is the plug-in point for built-in capabilities (filesystem, system
//! info, …). Handlers are registered by the enclosing application at startup;
//! there is no filesystem autodiscovery. Registration and lookup are O(1).

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{PermissionLevel, Tool, ToolDescriptor, ToolProvider, ToolResult};
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<ToolResult>> + Send>>;
type Handler = Arc<dyn Fn(Value, CancelToken) -> HandlerFuture + Send + Sync>;

/// A [`Tool`] built from a descriptor and a handler closure.
///
/// Convenient for hosts that register capabilities as plain functions rather
/// than trait impls.
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    permission_level: PermissionLevel,
    requires_confirmation: bool,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        permission_level: PermissionLevel,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            permission_level,
            requires_confirmation: false,
            handler: Arc::new(move |args, cancel| Box::pin(handler(args, cancel))),
        }
    }

    pub fn requires_confirmation(mut self, requires: bool) -> Self {
        self.requires_confirmation = requires;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }
    fn permission_level(&self) -> PermissionLevel {
        self.permission_level
    }
    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    async fn execute(&self, args: Value, cancel: CancelToken) -> Result<ToolResult> {
        (self.handler)(args, cancel).await
    }
}

/// [`ToolProvider`] backed by an in-memory handler table.
pub struct InProcessProvider {
    id: String,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl InProcessProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tools: HashMap::new(),
        }
    }

    /// Register a tool. The last registration under a name wins within this
    /// provider; cross-provider uniqueness is the registry's concern.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Builder-style registration.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolProvider for InProcessProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
                provider_id: self.id.clone(),
                permission_level: t.permission_level(),
                requires_confirmation: t.requires_confirmation(),
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: Value, cancel: CancelToken) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::ToolUnknown(name.to_string()))?
            .clone();
        tool.execute(arguments, cancel).await
    }
}
