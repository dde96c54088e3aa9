use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::Result;

// ─── Permission levels ───────────────────────────────────────────────────────

/// Coarse classification of a tool's potential impact.
///
/// Ordered by severity: `Read < Write < Execute < System < Dangerous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
    Execute,
    System,
    Dangerous,
}

// ─── ToolResult ──────────────────────────────────────────────────────────────

/// The result of executing a tool.
///
/// Invariants: `is_error` implies `!success`; when `success` holds, `text` is
/// the canonical summary fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub text: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ─── ToolDescriptor ──────────────────────────────────────────────────────────

/// Registry-owned description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique across the registry; first registration wins.
    pub name: String,
    pub description: String,
    /// JSON-Schema-shaped parameter description.
    pub input_schema: Value,
    /// Id of the provider that serves this tool.
    pub provider_id: String,
    pub permission_level: PermissionLevel,
    pub requires_confirmation: bool,
}

// ─── Tool (in-process handler) ───────────────────────────────────────────────

/// A capability served in-process.
///
/// Implementations must be `Send + Sync`; handlers in the same provider may
/// run concurrently, and shared state is their own responsibility.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"read_file"`.
    fn name(&self) -> &str;

    /// Human-readable description used in the LM tool catalog.
    fn description(&self) -> &str;

    /// JSON Schema object describing the accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// Impact classification; drives the security policy.
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }

    /// Whether every invocation needs explicit user confirmation regardless
    /// of level.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Execute with already-validated arguments. The cancel token is
    /// signalled when the enclosing dispatch is aborted.
    async fn execute(&self, args: Value, cancel: CancelToken) -> Result<ToolResult>;
}

// ─── ToolProvider ────────────────────────────────────────────────────────────

/// A backend serving one or more tools: an in-process handler table or an
/// external subprocess.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Stable provider id, used for namespacing and rate limiting.
    fn id(&self) -> &str;

    /// Descriptors for every tool this provider serves.
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Invoke a tool by its provider-local name.
    async fn call(&self, name: &str, arguments: Value, cancel: CancelToken) -> Result<ToolResult>;
}

// ─── Confirmation ────────────────────────────────────────────────────────────

/// UI-supplied gate for confirmation-requiring dispatches.
///
/// The callback's latency is not counted against the tool's timeout.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, descriptor: &ToolDescriptor, arguments: &Value) -> bool;
}
