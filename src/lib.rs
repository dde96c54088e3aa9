//! Ordis — a natural-language command dispatch engine.
//!
//! A user types a free-form request; an LM decides which capability (a
//! "tool") to invoke; the engine runs it, feeds the result back, and loops
//! until the model produces a final answer. This crate is the core of that
//! machine:
//!
//! - **LM router** ([`ai::router`]) — fan-out over multiple completion
//!   backends with health-based fallback, task-tier model selection, and
//!   streaming.
//! - **Tool orchestrator** ([`tools`], [`security`], [`mcp`]) — a registry of
//!   tool providers (in-process handler tables and external subprocesses
//!   speaking JSON-RPC 2.0 over stdio), a dispatcher enforcing the security
//!   policy, and a supervisor ([`supervisor`]) that health-checks providers
//!   and restarts failures with backoff.
//! - **Conversation loop** ([`agent`]) — the LM ↔ tool turn state machine
//!   over a bounded, reference-resolving context ([`ai::context`]).
//!
//! The terminal UI, CLI parsing, config-file loading, and the semantics of
//! individual built-in tools are external collaborators: they plug in
//! through [`tools::ToolProvider`], [`tools::ConfirmationHandler`], the
//! stream channel, and the [`event_bus`].

pub mod agent;
pub mod ai;
pub mod cancel;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod mcp;
pub mod security;
pub mod supervisor;
pub mod tools;

/// Convenience re-exports for the most commonly used types.
///
/// ```rust
/// use ordis::prelude::*;
/// ```
pub mod prelude {
    // LM layer
    pub use crate::ai::provider::LlmBackend;
    pub use crate::ai::router::{BackendRegistration, LlmRouter, ModelCatalog, RouterPolicy};
    pub use crate::ai::types::{CompletionRequest, LlmResponse, Message, MessageRole, ToolCall};
    pub use crate::ai::{Classification, ContextConfig, ConversationContext, classify};

    // Tool system
    pub use crate::tools::{
        ConfirmationHandler, FnTool, InProcessProvider, PermissionLevel, RegistryConfig, Tool,
        ToolDescriptor, ToolProvider, ToolRegistry, ToolResult,
    };

    // External tool servers
    pub use crate::mcp::{McpClient, McpServerConfig, McpToolProvider};

    // Security
    pub use crate::security::{SecurityConfig, SecurityPolicy};

    // Supervision
    pub use crate::supervisor::{Managed, Supervisor, SupervisorConfig};

    // Event bus
    pub use crate::event_bus::{EngineEvent, EventBus, BroadcastBus};

    // Dispatch loop
    pub use crate::agent::{DispatchConfig, DispatchLoop, stream_channel};

    // Cancellation & errors
    pub use crate::cancel::CancelToken;
    pub use crate::error::{EngineError, Result};

    // Configuration
    pub use crate::config::{BackendConfig, EngineConfig};
}
