//! LM plumbing: value types, the backend adapter seam, the heuristic task
//! classifier, the bounded conversation context, and the multi-backend
//! router.

pub mod classifier;
pub mod context;
pub mod provider;
pub mod providers;
pub mod router;
pub mod types;

pub use classifier::{Classification, ModelTier, TaskTier, classify};
pub use context::{ContextConfig, ConversationContext};
pub use provider::{BackendError, BackendResult, LlmBackend, StreamResponse};
pub use router::{BackendRegistration, LlmRouter, ModelCatalog, RouterPolicy, UsageSample};
pub use types::{
    CompletionRequest, FinishReason, LlmResponse, Message, MessageRole, StreamChunk, ToolCall,
    ToolSpec,
};
