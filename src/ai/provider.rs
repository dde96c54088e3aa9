//! The backend adapter seam.
//!
//! Every LLM backend is exposed through [`LlmBackend`]: a uniform
//! `complete` / `stream` / `healthy` capability set. Adapters translate
//! between the engine's [`CompletionRequest`] / [`LlmResponse`] shapes and
//! whatever the backend expects; callers never see backend-specific wire
//! formats. Adapters do not retry — fallback is the router's job.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use super::types::{CompletionRequest, LlmResponse, StreamChunk};

/// Typed failure categories an adapter may raise.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network or process down.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend told us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Retry-after hint in milliseconds, when the backend supplied one.
        retry_after_ms: Option<u64>,
    },

    /// The backend rejected the request size.
    #[error("context too long")]
    ContextTooLong,

    /// Malformed payload; a bug on our side, never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Backend-side failure (5xx, protocol violation).
    #[error("provider error: {0}")]
    Provider(String),
}

impl BackendError {
    /// Whether the router may move on to the next provider in the fallback
    /// chain after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_)
                | BackendError::RateLimited { .. }
                | BackendError::Provider(_)
        )
    }
}

/// Result type for adapter operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Type alias for a streaming response.
pub type StreamResponse = Pin<Box<dyn Stream<Item = BackendResult<StreamChunk>> + Send>>;

/// Uniform capability set implemented by every LLM backend adapter.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Complete a request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> BackendResult<LlmResponse>;

    /// Stream a completion as a sequence of [`StreamChunk`]s. Chunks arrive
    /// in server order; the first `Err` item is terminal.
    async fn stream(&self, request: CompletionRequest) -> BackendResult<StreamResponse>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;

    /// Context window limit in tokens.
    fn context_limit(&self) -> usize;

    /// Whether this backend supports native tool calling.
    fn supports_tools(&self) -> bool;

    /// Stable backend name for logs and usage samples.
    fn provider_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BackendError::Unavailable("conn refused".into()).is_retryable());
        assert!(BackendError::RateLimited { retry_after_ms: Some(500) }.is_retryable());
        assert!(BackendError::Provider("502".into()).is_retryable());
        assert!(!BackendError::ContextTooLong.is_retryable());
        assert!(!BackendError::BadRequest("bad schema".into()).is_retryable());
    }
}
