//! Error taxonomy for the dispatch engine.
//!
//! Every failure mode carries a stable discriminator (an enum variant, never a
//! free-form string in the discriminator position). Tool-side variants are
//! rendered into `ToolResult`s by the registry and fed back to the LLM; they
//! are never fatal to the dispatch loop.

use thiserror::Error;

/// Errors raised by the dispatch engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed provider or security configuration. Fatal at startup,
    /// never raised at runtime.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend network or process is down. Triggers router fallback.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// Backend asked us to slow down.
    #[error("rate limited by '{provider}'")]
    RateLimited {
        provider: String,
        /// Suggested delay before retrying, when the backend supplied one.
        retry_after_ms: Option<u64>,
    },

    /// Backend rejected the request size. Not retried by the router; the
    /// dispatch loop may trim and re-issue once.
    #[error("context too long for '{provider}'")]
    ContextTooLong { provider: String },

    /// Malformed payload (invalid tool schema, invalid message ordering).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No healthy provider could satisfy the request.
    #[error("no provider available")]
    NoProviderAvailable,

    /// Registry miss: no tool registered under the requested name.
    #[error("unknown tool: {0}")]
    ToolUnknown(String),

    /// Tool arguments failed schema validation.
    #[error("invalid arguments: {0}")]
    ToolInvalidArguments(String),

    /// Blocked by sandbox, blocked-pattern rules, or confirmation refusal.
    #[error("denied: {0}")]
    ToolDenied(String),

    /// Per-call deadline exceeded.
    #[error("tool '{0}' timed out after {1} ms")]
    ToolTimeout(String, u64),

    /// Tool provider crashed mid-call.
    #[error("tool provider '{provider}' failed: {reason}")]
    ToolProvider { provider: String, reason: String },

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,

    /// Catch-all; logged with context at the raise site.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the router may retry this failure on the next provider in the
    /// fallback chain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderUnavailable { .. }
                | EngineError::RateLimited { .. }
                | EngineError::ToolProvider { .. }
        )
    }

    /// Whether this is a tool-side failure that the registry converts into an
    /// error `ToolResult` instead of surfacing.
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            EngineError::ToolUnknown(_)
                | EngineError::ToolInvalidArguments(_)
                | EngineError::ToolDenied(_)
                | EngineError::ToolTimeout(..)
                | EngineError::ToolProvider { .. }
        )
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories() {
        assert!(
            EngineError::ProviderUnavailable {
                provider: "p".into(),
                reason: "down".into()
            }
            .is_retryable()
        );
        assert!(
            EngineError::RateLimited {
                provider: "p".into(),
                retry_after_ms: None
            }
            .is_retryable()
        );
        assert!(!EngineError::ContextTooLong { provider: "p".into() }.is_retryable());
        assert!(!EngineError::BadRequest("x".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn tool_errors_are_classified() {
        assert!(EngineError::ToolUnknown("x".into()).is_tool_error());
        assert!(EngineError::ToolTimeout("x".into(), 30_000).is_tool_error());
        assert!(!EngineError::NoProviderAvailable.is_tool_error());
    }

    #[test]
    fn display_includes_discriminating_detail() {
        let err = EngineError::ToolTimeout("read_file".into(), 30_000);
        assert!(err.to_string().contains("read_file"));
        assert!(err.to_string().contains("30000"));
    }
}
