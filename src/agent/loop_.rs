//! The dispatch loop: the LM ↔ tool turn state machine.
//!
//! # Algorithm
//!
//! ```text
//! resolve_references(user text) → append to context → classify
//!       │
//!       ▼
//! router.complete(snapshot + tool catalog)
//!       │
//!       ├─ no tool calls ──► return assistant text
//!       ▼
//! dispatch all tool calls (parallel, capped) via the registry
//!   append tool_result messages in positional order
//!       │
//!       ▼
//! turn += 1; turn < max_turns → repeat
//!       │
//!       ▼
//! append synthetic warning and stop
//! ```
//!
//! Tool failures are never fatal here: they come back as error results, get
//! appended as `tool_result` messages, and the model decides what to do next.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ai::classifier::{Classification, classify};
use crate::ai::context::ConversationContext;
use crate::ai::router::{LlmRouter, RouteRequest};
use crate::ai::types::{
    CompletionRequest, FinishReason, LlmResponse, Message, StreamChunk, ToolCallAccumulator,
};
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::event_bus::{EngineEvent, EventBus};
use crate::tools::registry::ToolRegistry;

/// Bounded capacity of the UI stream channel; a slow consumer back-pressures
/// the LM stream reader through `send`.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Create the stream channel a UI hands to [`DispatchLoop::handle`].
pub fn stream_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(STREAM_CHANNEL_CAPACITY)
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Runtime configuration for a [`DispatchLoop`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Safety cap on LM ↔ tool iterations per user submission.
    pub max_turns: usize,
    /// Sampling temperature forwarded to the router. `None` uses the
    /// backend default.
    pub temperature: Option<f32>,
    /// Response token cap forwarded to the router.
    pub max_tokens: Option<u32>,
    /// Run one turn's tool calls concurrently.
    pub parallel_tools: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            temperature: None,
            max_tokens: None,
            parallel_tools: true,
        }
    }
}

/// Outcome of one user submission.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Correlation id, also carried by the bus events for this submission.
    pub submission_id: String,
    /// Final assistant text.
    pub text: String,
    /// Number of LM turns consumed.
    pub turns: usize,
    /// Classification of the submission (surfaced to telemetry).
    pub classification: Classification,
}

// ─── DispatchLoop ────────────────────────────────────────────────────────────

/// The engine's turn loop. Stateless across submissions: conversation state
/// lives in the caller-owned [`ConversationContext`].
pub struct DispatchLoop {
    router: Arc<LlmRouter>,
    registry: Arc<ToolRegistry>,
    config: DispatchConfig,
    bus: Option<Arc<dyn EventBus>>,
}

impl DispatchLoop {
    pub fn new(router: Arc<LlmRouter>, registry: Arc<ToolRegistry>, config: DispatchConfig) -> Self {
        Self {
            router,
            registry,
            config,
            bus: None,
        }
    }

    /// Attach the engine event bus; the loop announces submission start and
    /// completion on it.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(event);
        }
    }

    /// Handle one user submission to completion.
    ///
    /// When `stream` is supplied, assistant text chunks are forwarded to it
    /// as they arrive and tool-call deltas are buffered until the stream
    /// finishes; otherwise completions are batched. Cancellation aborts at
    /// the next await point and cancels in-flight tool calls.
    #[tracing::instrument(name = "dispatch.handle", skip_all, fields(input_len = user_text.len()))]
    pub async fn handle(
        &self,
        context: &mut ConversationContext,
        user_text: &str,
        cancel: CancelToken,
        stream: Option<mpsc::Sender<String>>,
    ) -> Result<DispatchOutcome> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let submission_id = uuid::Uuid::new_v4().to_string();
        self.emit(EngineEvent::DispatchStarted {
            submission_id: submission_id.clone(),
        });

        let resolved = context.resolve_references(user_text);
        let classification = classify(&resolved);
        context.append(Message::user(resolved));

        let route = RouteRequest::for_tiers(
            classification.tier,
            classification.suggested_model_tier,
        );

        let mut trimmed_once = false;
        let mut turns = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // ── LM call ──────────────────────────────────────────────────────
            let request = self.build_request(context);
            let completion = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.complete_turn(request, &route, stream.as_ref()) => result,
            };

            let response = match completion {
                Ok(response) => response,
                Err(EngineError::ContextTooLong { .. }) if !trimmed_once => {
                    // Recover once: evict beyond the protected set, re-issue.
                    let dropped = context.shrink_for_retry();
                    log::info!(
                        "dispatch: context too long, dropped {dropped} message(s) and retrying"
                    );
                    trimmed_once = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // ── Assistant turn ───────────────────────────────────────────────
            context.append(Message::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                self.emit(EngineEvent::DispatchCompleted {
                    submission_id: submission_id.clone(),
                    turns: turns + 1,
                });
                return Ok(DispatchOutcome {
                    submission_id,
                    text: response.content,
                    turns: turns + 1,
                    classification,
                });
            }

            // ── Tool turn ────────────────────────────────────────────────────
            let results = self
                .registry
                .dispatch_all(&response.tool_calls, self.config.parallel_tools, cancel.clone())
                .await;
            // Results come back keyed by id in the original call order; the
            // tool_result messages keep that positional order regardless of
            // completion order.
            for (call_id, result) in results {
                let name = response
                    .tool_calls
                    .iter()
                    .find(|c| c.id == call_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                context.note_tool_result(result.text.clone());
                context.append(Message::tool_result(call_id, name, result.text));
            }

            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            turns += 1;
            if turns >= self.config.max_turns {
                let warning = format!(
                    "I was unable to finish this request within {} tool rounds; stopping here. \
                     The partial results above are what I gathered so far.",
                    self.config.max_turns
                );
                context.append(Message::assistant(warning.clone()));
                self.emit(EngineEvent::DispatchCompleted {
                    submission_id: submission_id.clone(),
                    turns,
                });
                return Ok(DispatchOutcome {
                    submission_id,
                    text: warning,
                    turns,
                    classification,
                });
            }
        }
    }

    fn build_request(&self, context: &ConversationContext) -> CompletionRequest {
        // The model id is the router's choice; the placeholder is replaced
        // during selection.
        let mut request = CompletionRequest::new(String::new(), context.messages_for_llm())
            .with_tools(self.registry.tools_for_llm());
        if let Some(t) = self.config.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.config.max_tokens {
            request = request.with_max_tokens(m);
        }
        request
    }

    /// One LM call, streamed or batched.
    async fn complete_turn(
        &self,
        request: CompletionRequest,
        route: &RouteRequest,
        stream: Option<&mpsc::Sender<String>>,
    ) -> Result<LlmResponse> {
        let Some(sink) = stream else {
            return self.router.complete(request, route).await;
        };

        use futures::StreamExt;

        let mut chunks = self.router.stream(request, route).await?;
        let mut content = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        let mut finish_reason = FinishReason::Stop;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(StreamChunk::Text { text }) => {
                    // A full channel blocks here, back-pressuring the reader.
                    if sink.send(text.clone()).await.is_err() {
                        log::debug!("dispatch: stream consumer went away, buffering only");
                    }
                    content.push_str(&text);
                }
                Ok(StreamChunk::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    accumulator.push(index, id.as_deref(), name.as_deref(), arguments.as_deref());
                }
                Ok(StreamChunk::Done { finish_reason: fr }) => {
                    finish_reason = fr;
                    break;
                }
                // Once chunks have flowed, a failure is terminal (no
                // transparent failover mid-stream).
                Err(e) => {
                    return Err(EngineError::ProviderUnavailable {
                        provider: "stream".into(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let tool_calls = accumulator.finish();
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            finish_reason
        };
        Ok(LlmResponse {
            content,
            tool_calls,
            model: String::new(),
            provider_id: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            finish_reason,
        })
    }
}
