//! Generic OpenAI-compatible backend adapter.
//!
//! Works with any API that follows the OpenAI chat-completion protocol:
//! OpenAI itself, Anthropic's compatibility endpoint, OpenRouter, and local
//! Ollama servers. The only differences between deployments are the base URL,
//! the API-key requirement, and the model-id convention, so they all share
//! this one adapter with per-deployment [`OpenAiCompatibleConfig`]
//! constructors.
//!
//! The adapter translates wire shapes only. It never retries: failures are
//! reported as typed [`BackendError`] categories and the router decides what
//! to do with them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::provider::{BackendError, BackendResult, LlmBackend, StreamResponse};
use crate::ai::types::{
    CompletionRequest, FinishReason, LlmResponse, Message, MessageRole, StreamChunk, ToolCall,
    ToolSpec,
};

/// Default timeout for HTTP requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: ApiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    /// JSON-encoded argument string on the wire; some gateways inline an
    /// object instead, so this stays a raw `Value` until decoding.
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiToolDef<'a>,
}

#[derive(Debug, Serialize)]
struct ApiToolDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiStreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<DeltaToolCall>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration for an OpenAI-compatible deployment.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// API key (empty for local deployments such as Ollama).
    pub api_key: String,
    /// Base URL for the API endpoint, without a trailing slash.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Context window limit reported through [`LlmBackend::context_limit`].
    pub context_limit: usize,
    /// Additional HTTP headers (e.g. Anthropic's version header).
    pub extra_headers: HashMap<String, String>,
}

impl OpenAiCompatibleConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            context_limit: 128_000,
            extra_headers: HashMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }

    /// Configuration for OpenAI.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new(api_key, "https://api.openai.com/v1")
    }

    /// Configuration for Anthropic's OpenAI-compatible endpoint.
    pub fn anthropic(api_key: impl Into<String>) -> Self {
        Self::new(api_key, "https://api.anthropic.com/v1")
            .with_header("anthropic-version", "2023-06-01")
    }

    /// Configuration for a local Ollama server (no API key).
    pub fn ollama() -> Self {
        Self::new("", "http://localhost:11434/v1").context_limit(32_000)
    }

    /// Configuration for OpenRouter.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new(api_key, "https://openrouter.ai/api/v1")
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

/// OpenAI-compatible implementation of [`LlmBackend`].
pub struct OpenAiCompatibleBackend {
    client: Client,
    config: OpenAiCompatibleConfig,
    provider_name: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        config: OpenAiCompatibleConfig,
        provider_name: impl Into<String>,
    ) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            provider_name: provider_name.into(),
        })
    }

    fn convert_message(msg: &Message) -> ApiMessage {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        ApiMessage {
            role: role.to_string(),
            content: Some(msg.content.clone()),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|c| ApiToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: ApiFunction {
                        name: c.name.clone(),
                        // The wire format wants a JSON-encoded string.
                        arguments: Value::String(c.arguments.to_string()),
                    },
                })
                .collect(),
            tool_call_id: msg.tool_call_id.clone(),
            name: msg.name.clone(),
        }
    }

    /// Decode a wire tool call, accepting both the JSON-string and inline
    /// object argument envelopes.
    fn decode_tool_call(call: &ApiToolCall) -> ToolCall {
        let arguments = match &call.function.arguments {
            Value::String(s) => {
                serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
            }
            v => v.clone(),
        };
        ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments,
        }
    }

    fn build_request<'a>(&self, request: &'a CompletionRequest) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            tools: request.tools.iter().map(tool_to_wire).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: request.stream,
        }
    }

    fn request_builder(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .header("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        for (key, value) in &self.config.extra_headers {
            builder = builder.header(key, value);
        }
        builder
    }

    /// Map an HTTP failure to a typed category.
    async fn classify_failure(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited { retry_after_ms },
            s if s.is_client_error() => {
                if body.contains("context_length") || body.contains("maximum context") {
                    BackendError::ContextTooLong
                } else {
                    BackendError::BadRequest(format!("{s}: {body}"))
                }
            }
            s => BackendError::Provider(format!("{s}: {body}")),
        }
    }

    fn transport_error(e: reqwest::Error) -> BackendError {
        if e.is_connect() || e.is_timeout() {
            BackendError::Unavailable(e.to_string())
        } else {
            BackendError::Provider(e.to_string())
        }
    }
}

fn tool_to_wire(spec: &ToolSpec) -> ApiTool<'_> {
    ApiTool {
        kind: "function",
        function: ApiToolDef {
            name: &spec.name,
            description: &spec.description,
            parameters: &spec.input_schema,
        },
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, request: CompletionRequest) -> BackendResult<LlmResponse> {
        let api_request = self.build_request(&request);
        let started = Instant::now();

        let response = self
            .request_builder("/chat/completions")
            .json(&api_request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Provider(format!("failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .first()
            .ok_or_else(|| BackendError::Provider("no choices in response".to_string()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .iter()
            .map(Self::decode_tool_call)
            .collect();

        let finish_reason = match &choice.finish_reason {
            Some(s) => FinishReason::from_wire(s),
            None if !tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };

        Ok(LlmResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            tool_calls,
            model: api_response.model,
            provider_id: self.provider_name.clone(),
            input_tokens: api_response.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: api_response
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
            finish_reason,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> BackendResult<StreamResponse> {
        let mut streaming = request;
        streaming.stream = Some(true);
        let api_request = self.build_request(&streaming);

        let response = self
            .request_builder("/chat/completions")
            .json(&api_request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let events = response.bytes_stream().eventsource();

        let stream = events.filter_map(|event| async move {
            let event = match event {
                Ok(e) => e,
                Err(e) => return Some(Err(BackendError::Provider(format!("stream error: {e}")))),
            };
            if event.data == "[DONE]" {
                return Some(Ok(StreamChunk::Done {
                    finish_reason: FinishReason::Stop,
                }));
            }
            let parsed: ApiStreamResponse = match serde_json::from_str(&event.data) {
                Ok(p) => p,
                Err(e) => {
                    return Some(Err(BackendError::Provider(format!(
                        "failed to parse stream frame: {e}"
                    ))));
                }
            };
            let choice = parsed.choices.into_iter().next()?;

            if let Some(reason) = &choice.finish_reason {
                return Some(Ok(StreamChunk::Done {
                    finish_reason: FinishReason::from_wire(reason),
                }));
            }
            if let Some(delta_call) = choice.delta.tool_calls.into_iter().next() {
                let function = delta_call.function.unwrap_or(DeltaFunction {
                    name: None,
                    arguments: None,
                });
                return Some(Ok(StreamChunk::ToolCallDelta {
                    index: delta_call.index,
                    id: delta_call.id,
                    name: function.name,
                    arguments: function.arguments,
                }));
            }
            let text = choice.delta.content?;
            if text.is_empty() {
                return None;
            }
            Some(Ok(StreamChunk::Text { text }))
        });

        Ok(Box::pin(stream))
    }

    async fn healthy(&self) -> bool {
        let mut builder = self.client.get(format!("{}/models", self.config.base_url));
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn context_limit(&self) -> usize {
        self.config.context_limit
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_openai() {
        let config = OpenAiCompatibleConfig::openai("test-key");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn config_anthropic_carries_version_header() {
        let config = OpenAiCompatibleConfig::anthropic("test-key");
        assert_eq!(
            config.extra_headers.get("anthropic-version"),
            Some(&"2023-06-01".to_string())
        );
    }

    #[test]
    fn config_ollama_is_keyless() {
        let config = OpenAiCompatibleConfig::ollama();
        assert!(config.api_key.is_empty());
        assert!(config.base_url.contains("11434"));
    }

    #[test]
    fn message_conversion_maps_roles() {
        let msg = Message::tool_result("call_1", "read_file", "contents");
        let api = OpenAiCompatibleBackend::convert_message(&msg);
        assert_eq!(api.role, "tool");
        assert_eq!(api.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api.name.as_deref(), Some("read_file"));
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let msg = Message::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "c".into(),
                name: "t".into(),
                arguments: serde_json::json!({"x": 1}),
            }],
        );
        let api = OpenAiCompatibleBackend::convert_message(&msg);
        assert!(matches!(api.tool_calls[0].function.arguments, Value::String(_)));
    }

    #[test]
    fn decode_tool_call_string_envelope() {
        let call = ApiToolCall {
            id: "c1".into(),
            kind: "function".into(),
            function: ApiFunction {
                name: "read_file".into(),
                arguments: Value::String(r#"{"path": "/tmp/x"}"#.into()),
            },
        };
        let decoded = OpenAiCompatibleBackend::decode_tool_call(&call);
        assert_eq!(decoded.arguments["path"], "/tmp/x");
    }

    #[test]
    fn decode_tool_call_inline_object() {
        let call = ApiToolCall {
            id: "c1".into(),
            kind: "function".into(),
            function: ApiFunction {
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "/tmp/y"}),
            },
        };
        let decoded = OpenAiCompatibleBackend::decode_tool_call(&call);
        assert_eq!(decoded.arguments["path"], "/tmp/y");
    }

    #[test]
    fn decode_tool_call_malformed_string_becomes_empty_object() {
        let call = ApiToolCall {
            id: "c1".into(),
            kind: "function".into(),
            function: ApiFunction {
                name: "t".into(),
                arguments: Value::String("{broken".into()),
            },
        };
        let decoded = OpenAiCompatibleBackend::decode_tool_call(&call);
        assert!(decoded.arguments.as_object().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn build_request_includes_tools() {
        let backend =
            OpenAiCompatibleBackend::new(OpenAiCompatibleConfig::ollama(), "ollama").unwrap();
        let request = CompletionRequest::new("llama3", vec![Message::user("hi")]).with_tools(vec![
            ToolSpec {
                name: "list_dir".into(),
                description: "List a directory".into(),
                input_schema: serde_json::json!({"type": "object"}),
            },
        ]);
        let api = backend.build_request(&request);
        assert_eq!(api.tools.len(), 1);
        assert_eq!(api.tools[0].function.name, "list_dir");
    }

    #[test]
    fn wire_request_omits_empty_tools() {
        let backend =
            OpenAiCompatibleBackend::new(OpenAiCompatibleConfig::ollama(), "ollama").unwrap();
        let request = CompletionRequest::new("llama3", vec![Message::user("hi")]);
        let api = backend.build_request(&request);
        let json = serde_json::to_string(&api).unwrap();
        assert!(!json.contains("\"tools\""));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Port 1 is almost certainly not listening.
        let config = OpenAiCompatibleConfig::new("", "http://127.0.0.1:1")
            .timeout(Duration::from_millis(200));
        let backend = OpenAiCompatibleBackend::new(config, "dead").unwrap();
        let result = backend
            .complete(CompletionRequest::new("m", vec![Message::user("hi")]))
            .await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert!(!backend.healthy().await);
    }
}
