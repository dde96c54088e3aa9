//! Central tool registry and dispatcher.
//!
//! The registry owns every [`ToolDescriptor`], routes calls to the provider
//! that serves them, and gates each dispatch through the security policy:
//! lookup, schema validation, path sandbox, blocked patterns, confirmation,
//! rate limit, then the provider call under a timeout. Tool failures are
//! never fatal — every outcome is rendered into a [`ToolResult`] so the
//! model can react to it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{StreamExt, stream};

use super::schema::{descriptor_to_llm_format, validate_arguments};
use super::traits::{ConfirmationHandler, ToolDescriptor, ToolProvider, ToolResult};
use crate::ai::types::{ToolCall, ToolSpec};
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::event_bus::{EngineEvent, EventBus};
use crate::security::{PolicyDecision, RateAcquire, SecurityPolicy};

/// Dispatcher limits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-call timeout unless the caller overrides it.
    pub default_timeout_ms: u64,
    /// Concurrency cap for one turn's parallel dispatch.
    pub max_parallel_tools: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_parallel_tools: 4,
        }
    }
}

struct Route {
    provider_id: String,
    /// The name the provider knows this tool by (differs from the registered
    /// name when namespacing resolved a collision).
    local_name: String,
}

/// Name → provider routing table with policy enforcement.
///
/// Registration happens at startup behind `&mut self`; afterwards the
/// registry is shared immutably (`Arc<ToolRegistry>`) and the descriptor
/// table is append-only.
pub struct ToolRegistry {
    providers: HashMap<String, Arc<dyn ToolProvider>>,
    descriptors: HashMap<String, ToolDescriptor>,
    routes: HashMap<String, Route>,
    policy: Arc<SecurityPolicy>,
    confirmer: Option<Arc<dyn ConfirmationHandler>>,
    bus: Option<Arc<dyn EventBus>>,
    config: RegistryConfig,
}

impl ToolRegistry {
    pub fn new(policy: Arc<SecurityPolicy>, config: RegistryConfig) -> Self {
        Self {
            providers: HashMap::new(),
            descriptors: HashMap::new(),
            routes: HashMap::new(),
            policy,
            confirmer: None,
            bus: None,
            config,
        }
    }

    /// Attach the UI's confirmation gate. Without one, every
    /// confirmation-requiring dispatch is denied.
    pub fn with_confirmation(mut self, confirmer: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Attach the engine event bus for tool start/finish events.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a provider and all of its tools.
    ///
    /// A tool name is registered at most once: on collision the new tool is
    /// retried under `<provider-id>.<name>`, and rejected if that collides
    /// too. Returns the names actually registered.
    pub fn register(
        &mut self,
        provider: Arc<dyn ToolProvider>,
    ) -> crate::error::Result<Vec<String>> {
        let provider_id = provider.id().to_string();
        if self.providers.contains_key(&provider_id) {
            return Err(EngineError::Config(format!(
                "provider '{provider_id}' is already registered"
            )));
        }

        let mut registered = Vec::new();
        for mut descriptor in provider.descriptors() {
            let local_name = descriptor.name.clone();
            let name = if self.descriptors.contains_key(&local_name) {
                let namespaced = format!("{provider_id}.{local_name}");
                if self.descriptors.contains_key(&namespaced) {
                    log::warn!(
                        "registry: rejecting duplicate tool '{local_name}' from '{provider_id}'"
                    );
                    continue;
                }
                namespaced
            } else {
                local_name.clone()
            };
            descriptor.name = name.clone();
            descriptor.provider_id = provider_id.clone();
            self.descriptors.insert(name.clone(), descriptor);
            self.routes.insert(
                name.clone(),
                Route {
                    provider_id: provider_id.clone(),
                    local_name,
                },
            );
            registered.push(name);
        }

        self.providers.insert(provider_id, provider);
        Ok(registered)
    }

    // ── Catalog ──────────────────────────────────────────────────────────────

    /// All registered descriptors.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// The catalog in the uniform LM tool format.
    pub fn tools_for_llm(&self) -> Vec<ToolSpec> {
        self.tools().iter().map(descriptor_to_llm_format).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Dispatch one tool call. Every failure mode is rendered into an error
    /// `ToolResult`; this method never surfaces an `Err` to the loop.
    #[tracing::instrument(name = "tools.dispatch", skip_all, fields(tool = %call.name))]
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> ToolResult {
        // 1. Lookup.
        let (Some(descriptor), Some(route)) =
            (self.descriptors.get(&call.name), self.routes.get(&call.name))
        else {
            return ToolResult::err(format!("unknown tool: {}", call.name));
        };
        let level = descriptor.permission_level;

        // 2. Schema validation, before any provider involvement.
        if let Err(reason) = validate_arguments(&descriptor.input_schema, &call.arguments) {
            self.policy.log_action(
                &descriptor.name,
                call.arguments.clone(),
                level,
                "invalid_arguments",
                Some(&reason),
            );
            return ToolResult::err(format!("invalid arguments: {reason}"));
        }

        // 3–4. Sandbox and blocked patterns, then the confirmation gate.
        match self.policy.evaluate(descriptor, &call.arguments) {
            PolicyDecision::Denied(reason) => {
                self.policy.log_action(
                    &descriptor.name,
                    call.arguments.clone(),
                    level,
                    "denied",
                    Some(&reason),
                );
                return ToolResult::err(format!("denied: {reason}"));
            }
            PolicyDecision::NeedsConfirmation => {
                // 5. The confirmation callback's latency is deliberately
                // outside the tool timeout below.
                let approved = match &self.confirmer {
                    Some(confirmer) => confirmer.confirm(descriptor, &call.arguments).await,
                    None => false,
                };
                if !approved {
                    self.policy.log_action(
                        &descriptor.name,
                        call.arguments.clone(),
                        level,
                        "denied",
                        Some("confirmation declined"),
                    );
                    return ToolResult::err("denied by user");
                }
            }
            PolicyDecision::Allowed => {}
        }

        // Rate limit (token bucket per provider per minute).
        match self.policy.acquire(&route.provider_id) {
            RateAcquire::Ok => {}
            RateAcquire::WaitFor(delay) => {
                tokio::time::sleep(delay).await;
            }
            RateAcquire::Denied => {
                self.policy.log_action(
                    &descriptor.name,
                    call.arguments.clone(),
                    level,
                    "rate_limited",
                    None,
                );
                return ToolResult::err(format!(
                    "rate limited: provider '{}' is over its per-minute budget",
                    route.provider_id
                ));
            }
        }

        // 6. Forward to the provider under the per-call timeout.
        let Some(provider) = self.providers.get(&route.provider_id) else {
            return ToolResult::err(format!(
                "denied: provider '{}' is not registered",
                route.provider_id
            ));
        };
        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.default_timeout_ms));

        self.emit(EngineEvent::ToolStarted {
            tool_name: descriptor.name.clone(),
            args: call.arguments.clone(),
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(
                timeout,
                provider.call(&route.local_name, call.arguments.clone(), cancel.clone()),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(EngineError::ToolTimeout(
                    descriptor.name.clone(),
                    timeout.as_millis() as u64,
                )),
            },
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => ToolResult::err(e.to_string()),
        };

        self.policy.log_action(
            &descriptor.name,
            call.arguments.clone(),
            level,
            if result.success { "allowed" } else { "failed" },
            Some(&result.text),
        );
        self.emit(EngineEvent::ToolFinished {
            tool_name: descriptor.name.clone(),
            success: result.success,
            summary: result.text.chars().take(200).collect(),
        });

        result
    }

    /// Dispatch a batch of tool calls, returning results keyed by call id in
    /// the original order regardless of completion order. With `parallel`,
    /// up to `max_parallel_tools` calls run concurrently; one call's failure
    /// never cancels its siblings.
    pub async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        parallel: bool,
        cancel: CancelToken,
    ) -> Vec<(String, ToolResult)> {
        if parallel {
            stream::iter(calls.iter().map(|call| {
                let cancel = cancel.clone();
                async move {
                    let result = self.dispatch(call, None, cancel).await;
                    (call.id.clone(), result)
                }
            }))
            .buffered(self.config.max_parallel_tools.max(1))
            .collect()
            .await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let result = self.dispatch(call, None, cancel.clone()).await;
                results.push((call.id.clone(), result));
            }
            results
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{RateLimitBehavior, SecurityConfig};
    use crate::tools::inproc::{FnTool, InProcessProvider};
    use crate::tools::traits::PermissionLevel;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_provider(id: &str) -> InProcessProvider {
        InProcessProvider::new(id).with_tool(Arc::new(FnTool::new(
            "echo",
            "Echo the message back",
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
            PermissionLevel::Read,
            |args, _cancel| async move {
                let msg = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                Ok(ToolResult::ok(msg.to_string()))
            },
        )))
    }

    fn open_policy() -> Arc<SecurityPolicy> {
        Arc::new(
            SecurityPolicy::new(SecurityConfig {
                sandbox_block: vec![],
                blocked_patterns: vec![],
                confirmation_levels: vec![],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(echo_provider("builtin"))).unwrap();
        registry
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    #[test]
    fn register_lists_tools() {
        let registry = registry_with_echo();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tools()[0].name, "echo");
        assert_eq!(registry.tools_for_llm()[0].name, "echo");
    }

    #[test]
    fn colliding_name_gets_namespaced() {
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(echo_provider("alpha"))).unwrap();
        let second = registry.register(Arc::new(echo_provider("beta"))).unwrap();
        assert_eq!(second, vec!["beta.echo"]);
        assert!(registry.descriptor("echo").is_some());
        assert!(registry.descriptor("beta.echo").is_some());
    }

    #[test]
    fn duplicate_provider_id_rejected() {
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(echo_provider("builtin"))).unwrap();
        let result = registry.register(Arc::new(echo_provider("builtin")));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn namespaced_tool_dispatches_with_local_name() {
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(echo_provider("alpha"))).unwrap();
        registry.register(Arc::new(echo_provider("beta"))).unwrap();
        let result = registry
            .dispatch(
                &call("c1", "beta.echo", json!({"message": "hi"})),
                None,
                CancelToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.text, "hi");
    }

    // ── Dispatch pipeline ────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_is_error_result() {
        let registry = registry_with_echo();
        let result = registry
            .dispatch(&call("c1", "missing", json!({})), None, CancelToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.text.contains("unknown tool: missing"));
    }

    #[tokio::test]
    async fn invalid_arguments_skip_the_provider() {
        let registry = registry_with_echo();
        // `message` is required.
        let result = registry
            .dispatch(&call("c1", "echo", json!({})), None, CancelToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.text.starts_with("invalid arguments:"));
    }

    #[tokio::test]
    async fn successful_dispatch_returns_tool_output() {
        let registry = registry_with_echo();
        let result = registry
            .dispatch(
                &call("c1", "echo", json!({"message": "ping"})),
                None,
                CancelToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.text, "ping");
    }

    #[tokio::test]
    async fn timeout_converts_to_error_result() {
        let provider = InProcessProvider::new("slowco").with_tool(Arc::new(FnTool::new(
            "sleepy",
            "Sleep for a while",
            json!({"type": "object"}),
            PermissionLevel::Read,
            |_args, _cancel| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ToolResult::ok("never"))
            },
        )));
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(provider)).unwrap();

        let result = registry
            .dispatch(
                &call("c1", "sleepy", json!({})),
                Some(Duration::from_millis(20)),
                CancelToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert!(result.text.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_dispatch() {
        let registry = registry_with_echo();
        let token = CancelToken::new();
        token.cancel();
        let result = registry
            .dispatch(&call("c1", "echo", json!({"message": "hi"})), None, token)
            .await;
        assert!(result.is_error);
        assert!(result.text.contains("cancelled"));
    }

    // ── Confirmation ─────────────────────────────────────────────────────────

    struct ScriptedConfirmer {
        answer: bool,
        asked: AtomicU32,
    }

    #[async_trait]
    impl ConfirmationHandler for ScriptedConfirmer {
        async fn confirm(&self, _descriptor: &ToolDescriptor, _args: &Value) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn dangerous_provider(invocations: Arc<AtomicU32>) -> InProcessProvider {
        InProcessProvider::new("danger").with_tool(Arc::new(
            FnTool::new(
                "wipe",
                "Wipe something",
                json!({"type": "object"}),
                PermissionLevel::Dangerous,
                move |_args, _cancel| {
                    let invocations = Arc::clone(&invocations);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(ToolResult::ok("wiped"))
                    }
                },
            ),
        ))
    }

    #[tokio::test]
    async fn declined_confirmation_denies_and_never_invokes_handler() {
        let invocations = Arc::new(AtomicU32::new(0));
        let confirmer = Arc::new(ScriptedConfirmer {
            answer: false,
            asked: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new(
            Arc::new(SecurityPolicy::default_policy()),
            RegistryConfig::default(),
        )
        .with_confirmation(confirmer.clone());
        registry
            .register(Arc::new(dangerous_provider(Arc::clone(&invocations))))
            .unwrap();

        let result = registry
            .dispatch(&call("c1", "wipe", json!({})), None, CancelToken::new())
            .await;
        assert!(result.is_error);
        assert_eq!(result.text, "denied by user");
        assert_eq!(confirmer.asked.load(Ordering::SeqCst), 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 0, "handler never ran");
    }

    #[tokio::test]
    async fn approved_confirmation_proceeds() {
        let invocations = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new(
            Arc::new(SecurityPolicy::default_policy()),
            RegistryConfig::default(),
        )
        .with_confirmation(Arc::new(ScriptedConfirmer {
            answer: true,
            asked: AtomicU32::new(0),
        }));
        registry
            .register(Arc::new(dangerous_provider(Arc::clone(&invocations))))
            .unwrap();

        let result = registry
            .dispatch(&call("c1", "wipe", json!({})), None, CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_confirmer_denies_conservatively() {
        let invocations = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new(
            Arc::new(SecurityPolicy::default_policy()),
            RegistryConfig::default(),
        );
        registry
            .register(Arc::new(dangerous_provider(Arc::clone(&invocations))))
            .unwrap();

        let result = registry
            .dispatch(&call("c1", "wipe", json!({})), None, CancelToken::new())
            .await;
        assert!(result.is_error);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    // ── Rate limiting ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limit_fail_mode_rejects_overflow() {
        let policy = Arc::new(
            SecurityPolicy::new(SecurityConfig {
                max_ops_per_minute: Some(2),
                rate_limit_behavior: RateLimitBehavior::Fail,
                sandbox_block: vec![],
                blocked_patterns: vec![],
                confirmation_levels: vec![],
                ..Default::default()
            })
            .unwrap(),
        );
        let mut registry = ToolRegistry::new(policy, RegistryConfig::default());
        registry.register(Arc::new(echo_provider("builtin"))).unwrap();

        let args = json!({"message": "x"});
        for _ in 0..2 {
            let ok = registry
                .dispatch(&call("c", "echo", args.clone()), None, CancelToken::new())
                .await;
            assert!(ok.success);
        }
        let over = registry
            .dispatch(&call("c", "echo", args), None, CancelToken::new())
            .await;
        assert!(over.is_error);
        assert!(over.text.contains("rate limited"));
    }

    // ── Parallel dispatch ────────────────────────────────────────────────────

    #[tokio::test]
    async fn dispatch_all_preserves_positional_order() {
        // "a" finishes after "b"; the result order must still be a, b.
        let provider = InProcessProvider::new("builtin").with_tool(Arc::new(FnTool::new(
            "read_file",
            "Read a file",
            json!({
                "type": "object",
                "properties": {"delay_ms": {"type": "integer"}, "tag": {"type": "string"}}
            }),
            PermissionLevel::Read,
            |args, _cancel| async move {
                let delay = args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let tag = args.get("tag").and_then(|v| v.as_str()).unwrap_or("");
                Ok(ToolResult::ok(tag.to_string()))
            },
        )));
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(provider)).unwrap();

        let calls = vec![
            call("a", "read_file", json!({"delay_ms": 80, "tag": "slow"})),
            call("b", "read_file", json!({"delay_ms": 1, "tag": "fast"})),
        ];
        let results = registry.dispatch_all(&calls, true, CancelToken::new()).await;
        assert_eq!(results[0].0, "a");
        assert_eq!(results[0].1.text, "slow");
        assert_eq!(results[1].0, "b");
        assert_eq!(results[1].1.text, "fast");
    }

    #[tokio::test]
    async fn dispatch_all_sibling_failure_does_not_cancel_others() {
        let registry = registry_with_echo();
        let calls = vec![
            call("a", "missing_tool", json!({})),
            call("b", "echo", json!({"message": "still ran"})),
        ];
        let results = registry.dispatch_all(&calls, true, CancelToken::new()).await;
        assert!(results[0].1.is_error);
        assert!(results[1].1.success);
        assert_eq!(results[1].1.text, "still ran");
    }

    #[tokio::test]
    async fn dispatch_all_concurrency_is_capped() {
        // Four 40 ms tools with a cap of 2 cannot finish in under ~80 ms.
        let provider = InProcessProvider::new("builtin").with_tool(Arc::new(FnTool::new(
            "napper",
            "Sleep briefly",
            json!({"type": "object"}),
            PermissionLevel::Read,
            |_args, _cancel| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(ToolResult::ok("ok"))
            },
        )));
        let mut registry = ToolRegistry::new(
            open_policy(),
            RegistryConfig {
                max_parallel_tools: 2,
                ..Default::default()
            },
        );
        registry.register(Arc::new(provider)).unwrap();

        let calls: Vec<ToolCall> = (0..4)
            .map(|i| call(&format!("c{i}"), "napper", json!({})))
            .collect();
        let started = std::time::Instant::now();
        let results = registry.dispatch_all(&calls, true, CancelToken::new()).await;
        assert_eq!(results.len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    // ── Events ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn dispatch_emits_start_and_finish_events() {
        use crate::event_bus::BroadcastBus;

        let bus = Arc::new(BroadcastBus::new());
        let mut rx = bus.subscribe();
        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default())
            .with_event_bus(bus.clone());
        registry.register(Arc::new(echo_provider("builtin"))).unwrap();

        registry
            .dispatch(
                &call("c1", "echo", json!({"message": "hi"})),
                None,
                CancelToken::new(),
            )
            .await;

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ToolStarted { .. }));
        match rx.recv().await.unwrap() {
            EngineEvent::ToolFinished { success, .. } => assert!(success),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
