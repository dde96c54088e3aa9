//! The LM router: picks a backend + model per request, executes it, falls
//! back down an ordered chain on retryable failures, and records usage
//! samples.
//!
//! The router holds backend ids and an availability flag per id; health is
//! fed in from supervisor events. It never holds a back-pointer into the
//! supervisor and never calls a backend marked unavailable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::ai::classifier::{ModelTier, TaskTier};
use crate::ai::provider::{BackendError, LlmBackend, StreamResponse};
use crate::ai::types::{CompletionRequest, LlmResponse, StreamChunk};
use crate::error::{EngineError, Result};

/// Bound on the usage ring buffer.
const USAGE_RING_CAPACITY: usize = 1024;

// ─── Registration ────────────────────────────────────────────────────────────

/// Model ids a backend offers per capability tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalog {
    pub fast: String,
    pub default: String,
    pub best: String,
    pub reasoning: String,
}

impl ModelCatalog {
    /// A catalog where every tier maps to the same model (typical for local
    /// single-model servers).
    pub fn uniform(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            fast: model.clone(),
            default: model.clone(),
            best: model.clone(),
            reasoning: model,
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Default => &self.default,
            ModelTier::Best => &self.best,
            ModelTier::Reasoning => &self.reasoning,
        }
    }
}

/// One registered backend.
pub struct BackendRegistration {
    pub id: String,
    pub backend: Arc<dyn LlmBackend>,
    pub models: ModelCatalog,
    /// Static cost ranking; lower is cheaper.
    pub cost_rank: u32,
    /// Whether this backend runs on the local machine.
    pub local: bool,
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Routing policy flags and the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterPolicy {
    /// Prefer a healthy local backend, except for complex/reasoning tasks
    /// when a higher-tier remote backend is healthy.
    pub local_first: bool,
    /// Route simple tasks to the cheapest healthy backend.
    pub cost_optimization: bool,
    /// Backend used when no preference applies.
    pub default_provider: Option<String>,
    /// Ordered fallback chain walked on retryable failures.
    pub fallback_order: Vec<String>,
    /// Maximum fallback retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            local_first: false,
            cost_optimization: false,
            default_provider: None,
            fallback_order: Vec::new(),
            max_retries: 3,
        }
    }
}

// ─── Usage ───────────────────────────────────────────────────────────────────

/// One finished request (success or terminal failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    pub provider_id: String,
    pub model: String,
    pub ok: bool,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate usage rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub total_ok: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub per_provider: HashMap<String, ProviderUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub ok: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

// ─── Route request ───────────────────────────────────────────────────────────

/// Per-request routing inputs.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub task: Option<TaskTier>,
    pub model_tier: Option<ModelTier>,
    pub preferred_provider: Option<String>,
    pub preferred_model: Option<String>,
}

impl RouteRequest {
    pub fn for_tiers(task: TaskTier, model_tier: ModelTier) -> Self {
        Self {
            task: Some(task),
            model_tier: Some(model_tier),
            ..Default::default()
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Multi-backend router with health-based fallback.
pub struct LlmRouter {
    backends: Vec<BackendRegistration>,
    policy: RouterPolicy,
    /// Availability per backend id, updated from supervisor events.
    available: RwLock<HashMap<String, bool>>,
    samples: Arc<Mutex<VecDeque<UsageSample>>>,
}

impl LlmRouter {
    pub fn new(backends: Vec<BackendRegistration>, policy: RouterPolicy) -> Self {
        let available = backends.iter().map(|b| (b.id.clone(), true)).collect();
        Self {
            backends,
            policy,
            available: RwLock::new(available),
            samples: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    // ── Health feed ──────────────────────────────────────────────────────────

    /// Mark a backend available or not. Called from the supervisor event
    /// subscription; unknown ids are ignored.
    pub fn set_available(&self, id: &str, available: bool) {
        if let Ok(mut map) = self.available.write() {
            if let Some(slot) = map.get_mut(id) {
                if *slot != available {
                    log::info!("router: backend '{id}' now {}", if available { "available" } else { "unavailable" });
                }
                *slot = available;
            }
        }
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.available
            .read()
            .ok()
            .and_then(|map| map.get(id).copied())
            .unwrap_or(false)
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// Resolve the ordered candidate list for a request: the selected backend
    /// first, then the remaining healthy fallback chain.
    fn candidates(&self, request: &RouteRequest) -> Vec<&BackendRegistration> {
        let healthy: Vec<&BackendRegistration> = self
            .backends
            .iter()
            .filter(|b| self.is_available(&b.id))
            .collect();
        if healthy.is_empty() {
            return Vec::new();
        }

        let first = self.select(request, &healthy);

        let mut ordered: Vec<&BackendRegistration> = Vec::new();
        if let Some(first) = first {
            ordered.push(first);
        }
        for id in &self.policy.fallback_order {
            if ordered.iter().any(|b| &b.id == id) {
                continue;
            }
            if let Some(b) = healthy.iter().find(|b| &b.id == id).copied() {
                ordered.push(b);
            }
        }
        // Any healthy backend not named in the chain still counts as a last
        // resort, in registration order.
        for b in healthy.iter().copied() {
            if !ordered.iter().any(|o| o.id == b.id) {
                ordered.push(b);
            }
        }
        ordered
    }

    fn select<'a>(
        &self,
        request: &RouteRequest,
        healthy: &[&'a BackendRegistration],
    ) -> Option<&'a BackendRegistration> {
        // 1. Explicit preference wins when healthy.
        if let Some(preferred) = &request.preferred_provider {
            if let Some(b) = healthy.iter().find(|b| &b.id == preferred).copied() {
                return Some(b);
            }
        }

        // 2. Local-first, unless the task wants a higher tier and a remote
        //    backend is there to provide it.
        if self.policy.local_first {
            if let Some(local) = healthy.iter().find(|b| b.local).copied() {
                let wants_remote = matches!(
                    request.task,
                    Some(TaskTier::Complex) | Some(TaskTier::Reasoning)
                );
                if wants_remote {
                    if let Some(remote) = healthy.iter().find(|b| !b.local).copied() {
                        return Some(remote);
                    }
                }
                return Some(local);
            }
        }

        // 3. Cost optimization for simple tasks: cheapest healthy backend.
        if self.policy.cost_optimization && request.task == Some(TaskTier::Simple) {
            return healthy.iter().min_by_key(|b| b.cost_rank).copied();
        }

        // 4. Configured default.
        if let Some(default) = &self.policy.default_provider {
            if let Some(b) = healthy.iter().find(|b| &b.id == default).copied() {
                return Some(b);
            }
        }

        // 5. First healthy backend in the fallback order.
        for id in &self.policy.fallback_order {
            if let Some(b) = healthy.iter().find(|b| &b.id == id).copied() {
                return Some(b);
            }
        }

        // Otherwise the first healthy registration.
        healthy.first().copied()
    }

    fn model_for<'a>(&self, registration: &'a BackendRegistration, request: &RouteRequest) -> String {
        if let Some(model) = &request.preferred_model {
            return model.clone();
        }
        let tier = request.model_tier.unwrap_or(ModelTier::Default);
        registration.models.model_for(tier).to_string()
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Execute a completion, walking the fallback chain on retryable errors.
    ///
    /// `ContextTooLong` and `BadRequest` are surfaced immediately; a provider
    /// that is down gets one failed usage sample and the next candidate gets
    /// the same messages and tool catalog.
    pub async fn complete(
        &self,
        mut base: CompletionRequest,
        route: &RouteRequest,
    ) -> Result<LlmResponse> {
        let candidates = self.candidates(route);
        if candidates.is_empty() {
            return Err(EngineError::NoProviderAvailable);
        }

        let max_attempts = (self.policy.max_retries as usize + 1).min(candidates.len());
        let mut last_err: Option<EngineError> = None;

        for registration in candidates.into_iter().take(max_attempts) {
            base.model = self.model_for(registration, route);
            let started = Instant::now();
            match registration.backend.complete(base.clone()).await {
                Ok(response) => {
                    self.record(UsageSample {
                        provider_id: registration.id.clone(),
                        model: response.model.clone(),
                        ok: true,
                        prompt_tokens: response.input_tokens,
                        completion_tokens: response.output_tokens,
                        latency_ms: response.latency_ms,
                        timestamp: Utc::now(),
                    });
                    return Ok(response);
                }
                Err(e) => {
                    self.record(UsageSample {
                        provider_id: registration.id.clone(),
                        model: base.model.clone(),
                        ok: false,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                    let retryable = e.is_retryable();
                    let mapped = map_backend_error(&registration.id, e);
                    if !retryable {
                        return Err(mapped);
                    }
                    log::warn!(
                        "router: backend '{}' failed ({mapped}), trying next in chain",
                        registration.id
                    );
                    last_err = Some(mapped);
                }
            }
        }

        Err(last_err.unwrap_or(EngineError::NoProviderAvailable))
    }

    /// Open a completion stream. Fallback happens only while acquiring the
    /// stream — once any chunk has been produced, a mid-stream failure is
    /// terminal and surfaces as the stream's error item.
    pub async fn stream(
        &self,
        mut base: CompletionRequest,
        route: &RouteRequest,
    ) -> Result<StreamResponse> {
        let candidates = self.candidates(route);
        if candidates.is_empty() {
            return Err(EngineError::NoProviderAvailable);
        }

        let max_attempts = (self.policy.max_retries as usize + 1).min(candidates.len());
        let mut last_err: Option<EngineError> = None;

        for registration in candidates.into_iter().take(max_attempts) {
            base.model = self.model_for(registration, route);
            let started = Instant::now();
            match registration.backend.stream(base.clone()).await {
                Ok(stream) => {
                    return Ok(self.wrap_stream(
                        stream,
                        registration.id.clone(),
                        base.model.clone(),
                        started,
                    ));
                }
                Err(e) => {
                    self.record(UsageSample {
                        provider_id: registration.id.clone(),
                        model: base.model.clone(),
                        ok: false,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                    let retryable = e.is_retryable();
                    let mapped = map_backend_error(&registration.id, e);
                    if !retryable {
                        return Err(mapped);
                    }
                    last_err = Some(mapped);
                }
            }
        }

        Err(last_err.unwrap_or(EngineError::NoProviderAvailable))
    }

    /// Record a terminal usage sample when the wrapped stream finishes.
    fn wrap_stream(
        &self,
        stream: StreamResponse,
        provider_id: String,
        model: String,
        started: Instant,
    ) -> StreamResponse {
        let samples = Arc::clone(&self.samples);
        let wrapped = stream.scan(false, move |finished, item| {
            if *finished {
                return std::future::ready(None);
            }
            let terminal_ok = matches!(&item, Ok(StreamChunk::Done { .. }));
            let terminal_err = item.is_err();
            if terminal_ok || terminal_err {
                *finished = true;
                let sample = UsageSample {
                    provider_id: provider_id.clone(),
                    model: model.clone(),
                    ok: terminal_ok,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    latency_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                };
                if let Ok(mut ring) = samples.lock() {
                    push_sample(&mut ring, sample);
                }
            }
            std::future::ready(Some(item))
        });
        Box::pin(wrapped)
    }

    // ── Usage accounting ─────────────────────────────────────────────────────

    fn record(&self, sample: UsageSample) {
        if let Ok(mut ring) = self.samples.lock() {
            push_sample(&mut ring, sample);
        }
    }

    /// Snapshot of the raw sample ring (oldest first).
    pub fn usage_samples(&self) -> Vec<UsageSample> {
        self.samples
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Totals and per-provider rollups over the retained ring.
    pub fn usage_summary(&self) -> UsageSummary {
        let mut summary = UsageSummary::default();
        for sample in self.usage_samples() {
            summary.total_requests += 1;
            summary.total_prompt_tokens += u64::from(sample.prompt_tokens);
            summary.total_completion_tokens += u64::from(sample.completion_tokens);
            if sample.ok {
                summary.total_ok += 1;
            }
            let entry = summary.per_provider.entry(sample.provider_id).or_default();
            entry.requests += 1;
            entry.prompt_tokens += u64::from(sample.prompt_tokens);
            entry.completion_tokens += u64::from(sample.completion_tokens);
            if sample.ok {
                entry.ok += 1;
            }
        }
        summary
    }
}

fn push_sample(ring: &mut VecDeque<UsageSample>, sample: UsageSample) {
    if ring.len() == USAGE_RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(sample);
}

fn map_backend_error(provider: &str, e: BackendError) -> EngineError {
    match e {
        BackendError::Unavailable(reason) => EngineError::ProviderUnavailable {
            provider: provider.to_string(),
            reason,
        },
        BackendError::RateLimited { retry_after_ms } => EngineError::RateLimited {
            provider: provider.to_string(),
            retry_after_ms,
        },
        BackendError::ContextTooLong => EngineError::ContextTooLong {
            provider: provider.to_string(),
        },
        BackendError::BadRequest(msg) => EngineError::BadRequest(msg),
        BackendError::Provider(reason) => EngineError::ProviderUnavailable {
            provider: provider.to_string(),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::BackendResult;
    use crate::ai::types::{FinishReason, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ── Mock backends ────────────────────────────────────────────────────────

    struct ScriptedBackend {
        name: String,
        failures: AtomicU32,
        error: fn() -> BackendError,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedBackend {
        /// Succeeds after `failures` initial errors of kind `error`.
        fn new(name: &str, failures: u32, error: fn() -> BackendError) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    name: name.to_string(),
                    failures: AtomicU32::new(failures),
                    error,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }

        fn ok(name: &str) -> (Self, Arc<AtomicU32>) {
            Self::new(name, 0, || BackendError::Provider("unused".into()))
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, request: CompletionRequest) -> BackendResult<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(LlmResponse {
                content: format!("{} says hi", self.name),
                tool_calls: vec![],
                model: request.model,
                provider_id: self.name.clone(),
                input_tokens: 10,
                output_tokens: 5,
                latency_ms: 1,
                finish_reason: FinishReason::Stop,
            })
        }

        async fn stream(&self, _request: CompletionRequest) -> BackendResult<StreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            let chunks = vec![
                Ok(StreamChunk::Text { text: "hi".into() }),
                Ok(StreamChunk::Done {
                    finish_reason: FinishReason::Stop,
                }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn healthy(&self) -> bool {
            true
        }
        fn context_limit(&self) -> usize {
            128_000
        }
        fn supports_tools(&self) -> bool {
            true
        }
        fn provider_name(&self) -> &str {
            &self.name
        }
    }

    fn registration(
        id: &str,
        backend: ScriptedBackend,
        cost_rank: u32,
        local: bool,
    ) -> BackendRegistration {
        BackendRegistration {
            id: id.to_string(),
            backend: Arc::new(backend),
            models: ModelCatalog {
                fast: format!("{id}-fast"),
                default: format!("{id}-default"),
                best: format!("{id}-best"),
                reasoning: format!("{id}-reasoning"),
            },
            cost_rank,
            local,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("placeholder", vec![Message::user("hi")])
    }

    // ── Selection ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn preferred_provider_wins_when_healthy() {
        let (a, _) = ScriptedBackend::ok("a");
        let (b, b_calls) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy::default(),
        );
        let route = RouteRequest {
            preferred_provider: Some("b".into()),
            ..Default::default()
        };
        let resp = router.complete(request(), &route).await.unwrap();
        assert_eq!(resp.provider_id, "b");
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_first_picks_local_for_simple_tasks() {
        let (local, _) = ScriptedBackend::ok("local");
        let (remote, _) = ScriptedBackend::ok("remote");
        let router = LlmRouter::new(
            vec![
                registration("remote", remote, 2, false),
                registration("local", local, 1, true),
            ],
            RouterPolicy {
                local_first: true,
                ..Default::default()
            },
        );
        let route = RouteRequest::for_tiers(TaskTier::Simple, ModelTier::Fast);
        let resp = router.complete(request(), &route).await.unwrap();
        assert_eq!(resp.provider_id, "local");
        assert_eq!(resp.model, "local-fast");
    }

    #[tokio::test]
    async fn local_first_defers_to_remote_for_reasoning() {
        let (local, _) = ScriptedBackend::ok("local");
        let (remote, _) = ScriptedBackend::ok("remote");
        let router = LlmRouter::new(
            vec![
                registration("local", local, 1, true),
                registration("remote", remote, 2, false),
            ],
            RouterPolicy {
                local_first: true,
                ..Default::default()
            },
        );
        let route = RouteRequest::for_tiers(TaskTier::Reasoning, ModelTier::Reasoning);
        let resp = router.complete(request(), &route).await.unwrap();
        assert_eq!(resp.provider_id, "remote");
    }

    #[tokio::test]
    async fn cost_optimization_picks_cheapest_for_simple() {
        let (a, _) = ScriptedBackend::ok("pricey");
        let (b, _) = ScriptedBackend::ok("cheap");
        let router = LlmRouter::new(
            vec![
                registration("pricey", a, 10, false),
                registration("cheap", b, 1, false),
            ],
            RouterPolicy {
                cost_optimization: true,
                ..Default::default()
            },
        );
        let route = RouteRequest::for_tiers(TaskTier::Simple, ModelTier::Fast);
        let resp = router.complete(request(), &route).await.unwrap();
        assert_eq!(resp.provider_id, "cheap");
    }

    #[tokio::test]
    async fn default_provider_used_without_preferences() {
        let (a, _) = ScriptedBackend::ok("a");
        let (b, _) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy {
                default_provider: Some("b".into()),
                ..Default::default()
            },
        );
        let resp = router.complete(request(), &RouteRequest::default()).await.unwrap();
        assert_eq!(resp.provider_id, "b");
    }

    #[tokio::test]
    async fn all_unavailable_returns_no_provider() {
        let (a, a_calls) = ScriptedBackend::ok("a");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false)],
            RouterPolicy::default(),
        );
        router.set_available("a", false);
        let result = router.complete(request(), &RouteRequest::default()).await;
        assert!(matches!(result, Err(EngineError::NoProviderAvailable)));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0, "no partial calls");
        assert!(router.usage_samples().is_empty(), "no partial state written");
    }

    // ── Fallback ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fallback_walks_chain_on_unavailable() {
        let (a, a_calls) = ScriptedBackend::new("a", u32::MAX, || {
            BackendError::Unavailable("down".into())
        });
        let (b, b_calls) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy {
                default_provider: Some("a".into()),
                fallback_order: vec!["a".into(), "b".into()],
                ..Default::default()
            },
        );
        let resp = router.complete(request(), &RouteRequest::default()).await.unwrap();
        assert_eq!(resp.provider_id, "b");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        // One failed sample for a, one ok sample for b.
        let samples = router.usage_samples();
        assert_eq!(samples.len(), 2);
        assert!(!samples[0].ok);
        assert_eq!(samples[0].provider_id, "a");
        assert!(samples[1].ok);
        assert_eq!(samples[1].provider_id, "b");
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let (a, _) = ScriptedBackend::new("a", u32::MAX, || {
            BackendError::BadRequest("broken".into())
        });
        let (b, b_calls) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy::default(),
        );
        let result = router.complete(request(), &RouteRequest::default()).await;
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn context_too_long_is_not_retried() {
        let (a, _) = ScriptedBackend::new("a", u32::MAX, || BackendError::ContextTooLong);
        let (b, b_calls) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy::default(),
        );
        let result = router.complete(request(), &RouteRequest::default()).await;
        assert!(matches!(result, Err(EngineError::ContextTooLong { .. })));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn max_retries_caps_the_walk() {
        let failing = |name: &str| {
            ScriptedBackend::new(name, u32::MAX, || BackendError::Unavailable("down".into()))
        };
        let (a, _) = failing("a");
        let (b, _) = failing("b");
        let (c, c_calls) = ScriptedBackend::ok("c");
        let router = LlmRouter::new(
            vec![
                registration("a", a, 1, false),
                registration("b", b, 2, false),
                registration("c", c, 3, false),
            ],
            RouterPolicy {
                fallback_order: vec!["a".into(), "b".into(), "c".into()],
                max_retries: 1,
                ..Default::default()
            },
        );
        // 1 attempt + 1 retry = 2 attempts; "c" is never reached.
        let result = router.complete(request(), &RouteRequest::default()).await;
        assert!(result.is_err());
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_fallback_before_first_chunk() {
        let (a, _) = ScriptedBackend::new("a", u32::MAX, || {
            BackendError::Unavailable("down".into())
        });
        let (b, _) = ScriptedBackend::ok("b");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false), registration("b", b, 2, false)],
            RouterPolicy {
                fallback_order: vec!["a".into(), "b".into()],
                ..Default::default()
            },
        );
        let mut stream = router
            .stream(request(), &RouteRequest::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::Text { .. }));
        // Drain; the terminal Done chunk records an ok sample.
        while stream.next().await.is_some() {}
        let summary = router.usage_summary();
        assert_eq!(summary.per_provider["b"].ok, 1);
        assert_eq!(summary.per_provider["a"].ok, 0);
    }

    // ── Usage ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn usage_summary_rolls_up_per_provider() {
        let (a, _) = ScriptedBackend::ok("a");
        let router = LlmRouter::new(
            vec![registration("a", a, 1, false)],
            RouterPolicy::default(),
        );
        for _ in 0..3 {
            router
                .complete(request(), &RouteRequest::default())
                .await
                .unwrap();
        }
        let summary = router.usage_summary();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_ok, 3);
        assert_eq!(summary.total_prompt_tokens, 30);
        assert_eq!(summary.per_provider["a"].completion_tokens, 15);
    }

    #[test]
    fn usage_ring_is_bounded() {
        let mut ring = VecDeque::new();
        for i in 0..(USAGE_RING_CAPACITY + 10) {
            push_sample(
                &mut ring,
                UsageSample {
                    provider_id: "p".into(),
                    model: format!("m{i}"),
                    ok: true,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    latency_ms: 0,
                    timestamp: Utc::now(),
                },
            );
        }
        assert_eq!(ring.len(), USAGE_RING_CAPACITY);
        assert_eq!(ring.front().map(|s| s.model.as_str()), Some("m10"));
    }
}
