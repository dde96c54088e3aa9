//! Provider lifecycle supervisor.
//!
//! Owns the [`ProviderRecord`]s: starts providers under a startup timeout,
//! health-checks them periodically, and restarts failed external providers
//! with exponential backoff. Every state transition is published on the
//! engine bus; the router subscribes and holds only ids, which breaks the
//! router ↔ supervisor ↔ provider cycle.

pub mod states;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::ai::provider::LlmBackend;
use crate::ai::router::LlmRouter;
use crate::error::Result;
use crate::event_bus::{EngineEvent, EventBus};
pub use states::{ProviderKind, ProviderRecord, ProviderState, SupervisorConfig};

// ─── Managed ─────────────────────────────────────────────────────────────────

/// A provider the supervisor can drive through its lifecycle.
#[async_trait]
pub trait Managed: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ProviderKind;

    /// Whether a `failed` provider should be restarted automatically.
    fn auto_restart(&self) -> bool {
        false
    }

    /// Bring the provider up (spawn, handshake, discovery).
    async fn start(&self) -> Result<()>;

    /// Cheap liveness probe; bounded by the supervisor's health timeout.
    async fn health_check(&self) -> bool;

    /// Tear the provider down.
    async fn stop(&self);
}

/// Adapter supervising an LM backend's health alongside tool providers.
///
/// Backends have no process to start or stop; only the probe matters.
pub struct BackendHealthAdapter {
    id: String,
    backend: Arc<dyn LlmBackend>,
}

impl BackendHealthAdapter {
    pub fn new(id: impl Into<String>, backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }
}

#[async_trait]
impl Managed for BackendHealthAdapter {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> ProviderKind {
        ProviderKind::Inproc
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> bool {
        self.backend.healthy().await
    }
    async fn stop(&self) {}
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Central lifecycle controller.
pub struct Supervisor {
    config: SupervisorConfig,
    providers: Vec<Arc<dyn Managed>>,
    records: RwLock<HashMap<String, ProviderRecord>>,
    bus: Arc<dyn EventBus>,
    running: RwLock<bool>,
    monitor_task: RwLock<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        providers: Vec<Arc<dyn Managed>>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let records = providers
            .iter()
            .map(|p| {
                (
                    p.id().to_string(),
                    ProviderRecord::new(p.id(), p.kind()),
                )
            })
            .collect();
        Self {
            config,
            providers,
            records: RwLock::new(records),
            bus,
            running: RwLock::new(false),
            monitor_task: RwLock::new(None),
        }
    }

    /// Current record for one provider.
    pub async fn record(&self, id: &str) -> Option<ProviderRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Snapshot of all records.
    pub async fn records(&self) -> Vec<ProviderRecord> {
        self.records.read().await.values().cloned().collect()
    }

    // ── Startup / shutdown ───────────────────────────────────────────────────

    /// Start every provider, each bounded by the startup timeout. A provider
    /// that fails to start lands in `failed`; the others are unaffected.
    pub async fn start_all(self: &Arc<Self>) {
        for provider in &self.providers {
            let id = provider.id().to_string();
            self.transition(&id, ProviderState::Starting).await;
            let started = tokio::time::timeout(
                Duration::from_millis(self.config.startup_timeout_ms),
                provider.start(),
            )
            .await;
            match started {
                Ok(Ok(())) => {
                    self.mark_healthy(&id).await;
                    self.transition(&id, ProviderState::Ready).await;
                }
                Ok(Err(e)) => {
                    log::warn!("supervisor: provider '{id}' failed to start: {e}");
                    self.transition(&id, ProviderState::Failed).await;
                }
                Err(_) => {
                    log::warn!(
                        "supervisor: provider '{id}' did not start within {} ms",
                        self.config.startup_timeout_ms
                    );
                    self.transition(&id, ProviderState::Failed).await;
                }
            }
        }
    }

    /// Orderly shutdown of every provider.
    pub async fn shutdown_all(&self) {
        self.stop_monitoring().await;
        for provider in &self.providers {
            let id = provider.id().to_string();
            self.transition(&id, ProviderState::Stopping).await;
            provider.stop().await;
            self.transition(&id, ProviderState::Stopped).await;
        }
    }

    // ── Monitoring ───────────────────────────────────────────────────────────

    /// Start the periodic health loop. Also consumes crash events so an
    /// external provider that dies between checks is handled immediately.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let supervisor = Arc::clone(self);
        let mut events = self.bus.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                supervisor.config.health_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if !*supervisor.running.read().await {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        supervisor.check_once().await;
                    }
                    event = events.recv() => {
                        if let Ok(EngineEvent::ProviderCrashed { provider_id, .. }) = event {
                            supervisor.handle_crash(&provider_id).await;
                        }
                    }
                }
            }
        });
        *self.monitor_task.write().await = Some(handle);
    }

    pub async fn stop_monitoring(&self) {
        *self.running.write().await = false;
        if let Some(handle) = self.monitor_task.write().await.take() {
            handle.abort();
        }
    }

    /// One health sweep over every selectable provider.
    pub async fn check_once(self: &Arc<Self>) {
        for provider in &self.providers {
            let id = provider.id().to_string();
            let state = match self.record(&id).await {
                Some(r) => r.state,
                None => continue,
            };
            if !state.is_selectable() {
                continue;
            }

            let healthy = tokio::time::timeout(
                Duration::from_millis(self.config.health_timeout_ms),
                provider.health_check(),
            )
            .await
            .unwrap_or(false);

            if healthy {
                self.mark_healthy(&id).await;
                if state == ProviderState::Degraded {
                    self.transition(&id, ProviderState::Ready).await;
                }
                continue;
            }

            let failures = self.bump_failures(&id).await;
            log::warn!("supervisor: provider '{id}' missed health check ({failures} consecutive)");
            if failures >= self.config.failure_threshold {
                self.transition(&id, ProviderState::Failed).await;
                self.maybe_restart(&id);
            } else if state == ProviderState::Ready {
                self.transition(&id, ProviderState::Degraded).await;
            }
        }
    }

    /// Immediate failure path for a crash report.
    async fn handle_crash(self: &Arc<Self>, id: &str) {
        let Some(record) = self.record(id).await else {
            return;
        };
        if record.state == ProviderState::Failed {
            return;
        }
        // A crash may arrive from `ready`; route through `degraded` so the
        // transition stays legal.
        if record.state == ProviderState::Ready {
            self.transition(id, ProviderState::Degraded).await;
        }
        self.transition(id, ProviderState::Failed).await;
        self.maybe_restart(id);
    }

    // ── Restart ──────────────────────────────────────────────────────────────

    /// Kick off the backoff-restart task when the provider opted in and has
    /// attempts left.
    fn maybe_restart(self: &Arc<Self>, id: &str) {
        let Some(provider) = self.providers.iter().find(|p| p.id() == id).cloned() else {
            return;
        };
        if !provider.auto_restart() {
            return;
        }
        let supervisor = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            supervisor.restart_with_backoff(&id, provider).await;
        });
    }

    async fn restart_with_backoff(self: &Arc<Self>, id: &str, provider: Arc<dyn Managed>) {
        loop {
            let attempt = match self.record(id).await {
                Some(r) if r.state == ProviderState::Failed => r.restart_attempts,
                _ => return, // restarted elsewhere or shutting down
            };
            if attempt >= self.config.max_restart_attempts {
                log::warn!(
                    "supervisor: provider '{id}' exhausted {attempt} restart attempt(s), leaving failed"
                );
                return;
            }

            let delay = self.config.restart_delay_ms(attempt);
            log::info!(
                "supervisor: restarting provider '{id}' in {delay} ms (attempt {})",
                attempt + 1
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;

            {
                let mut records = self.records.write().await;
                if let Some(record) = records.get_mut(id) {
                    record.restart_attempts += 1;
                }
            }
            self.transition(id, ProviderState::Starting).await;

            provider.stop().await;
            let started = tokio::time::timeout(
                Duration::from_millis(self.config.startup_timeout_ms),
                provider.start(),
            )
            .await;
            match started {
                Ok(Ok(())) => {
                    self.mark_healthy(id).await;
                    {
                        let mut records = self.records.write().await;
                        if let Some(record) = records.get_mut(id) {
                            record.restart_attempts = 0;
                        }
                    }
                    self.transition(id, ProviderState::Ready).await;
                    return;
                }
                Ok(Err(e)) => {
                    log::warn!("supervisor: restart of '{id}' failed: {e}");
                    self.transition(id, ProviderState::Failed).await;
                }
                Err(_) => {
                    log::warn!("supervisor: restart of '{id}' timed out");
                    self.transition(id, ProviderState::Failed).await;
                }
            }
        }
    }

    // ── Record bookkeeping ───────────────────────────────────────────────────

    async fn mark_healthy(&self, id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.last_health_ok_at = Some(Utc::now());
            record.consecutive_failures = 0;
        }
    }

    async fn bump_failures(&self, id: &str) -> u32 {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) => {
                record.consecutive_failures += 1;
                record.consecutive_failures
            }
            None => 0,
        }
    }

    /// Apply a state transition when the state machine permits it, and
    /// publish the change.
    async fn transition(&self, id: &str, to: ProviderState) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return;
        };
        let from = record.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            log::warn!("supervisor: ignoring illegal transition {from:?} → {to:?} for '{id}'");
            return;
        }
        record.state = to;
        drop(records);
        let _ = self.bus.publish(EngineEvent::ProviderStateChanged {
            provider_id: id.to_string(),
            from,
            to,
        });
    }
}

// ─── Router feed ─────────────────────────────────────────────────────────────

/// Keep a router's availability map synchronized with supervisor state
/// transitions. The router learns ids and flags only; it never holds the
/// supervisor or the providers.
pub fn feed_router(router: Arc<LlmRouter>, bus: &dyn EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::ProviderStateChanged { provider_id, to, .. }) => {
                    router.set_available(&provider_id, to.is_selectable());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
