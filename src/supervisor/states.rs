//! Provider lifecycle states and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a tool provider is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Handler table in this process.
    Inproc,
    /// Subprocess speaking JSON-RPC over stdio.
    External,
}

/// Lifecycle state of a supervised provider.
///
/// ```text
/// new → starting → ready ⇄ degraded → failed → (restart) → starting
///                                        ↘ stopped
/// ready/degraded/failed → stopping → stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    New,
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopping,
    Stopped,
}

impl ProviderState {
    /// Whether the state machine permits this transition.
    pub fn can_transition_to(self, next: ProviderState) -> bool {
        use ProviderState::*;
        matches!(
            (self, next),
            (New, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Ready, Degraded)
                | (Degraded, Ready)
                | (Degraded, Failed)
                | (Failed, Starting)
                | (Failed, Stopped)
                | (Ready, Stopping)
                | (Degraded, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether the router may send work to a provider in this state.
    pub fn is_selectable(self) -> bool {
        matches!(self, ProviderState::Ready | ProviderState::Degraded)
    }
}

/// Supervisor-owned bookkeeping for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub kind: ProviderKind,
    pub state: ProviderState,
    pub last_health_ok_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
}

impl ProviderRecord {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: ProviderState::New,
            last_health_ok_at: None,
            consecutive_failures: 0,
            restart_attempts: 0,
        }
    }
}

/// Supervisor timing and restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bound on each provider's `start` during startup.
    pub startup_timeout_ms: u64,
    /// Steady-state health check period.
    pub health_interval_ms: u64,
    /// Bound on a single health probe.
    pub health_timeout_ms: u64,
    /// Consecutive misses before `degraded` becomes `failed`.
    pub failure_threshold: u32,
    /// Restart backoff: first delay, growth factor, and cap.
    pub restart_base_ms: u64,
    pub restart_factor: u32,
    pub restart_cap_ms: u64,
    pub max_restart_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            health_interval_ms: 30_000,
            health_timeout_ms: 5_000,
            failure_threshold: 3,
            restart_base_ms: 1_000,
            restart_factor: 2,
            restart_cap_ms: 60_000,
            max_restart_attempts: 5,
        }
    }
}

impl SupervisorConfig {
    /// Backoff delay before restart attempt `attempt` (0-based).
    pub fn restart_delay_ms(&self, attempt: u32) -> u64 {
        let factor = u64::from(self.restart_factor).saturating_pow(attempt);
        self.restart_base_ms
            .saturating_mul(factor)
            .min(self.restart_cap_ms)
    }
}
