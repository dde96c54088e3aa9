//! Engine-wide event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Observability events (tool start/finish) and supervisor state transitions
//! flow through here. Publishing never blocks; a bus with no subscribers
//! simply drops events, and a lagging subscriber observes
//! `RecvError::Lagged`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::supervisor::states::ProviderState;

/// How many events a subscriber may fall behind before it starts lagging.
/// Tool and lifecycle events are low-rate, so a few hundred is generous.
const EVENT_BUFFER: usize = 256;

/// All events that flow through the engine bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A user submission entered the dispatch loop. Clients capture
    /// `submission_id` here to correlate later events and cancellation.
    DispatchStarted { submission_id: String },
    /// A user submission finished with the given number of LM turns.
    DispatchCompleted { submission_id: String, turns: usize },
    /// A tool dispatch passed the policy gate and is about to execute.
    ToolStarted { tool_name: String, args: Value },
    /// A tool dispatch finished (successfully or not).
    ToolFinished {
        tool_name: String,
        success: bool,
        summary: String,
    },
    /// A supervised provider changed lifecycle state. The router consumes
    /// these to keep its availability map current.
    ProviderStateChanged {
        provider_id: String,
        from: ProviderState,
        to: ProviderState,
    },
    /// An external provider crashed with pending requests in flight.
    ProviderCrashed {
        provider_id: String,
        pending_failed: usize,
    },
}

/// Publish/subscribe seam so hosts can substitute their own fan-out.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: EngineEvent) -> Result<(), String>;
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// [`EventBus`] implementation over a broadcast channel.
pub struct BroadcastBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastBus {
    /// Bus sized for the engine's normal event rate ([`EVENT_BUFFER`]).
    pub fn new() -> Self {
        Self::with_buffer(EVENT_BUFFER)
    }

    /// Bus whose subscribers may lag by up to `events` before losing any.
    pub fn with_buffer(events: usize) -> Self {
        let (sender, _) = broadcast::channel(events);
        Self { sender }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: EngineEvent) -> Result<(), String> {
        // `send` errors only when there are no receivers — that is fine.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
