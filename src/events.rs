//! Engine event notifications
//!
//! One broadcast channel per engine, shared by every plugin context and
//! the clarification coordinator. Emitting never blocks and never fails;
//! events sent while nobody is subscribed are dropped.

use crate::clarification::ClarificationRequest;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

/// How a clarification request left the pending slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationOutcome {
    Answered,
    TimedOut,
    Cancelled,
    /// The waiting side went away before any resolution
    Abandoned,
}

/// Notification published on the engine's event bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PluginActivated {
        name: String,
        version: String,
    },
    PluginFailed {
        name: String,
        reason: String,
    },
    PluginSkipped {
        name: String,
        reason: String,
    },
    PluginDestroyed {
        name: String,
    },
    ClarificationRequested {
        request: ClarificationRequest,
    },
    ClarificationSettled {
        id: String,
        outcome: ClarificationOutcome,
    },
    /// Free-form event emitted by a plugin
    Custom {
        source: String,
        topic: String,
        payload: serde_json::Value,
    },
}

/// Cloneable handle to the shared event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning how many subscribers saw it
    pub fn emit(&self, event: EngineEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!("No subscribers for event {:?}", event);
                0
            }
        }
    }
}
