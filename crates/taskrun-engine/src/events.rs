//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so observers
//! can follow a run without coupling to the executor internals.

use serde::{Deserialize, Serialize};

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        target: String,
        arguments: Vec<String>,
    },
    RecipeStarted {
        recipe: String,
        arguments: Vec<String>,
    },
    LineStarted {
        recipe: String,
        line: usize,
        command: String,
    },
    RecipeCompleted {
        recipe: String,
        duration_ms: u64,
    },
    /// The same recipe with the same arguments was already planned.
    RecipeSkipped {
        recipe: String,
        arguments: Vec<String>,
    },
    RunFailed {
        target: String,
        error: String,
    },
    RunCompleted {
        target: String,
        invocations: usize,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped if nobody listens.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
