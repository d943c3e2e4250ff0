use tokio::sync::broadcast;
use tracing::trace;

use warden_protocol::{ClientId, OutputChunk, Reply};

const EVENT_CAPACITY: usize = 256;

/// Something an agent did, as seen by the master.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Registered {
        username: String,
        client_id: ClientId,
    },
    Disconnected {
        username: String,
        client_id: ClientId,
    },
    Output {
        username: String,
        chunk: OutputChunk,
    },
    Response {
        username: String,
        reply: Reply,
    },
}

/// Fan-out of [`AgentEvent`]s to any number of subscribers.
///
/// Slow subscribers lag and miss events rather than holding up agents.
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: AgentEvent) {
        // No receivers is normal when nothing is watching.
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
