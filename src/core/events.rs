use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Payload of one push-channel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "chunk")]
    Chunk {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<u64>,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(default)]
        content: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        content: String,
    },
    #[serde(rename = "keepalive")]
    Keepalive,
}

/// Notifications exchanged between the session list, the stream and the
/// timeline view. None of them call each other directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    SessionActivated(String),
    SessionCleared,
    SessionsRefresh,
    NewSessionRequested,
    LoadSession(String),
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::SessionActivated(_) => "session-activated",
            Signal::SessionCleared => "session-cleared",
            Signal::SessionsRefresh => "sessions-refresh",
            Signal::NewSessionRequested => "new-session-requested",
            Signal::LoadSession(_) => "load-session",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Signal>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers will see the signal.
    pub fn publish(&self, signal: Signal) -> usize {
        tracing::debug!("Publishing {} signal", signal.name());
        match self.tx.send(signal) {
            Ok(count) => count,
            Err(broadcast::error::SendError(signal)) => {
                tracing::debug!("No subscribers for {} signal", signal.name());
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Drain every signal queued for `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
    let mut signals = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(signal) => signals.push(signal),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!("Signal subscriber lagged, {} signals dropped", skipped);
            }
            Err(_) => return signals,
        }
    }
}
