//! Push-channel state machine for one assistant turn.
//!
//! `Idle -> Connecting -> Streaming -> Completed | Failed`
//!
//! Transitions are plain methods (`open`, `mark_connected`, `handle_frame`,
//! `handle_disconnect`, `fail`) so they can be driven without a transport;
//! `drive` and `run_turn` feed them from a real frame stream.

use futures::Stream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use super::http::ChatClient;
use crate::core::events::drain;
use crate::core::{ChatError, EventBus, Message, Signal, StreamEvent};

pub const CONNECTION_LOST: &str = "Connection lost before the response finished.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
}

impl StreamState {
    /// A turn is open and may still receive events.
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Streaming)
    }
}

/// Read-only view of the turn published to other components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnSnapshot {
    pub in_progress: bool,
    pub session_id: Option<String>,
    /// Everything streamed so far for the open turn.
    pub partial: String,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub state: StreamState,
    pub message: Message,
    /// The persisted history should be re-fetched for this session.
    pub refetch_history: bool,
}

#[derive(Debug)]
pub struct StreamingClient {
    state: StreamState,
    session_id: Option<String>,
    accumulator: String,
    snapshot: watch::Sender<TurnSnapshot>,
    signals: Option<broadcast::Receiver<Signal>>,
    idle_timeout: Duration,
}

impl StreamingClient {
    pub fn new(idle_timeout: Duration) -> Self {
        let (snapshot, _rx) = watch::channel(TurnSnapshot::default());
        Self {
            state: StreamState::Idle,
            session_id: None,
            accumulator: String::new(),
            snapshot,
            signals: None,
            idle_timeout,
        }
    }

    /// Subscribe to bus signals so a cleared session abandons the stream.
    pub fn with_bus(mut self, bus: &EventBus) -> Self {
        self.signals = Some(bus.subscribe());
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_turn_in_progress(&self) -> bool {
        self.state.is_active()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnSnapshot> {
        self.snapshot.subscribe()
    }

    fn publish(&self) {
        self.snapshot.send_replace(TurnSnapshot {
            in_progress: self.state.is_active(),
            session_id: self.session_id.clone(),
            partial: self.accumulator.clone(),
        });
    }

    /// Begin a turn for `session_id`. Any turn still open is abandoned first
    /// and its partial content discarded.
    pub fn open(&mut self, session_id: &str) {
        if self.state.is_active() {
            self.abandon();
        }
        self.state = StreamState::Idle;

        tracing::info!("Opening stream for session {}", session_id);
        self.session_id = Some(session_id.to_string());
        self.accumulator.clear();
        self.state = StreamState::Connecting;
        self.publish();
    }

    pub fn mark_connected(&mut self) {
        if self.state == StreamState::Connecting {
            self.state = StreamState::Streaming;
            tracing::debug!("Stream connected for session {:?}", self.session_id);
        }
    }

    /// Drop the open turn without producing an outcome.
    pub fn abandon(&mut self) {
        if !self.state.is_active() {
            return;
        }
        tracing::info!(
            "Abandoning stream for session {:?} ({} chars discarded)",
            self.session_id,
            self.accumulator.len()
        );
        self.state = StreamState::Idle;
        self.session_id = None;
        self.accumulator.clear();
        self.publish();
    }

    /// Apply one raw push-channel payload. Returns the outcome when the
    /// payload ends the turn.
    pub fn handle_frame(&mut self, raw: &str) -> Option<TurnOutcome> {
        if !self.state.is_active() {
            tracing::debug!("Ignoring frame outside an open turn ({:?})", self.state);
            return None;
        }

        let event = match serde_json::from_str::<StreamEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                let err = ChatError::Protocol(e.to_string());
                tracing::warn!("Skipping malformed stream event: {} ({})", err, raw);
                return None;
            }
        };

        self.mark_connected();

        match event {
            StreamEvent::Chunk { content, .. } => {
                self.accumulator.push_str(&content);
                self.publish();
                None
            }
            StreamEvent::Keepalive => None,
            StreamEvent::Done { content } => {
                let reasoning = std::mem::take(&mut self.accumulator);
                Some(self.finish(
                    StreamState::Completed,
                    Message::assistant(content, reasoning),
                    true,
                ))
            }
            StreamEvent::Error { content } => {
                tracing::error!("Agent reported an error for session {:?}: {}", self.session_id, content);
                Some(self.finish(
                    StreamState::Failed,
                    Message::system(format!("Error: {}", content)),
                    false,
                ))
            }
        }
    }

    /// The channel closed. Only an open turn produces an outcome.
    pub fn handle_disconnect(&mut self) -> Option<TurnOutcome> {
        if !self.state.is_active() {
            return None;
        }
        tracing::warn!("Stream for session {:?} closed before a terminal event", self.session_id);
        Some(self.finish(StreamState::Failed, Message::system(CONNECTION_LOST), true))
    }

    /// The channel could not be opened at all.
    pub fn fail(&mut self, err: &ChatError) -> Option<TurnOutcome> {
        if !self.state.is_active() {
            return None;
        }
        tracing::error!("Stream for session {:?} failed: {}", self.session_id, err);
        Some(self.finish(StreamState::Failed, Message::system(format!("Error: {}", err)), false))
    }

    fn finish(&mut self, state: StreamState, message: Message, refetch_history: bool) -> TurnOutcome {
        self.state = state;
        self.accumulator.clear();
        self.publish();
        tracing::info!("Turn for session {:?} ended: {:?}", self.session_id, state);
        TurnOutcome {
            state,
            message,
            refetch_history,
        }
    }

    /// Consume frames until the turn ends. Every exit path settles the turn:
    /// stream end, a transport error and an idle timeout all count as a
    /// disconnect.
    pub async fn drive<S>(&mut self, mut frames: S) -> TurnOutcome
    where
        S: Stream<Item = Result<String, ChatError>> + Unpin,
    {
        loop {
            match timeout(self.idle_timeout, frames.next()).await {
                Ok(Some(Ok(frame))) => {
                    if let Some(outcome) = self.handle_frame(&frame) {
                        return outcome;
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("Stream transport error: {}", e);
                    return self.settle_disconnect();
                }
                Ok(None) => return self.settle_disconnect(),
                Err(_) => {
                    tracing::warn!(
                        "No stream activity for {:.0}s, treating as disconnect",
                        self.idle_timeout.as_secs_f64()
                    );
                    return self.settle_disconnect();
                }
            }
        }
    }

    fn settle_disconnect(&mut self) -> TurnOutcome {
        self.handle_disconnect().unwrap_or_else(|| TurnOutcome {
            state: StreamState::Failed,
            message: Message::system(CONNECTION_LOST),
            refetch_history: false,
        })
    }

    /// Open the push channel for `session_id` and stream the turn to its end.
    pub async fn run_turn(&mut self, client: &ChatClient, session_id: &str) -> TurnOutcome {
        self.open(session_id);
        match client.open_stream(session_id).await {
            Ok(frames) => {
                self.mark_connected();
                self.drive(frames).await
            }
            Err(e) => self.fail(&e).unwrap_or_else(|| TurnOutcome {
                state: StreamState::Failed,
                message: Message::system(format!("Error: {}", e)),
                refetch_history: false,
            }),
        }
    }

    /// React to bus signals. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let Some(rx) = self.signals.as_mut() else {
            return 0;
        };
        let signals = drain(rx);
        for signal in &signals {
            self.on_signal(signal);
        }
        signals.len()
    }

    pub fn on_signal(&mut self, signal: &Signal) {
        match signal {
            Signal::SessionCleared => self.abandon(),
            Signal::LoadSession(id) if self.session_id.as_deref() != Some(id.as_str()) => {
                self.abandon()
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use futures::stream;

    fn frames(items: Vec<&str>) -> impl Stream<Item = Result<String, ChatError>> + Unpin {
        stream::iter(items.into_iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>())
    }

    fn client() -> StreamingClient {
        StreamingClient::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_done_finalizes_with_accumulated_reasoning() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("abc");
        sc.mark_connected();

        let outcome = sc
            .drive(frames(vec![
                r#"{"type":"chunk","agent_id":0,"content":"Let me "}"#,
                r#"{"type":"chunk","agent_id":0,"content":"think"}"#,
                r#"{"type":"chunk","agent_id":0,"content":"..."}"#,
                r#"{"type":"done","content":"The answer is 4."}"#,
            ]))
            .await;

        assert_eq!(outcome.state, StreamState::Completed);
        assert_eq!(outcome.message.role, Role::Assistant);
        assert_eq!(outcome.message.content, "The answer is 4.");
        assert_eq!(outcome.message.reasoning.as_deref(), Some("Let me think..."));
        assert!(outcome.refetch_history);
        assert_eq!(sc.state(), StreamState::Completed);
        assert!(!updates.borrow().in_progress);
    }

    #[test]
    fn test_partial_published_after_each_chunk() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("abc");
        assert!(updates.borrow().in_progress);

        sc.handle_frame(r#"{"type":"chunk","content":"Hel"}"#);
        assert_eq!(updates.borrow().partial, "Hel");
        assert_eq!(sc.state(), StreamState::Streaming);

        sc.handle_frame(r#"{"type":"chunk","content":"lo"}"#);
        assert_eq!(updates.borrow().partial, "Hello");
        assert_eq!(updates.borrow().session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        let mut sc = client();
        sc.open("abc");
        sc.mark_connected();

        assert!(sc.handle_frame("not json").is_none());
        assert!(sc.handle_frame(r#"{"type":"mystery","content":"?"}"#).is_none());
        assert!(sc.handle_frame(r#"{"type":"keepalive"}"#).is_none());
        assert_eq!(sc.state(), StreamState::Streaming);

        sc.handle_frame(r#"{"type":"chunk","content":"ok"}"#);
        let outcome = sc.handle_frame(r#"{"type":"done","content":"fine"}"#).unwrap();
        assert_eq!(outcome.message.reasoning.as_deref(), Some("ok"));
    }

    #[test]
    fn test_error_event_fails_without_refetch() {
        let mut sc = client();
        sc.open("abc");
        let outcome = sc
            .handle_frame(r#"{"type":"error","content":"model crashed"}"#)
            .unwrap();

        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.message.role, Role::System);
        assert_eq!(outcome.message.content, "Error: model crashed");
        assert!(!outcome.refetch_history);
        assert!(!sc.is_turn_in_progress());
    }

    #[test]
    fn test_no_chunk_applied_after_terminal_event() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("abc");
        sc.handle_frame(r#"{"type":"done","content":"bye"}"#).unwrap();

        assert!(sc.handle_frame(r#"{"type":"chunk","content":"late"}"#).is_none());
        assert!(sc.handle_disconnect().is_none());
        assert_eq!(updates.borrow().partial, "");
        assert_eq!(sc.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("abc");
        sc.mark_connected();

        let outcome = sc
            .drive(frames(vec![r#"{"type":"chunk","content":"partial"}"#]))
            .await;

        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.message.role, Role::System);
        assert_eq!(outcome.message.content, CONNECTION_LOST);
        assert!(outcome.refetch_history);
        assert!(!updates.borrow().in_progress);
        assert!(!sc.is_turn_in_progress());
    }

    #[test]
    fn test_disconnect_while_connecting() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("abc");
        assert_eq!(sc.state(), StreamState::Connecting);
        assert!(updates.borrow().in_progress);

        let outcome = sc.handle_disconnect().unwrap();
        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.message.role, Role::System);
        assert_eq!(outcome.message.content, CONNECTION_LOST);
        assert!(outcome.refetch_history);
        assert!(!updates.borrow().in_progress);

        // the turn is settled, a second close adds nothing
        assert!(sc.handle_disconnect().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_disconnect() {
        let mut sc = client();
        sc.open("abc");
        sc.mark_connected();

        let items: Vec<Result<String, ChatError>> = vec![
            Ok(r#"{"type":"chunk","content":"a"}"#.to_string()),
            Err(ChatError::TransportDrop("reset by peer".to_string())),
            Ok(r#"{"type":"done","content":"never seen"}"#.to_string()),
        ];
        let outcome = sc.drive(stream::iter(items)).await;
        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.message.content, CONNECTION_LOST);
    }

    #[tokio::test]
    async fn test_idle_channel_times_out() {
        let mut sc = StreamingClient::new(Duration::from_millis(20));
        sc.open("abc");
        sc.mark_connected();

        let outcome = sc.drive(stream::pending::<Result<String, ChatError>>()).await;
        assert_eq!(outcome.state, StreamState::Failed);
        assert!(!sc.is_turn_in_progress());
    }

    #[test]
    fn test_open_abandons_previous_turn() {
        let mut sc = client();
        let updates = sc.subscribe();
        sc.open("first");
        sc.handle_frame(r#"{"type":"chunk","content":"stale"}"#);

        sc.open("second");
        assert_eq!(sc.state(), StreamState::Connecting);
        assert_eq!(sc.session_id(), Some("second"));
        assert_eq!(updates.borrow().partial, "");

        sc.handle_frame(r#"{"type":"chunk","content":"fresh"}"#);
        let outcome = sc.handle_frame(r#"{"type":"done","content":"ok"}"#).unwrap();
        assert_eq!(outcome.message.reasoning.as_deref(), Some("fresh"));
    }

    #[test]
    fn test_session_cleared_signal_abandons() {
        let bus = EventBus::default();
        let mut sc = client().with_bus(&bus);
        sc.open("abc");

        bus.publish(Signal::SessionCleared);
        assert_eq!(sc.pump(), 1);
        assert_eq!(sc.state(), StreamState::Idle);
        assert!(!sc.is_turn_in_progress());
    }

    #[test]
    fn test_loading_same_session_keeps_stream() {
        let mut sc = client();
        sc.open("abc");
        sc.on_signal(&Signal::LoadSession("abc".to_string()));
        assert!(sc.is_turn_in_progress());
        sc.on_signal(&Signal::LoadSession("other".to_string()));
        assert!(!sc.is_turn_in_progress());
    }
}
