use tokio::sync::{broadcast, watch};

use super::http::ChatClient;
use super::sessions::SessionStore;
use super::stream::{StreamState, StreamingClient, TurnOutcome, TurnSnapshot};
use crate::core::events::drain;
use crate::core::{ChatError, Config, EventBus, Message, Result, Session, Signal};
use crate::timeline::{self, TimelineEntry};

/// Rounds of signal delivery before `dispatch` gives up on settling.
const MAX_DISPATCH_ROUNDS: usize = 16;

/// Session and turn state shared with the view. The turn half is a
/// read-only snapshot owned by the `StreamingClient`.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub session_id: Option<String>,
    turn: watch::Receiver<TurnSnapshot>,
}

impl ConversationContext {
    pub fn new(turn: watch::Receiver<TurnSnapshot>) -> Self {
        Self {
            session_id: None,
            turn,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.turn.borrow().in_progress
    }

    pub fn partial(&self) -> String {
        self.turn.borrow().partial.clone()
    }
}

/// The rendered timeline of the active session.
#[derive(Debug)]
pub struct TimelineView {
    client: ChatClient,
    signals: broadcast::Receiver<Signal>,
    context: ConversationContext,
    entries: Vec<TimelineEntry>,
    /// Local failure notices the server never persists; they survive a
    /// history reload of the same session.
    notices: Vec<Message>,
}

impl TimelineView {
    pub fn new(client: ChatClient, bus: &EventBus, turn: watch::Receiver<TurnSnapshot>) -> Self {
        Self {
            client,
            signals: bus.subscribe(),
            context: ConversationContext::new(turn),
            entries: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn push(&mut self, message: Message) {
        let index = self.entries.len();
        self.entries.push(TimelineEntry::from_message(message, index));
    }

    pub fn push_notice(&mut self, message: Message) {
        self.notices.push(message.clone());
        self.push(message);
    }

    /// Point the view at `session_id`. Switching away from another session
    /// drops that session's entries and notices.
    fn activate(&mut self, session_id: &str) {
        if let Some(current) = self.context.session_id.as_deref() {
            if current != session_id {
                tracing::debug!("Timeline switching from {} to {}", current, session_id);
                self.entries.clear();
                self.notices.clear();
            }
        }
        self.context.session_id = Some(session_id.to_string());
    }

    fn clear(&mut self) {
        self.context.session_id = None;
        self.entries.clear();
        self.notices.clear();
    }

    /// Rebuild from the persisted history of `session_id`. On failure the
    /// current entries stay and a notice is added.
    pub async fn load(&mut self, session_id: &str) {
        if self.context.session_id.as_deref() != Some(session_id) {
            self.notices.clear();
            self.entries.clear();
        }
        self.context.session_id = Some(session_id.to_string());

        match self.client.history(session_id).await {
            Ok(history) => {
                let mut entries = timeline::build(&history.history, &history.tool_calls);
                let base = entries.len();
                entries.extend(
                    self.notices
                        .iter()
                        .cloned()
                        .enumerate()
                        .map(|(i, notice)| TimelineEntry::from_message(notice, base + i)),
                );
                // notices carry local timestamps and interleave with history
                entries.sort_by(|a, b| a.key().compare(b.key()));
                self.entries = entries;
            }
            Err(e) => {
                tracing::warn!("Failed to load history for {}: {}", session_id, e);
                self.push_notice(Message::system(format!("Failed to load history: {}", e)));
            }
        }
    }

    pub async fn pump(&mut self) -> usize {
        let signals = drain(&mut self.signals);
        for signal in &signals {
            self.on_signal(signal).await;
        }
        signals.len()
    }

    pub async fn on_signal(&mut self, signal: &Signal) {
        match signal {
            Signal::SessionActivated(id) => self.activate(id),
            Signal::LoadSession(id) => self.load(id).await,
            Signal::SessionCleared => self.clear(),
            Signal::NewSessionRequested | Signal::SessionsRefresh => {}
        }
    }
}

/// One chat window: the session list, the stream of the current turn and
/// the timeline, wired together only through the event bus.
#[derive(Debug)]
pub struct Conversation {
    client: ChatClient,
    bus: EventBus,
    sessions: SessionStore,
    stream: StreamingClient,
    view: TimelineView,
}

impl Conversation {
    pub fn new(client: ChatClient, config: &Config) -> Self {
        let bus = EventBus::default();
        let stream = StreamingClient::new(config.stream.idle_timeout()).with_bus(&bus);
        let view = TimelineView::new(client.clone(), &bus, stream.subscribe());
        let sessions = SessionStore::new(client.clone(), bus.clone());

        Self {
            client,
            bus,
            sessions,
            stream,
            view,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        self.view.entries()
    }

    pub fn context(&self) -> &ConversationContext {
        self.view.context()
    }

    pub fn active_session(&self) -> Option<&str> {
        self.sessions.active_session()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    /// Live partial content of the open turn.
    pub fn turn_updates(&self) -> watch::Receiver<TurnSnapshot> {
        self.stream.subscribe()
    }

    /// Deliver queued signals until no component publishes anything new.
    pub async fn dispatch(&mut self) {
        for _ in 0..MAX_DISPATCH_ROUNDS {
            let handled =
                self.sessions.pump().await + self.stream.pump() + self.view.pump().await;
            if handled == 0 {
                return;
            }
        }
        tracing::warn!("Signal dispatch did not settle after {} rounds", MAX_DISPATCH_ROUNDS);
    }

    /// Send one user message and stream the answer to its end.
    ///
    /// Blank input and a turn already in progress are rejected before any
    /// request. Every other failure ends as a system entry in the timeline
    /// and a `Failed` outcome.
    pub async fn submit(&mut self, text: &str) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::validation("Message is empty"));
        }
        if self.context().is_processing() {
            return Err(ChatError::TurnInProgress);
        }

        let prompt = Message::user(text);
        self.view.push(prompt.clone());
        let session_id = self.view.context().session_id.clone();

        let reply = match self.client.send_message(text, session_id.as_deref()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Failed to start turn: {}", e);
                let notice = Message::system(format!("Error: {}", e));
                self.view.push_notice(notice.clone());
                return Ok(TurnOutcome {
                    state: StreamState::Failed,
                    message: notice,
                    refetch_history: false,
                });
            }
        };

        self.bus.publish(Signal::SessionActivated(reply.session_id.clone()));
        self.dispatch().await;
        if session_id.as_deref().is_some_and(|id| id != reply.session_id) {
            // the server started a fresh session; the prompt belongs to it
            tracing::info!("Server moved the turn to new session {}", reply.session_id);
            self.view.push(prompt);
        }

        let outcome = self.stream.run_turn(&self.client, &reply.session_id).await;
        match outcome.state {
            StreamState::Completed => self.view.push(outcome.message.clone()),
            _ => self.view.push_notice(outcome.message.clone()),
        }

        if outcome.refetch_history {
            self.bus.publish(Signal::LoadSession(reply.session_id.clone()));
        }
        self.bus.publish(Signal::SessionsRefresh);
        self.dispatch().await;

        Ok(outcome)
    }

    pub async fn select_session(&mut self, session_id: &str) {
        self.sessions.select(session_id);
        self.dispatch().await;
    }

    pub async fn new_session(&mut self) {
        self.bus.publish(Signal::NewSessionRequested);
        self.dispatch().await;
    }

    pub async fn refresh_sessions(&mut self) -> Result<()> {
        self.sessions.refresh().await
    }

    pub fn filter_sessions(&self, query: &str) -> Vec<&Session> {
        self.sessions.filter(query)
    }

    pub async fn rename_session(&mut self, session_id: &str, title: &str) -> Result<()> {
        self.sessions.rename(session_id, title).await
    }

    pub async fn delete_session(&mut self, session_id: &str, confirmed: bool) -> Result<()> {
        let result = self.sessions.delete(session_id, confirmed).await;
        self.dispatch().await;
        result
    }
}
