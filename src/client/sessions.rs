use tokio::sync::broadcast;

use super::http::ChatClient;
use crate::core::events::drain;
use crate::core::{ChatError, EventBus, Result, Session, Signal};

/// Case-insensitive substring match on title or id. An empty query matches
/// everything.
pub fn filter_sessions<'a>(sessions: &'a [Session], query: &str) -> Vec<&'a Session> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return sessions.iter().collect();
    }

    sessions
        .iter()
        .filter(|session| {
            session.id.to_lowercase().contains(&query)
                || session
                    .title
                    .as_deref()
                    .is_some_and(|title| title.to_lowercase().contains(&query))
        })
        .collect()
}

/// Known sessions and the active-session pointer.
#[derive(Debug)]
pub struct SessionStore {
    client: ChatClient,
    bus: EventBus,
    signals: broadcast::Receiver<Signal>,
    sessions: Vec<Session>,
    active: Option<String>,
    last_error: Option<String>,
}

impl SessionStore {
    pub fn new(client: ChatClient, bus: EventBus) -> Self {
        let signals = bus.subscribe();
        Self {
            client,
            bus,
            signals,
            sessions: Vec::new(),
            active: None,
            last_error: None,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Message of the most recent failed rename, delete or refresh.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn filter(&self, query: &str) -> Vec<&Session> {
        filter_sessions(&self.sessions, query)
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
        result
    }

    /// Replace the list with the server's. On failure the previous list stays.
    pub async fn refresh(&mut self) -> Result<()> {
        match self.client.list_sessions().await {
            Ok(sessions) => {
                tracing::debug!("Session list refreshed ({} sessions)", sessions.len());
                self.sessions = sessions;
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to refresh session list: {}", e);
                self.record(Err(e))
            }
        }
    }

    /// Ask the view to show `session_id`.
    pub fn select(&self, session_id: &str) {
        self.bus.publish(Signal::LoadSession(session_id.to_string()));
    }

    pub async fn rename(&mut self, session_id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return self.record(Err(ChatError::validation("Title is required")));
        }

        let renamed = self.client.rename_session(session_id, title).await;
        self.record(renamed)?;
        tracing::info!("Renamed session {} to {:?}", session_id, title);

        if let Err(e) = self.refresh().await {
            tracing::warn!("Rename succeeded but the list could not be refreshed: {}", e);
        }
        Ok(())
    }

    /// Delete a session. `confirmed` is the caller's confirmation gate; an
    /// unconfirmed delete sends nothing.
    pub async fn delete(&mut self, session_id: &str, confirmed: bool) -> Result<()> {
        if !confirmed {
            return self.record(Err(ChatError::validation("Deletion was not confirmed")));
        }

        let deleted = self.client.delete_session(session_id).await;
        self.record(deleted)?;
        tracing::info!("Deleted session {}", session_id);

        if self.active.as_deref() == Some(session_id) {
            self.active = None;
            self.bus.publish(Signal::SessionCleared);
        }
        self.sessions.retain(|s| s.id != session_id);

        if let Err(e) = self.refresh().await {
            tracing::warn!("Delete succeeded but the list could not be refreshed: {}", e);
        }
        Ok(())
    }

    /// Handle queued bus signals. Returns how many were handled.
    pub async fn pump(&mut self) -> usize {
        let signals = drain(&mut self.signals);
        for signal in &signals {
            self.on_signal(signal).await;
        }
        signals.len()
    }

    pub async fn on_signal(&mut self, signal: &Signal) {
        match signal {
            Signal::SessionActivated(id) | Signal::LoadSession(id) => {
                self.active = Some(id.clone());
            }
            Signal::NewSessionRequested => {
                if self.active.take().is_some() {
                    self.bus.publish(Signal::SessionCleared);
                }
            }
            Signal::SessionCleared => self.active = None,
            Signal::SessionsRefresh => {
                // failure already logged and recorded
                let _ = self.refresh().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(id: &str, title: Option<&str>) -> Session {
        Session {
            id: id.to_string(),
            title: title.map(str::to_string),
            created_at: None,
            updated_at: None,
            message_count: None,
            is_running: false,
            persisted: true,
            model: None,
        }
    }

    async fn mount_sessions(server: &MockServer, sessions: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/chat/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessions": sessions })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_filter_matches_title_or_id_case_insensitively() {
        let sessions = vec![
            session("a1b2c3", Some("Rust Lifetimes")),
            session("ff00ee", Some("Grocery list")),
            session("RUST99", None),
        ];

        let ids = |query: &str| -> Vec<String> {
            filter_sessions(&sessions, query)
                .into_iter()
                .map(|s| s.id.clone())
                .collect()
        };

        assert_eq!(ids("rust"), vec!["a1b2c3", "RUST99"]);
        assert_eq!(ids("B2C"), vec!["a1b2c3"]);
        assert_eq!(ids("  "), vec!["a1b2c3", "ff00ee", "RUST99"]);
        assert_eq!(ids(""), vec!["a1b2c3", "ff00ee", "RUST99"]);
        assert!(ids("nothing").is_empty());
    }

    #[tokio::test]
    async fn test_delete_active_session_emits_reset() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/chat/session/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "deleted"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_sessions(&server, json!([{"session_id": "def", "title": "Other"}])).await;

        let bus = EventBus::default();
        let mut observer = bus.subscribe();
        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), bus.clone());
        store.on_signal(&Signal::SessionActivated("abc".to_string())).await;
        assert_eq!(store.active_session(), Some("abc"));

        store.delete("abc", true).await.unwrap();

        assert_eq!(store.active_session(), None);
        assert_eq!(drain(&mut observer), vec![Signal::SessionCleared]);
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.sessions()[0].id, "def");
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), EventBus::default());
        store.on_signal(&Signal::SessionActivated("abc".to_string())).await;

        assert!(store.delete("abc", false).await.unwrap_err().is_validation());
        assert_eq!(store.active_session(), Some("abc"));
        assert!(store.last_error().is_some());
    }

    #[tokio::test]
    async fn test_delete_inactive_session_keeps_active() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/chat/session/old"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        mount_sessions(&server, json!([{"session_id": "abc"}])).await;

        let bus = EventBus::default();
        let mut observer = bus.subscribe();
        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), bus.clone());
        store.on_signal(&Signal::SessionActivated("abc".to_string())).await;

        store.delete("old", true).await.unwrap();
        assert_eq!(store.active_session(), Some("abc"));
        assert!(drain(&mut observer).is_empty());
    }

    #[tokio::test]
    async fn test_rename_persists_then_refreshes() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/chat/session/abc"))
            .and(body_json(json!({"title": "Trip plans"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "renamed"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_sessions(&server, json!([{"session_id": "abc", "title": "Trip plans"}])).await;

        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), EventBus::default());
        store.rename("abc", "  Trip plans ").await.unwrap();
        assert_eq!(store.get("abc").unwrap().display_title(), "Trip plans");
        assert_eq!(store.last_error(), None);
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_state_untouched() {
        let server = MockServer::start().await;
        mount_sessions(&server, json!([{"session_id": "abc", "title": "Before"}])).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Session not found"})))
            .mount(&server)
            .await;

        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), EventBus::default());
        store.refresh().await.unwrap();

        assert!(store.rename("abc", "After").await.is_err());
        assert_eq!(store.get("abc").unwrap().display_title(), "Before");
        assert_eq!(store.last_error(), Some("Server returned 404: Session not found"));

        assert!(store.rename("abc", "   ").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_new_session_request_clears_active() {
        let server = MockServer::start().await;
        let bus = EventBus::default();
        let mut observer = bus.subscribe();
        let mut store = SessionStore::new(ChatClient::new(&server.uri()).unwrap(), bus.clone());

        bus.publish(Signal::LoadSession("abc".to_string()));
        store.pump().await;
        assert_eq!(store.active_session(), Some("abc"));

        bus.publish(Signal::NewSessionRequested);
        store.pump().await;
        assert_eq!(store.active_session(), None);
        assert_eq!(
            drain(&mut observer),
            vec![
                Signal::LoadSession("abc".to_string()),
                Signal::NewSessionRequested,
                Signal::SessionCleared
            ]
        );
    }
}
