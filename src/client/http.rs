use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::sse::{self, FrameStream};
use crate::core::session::{
    ErrorBody, ModelListResponse, PullRequest, RenameRequest, SendRequest, SessionListResponse,
};
use crate::core::{
    ChatError, Config, HistoryResponse, ModelInfo, PullProgress, Result, SendResponse, Session,
};

/// HTTP client for the agent service's chat API.
#[derive(Debug, Clone)]
pub struct ChatClient {
    base_url: String,
    api_prefix: String,
    request_timeout: Duration,
    client: Client,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, "/api", Duration::from_secs(30))
    }

    pub fn with_options(base_url: &str, api_prefix: &str, request_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ChatError::validation(format!("invalid server url '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ChatError::validation(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        // No client-wide timeout: it would also cut off the push channel.
        let client = Client::builder().build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_prefix: format!("/{}", api_prefix.trim_matches('/')),
            request_timeout,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_options(
            &config.server.base_url,
            &config.server.api_prefix,
            config.server.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        if self.api_prefix == "/" {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}{}", self.base_url, self.api_prefix, path)
        }
    }

    /// Check if server is running by trying to connect
    pub async fn is_server_running(&self) -> bool {
        self.client
            .get(self.endpoint("/chat/sessions"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    /// Start a turn. Without a session id the server assigns a new one.
    pub async fn send_message(&self, message: &str, session_id: Option<&str>) -> Result<SendResponse> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::validation("Message is empty"));
        }

        let url = self.endpoint("/chat/send");
        tracing::debug!("POST {} (session: {:?})", url, session_id);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&SendRequest { message, session_id })
            .send()
            .await?;

        let reply: SendResponse = decode(check(response, "send message").await?).await?;
        tracing::debug!("Turn accepted for session {}", reply.session_id);
        Ok(reply)
    }

    /// Open the push channel for a session's current turn.
    pub async fn open_stream(&self, session_id: &str) -> Result<FrameStream> {
        let url = self.endpoint(&format!("/chat/stream/{}", session_id));
        tracing::debug!("GET {} (event stream)", url);

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let response = check(response, "open stream").await?;
        Ok(sse::frames(response.bytes_stream()))
    }

    pub async fn history(&self, session_id: &str) -> Result<HistoryResponse> {
        let url = self.endpoint(&format!("/chat/history/{}", session_id));
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        decode(check(response, "load history").await?).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let response = self
            .client
            .get(self.endpoint("/chat/sessions"))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let list: SessionListResponse = decode(check(response, "list sessions").await?).await?;
        Ok(list.sessions)
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::validation("Title is required"));
        }

        let response = self
            .client
            .patch(self.endpoint(&format!("/chat/session/{}", session_id)))
            .timeout(self.request_timeout)
            .json(&RenameRequest { title })
            .send()
            .await?;

        check(response, "rename session").await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&format!("/chat/session/{}", session_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;

        check(response, "delete session").await?;
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.endpoint("/models"))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let list: ModelListResponse = decode(check(response, "list models").await?).await?;
        Ok(list.models)
    }

    pub async fn pull_model(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::validation("Model name is required"));
        }

        let response = self
            .client
            .post(self.endpoint("/models/pull"))
            .timeout(self.request_timeout)
            .json(&PullRequest { name })
            .send()
            .await?;

        check(response, "start model pull").await?;
        Ok(())
    }

    pub async fn pull_status(&self, name: &str) -> Result<PullProgress> {
        let response = self
            .client
            .get(self.endpoint("/models/pull/status"))
            .query(&[("name", name)])
            .timeout(self.request_timeout)
            .send()
            .await?;

        decode(check(response, "poll model pull").await?).await
    }
}

/// Turn a non-success status into `ChatError::Server`, preferring the
/// server's own `{"error": ...}` message.
async fn check(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    tracing::debug!("{} response status: {}", action, status);
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body.trim().to_string()
            }
        });

    tracing::warn!("Failed to {}: {} - {}", action, status, message);
    Err(ChatError::Server {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}
