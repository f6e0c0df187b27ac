use thiserror::Error;

/// Failures surfaced by the conversation client.
///
/// Turn-level failures (`Network`, `TransportDrop`) are turned into a single
/// system entry in the timeline by the caller; `Protocol` errors on one push
/// event are logged and skipped; `Validation` errors stop an action before any
/// request is sent.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The request failed before a usable response arrived
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// A response body could not be decoded
    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// A push-channel payload was not JSON or had no recognised `type`
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The push channel closed before a terminal event
    #[error("Connection lost: {0}")]
    TransportDrop(String),

    /// Blank or otherwise invalid user input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A new turn was submitted while another one is still streaming
    #[error("A response is already in progress")]
    TurnInProgress,

    /// A bounded polling loop ran out of attempts
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    /// True for failures that happen before anything reaches the server.
    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
