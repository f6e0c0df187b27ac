pub mod config;
pub mod error;
pub mod events;
pub mod session;

pub use config::Config;
pub use error::{ChatError, Result};
pub use events::{EventBus, Signal, StreamEvent};
pub use session::{
    HistoryResponse, Message, ModelInfo, PullProgress, Role, SendResponse, Session,
    ToolInvocation,
};
