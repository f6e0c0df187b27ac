pub mod conversation;
pub mod http;
pub mod pull;
pub mod sessions;
pub mod sse;
pub mod stream;

pub use conversation::{Conversation, ConversationContext, TimelineView};
pub use http::ChatClient;
pub use pull::PullMonitor;
pub use sessions::{filter_sessions, SessionStore};
pub use stream::{StreamState, StreamingClient, TurnOutcome, TurnSnapshot};
