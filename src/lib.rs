// Agent Chat Library
// Conversation client for a remote autonomous-agent service

pub mod cli;
pub mod client;
pub mod core;
pub mod timeline;

// Re-export commonly used types
pub use client::{ChatClient, Conversation, StreamingClient};
pub use core::{ChatError, Config, EventBus, Message, Session, Signal, ToolInvocation};
pub use timeline::TimelineEntry;

// Error handling for the binary and command handlers
pub use anyhow::{Error, Result};
