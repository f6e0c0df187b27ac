use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use super::parser::{
    classify_status, infer_code_language, parse_delegation, parse_memory_hits, tool_label,
    tool_subtitle, CodeLanguage, Delegation, MemoryHit, ToolStatus,
};
use crate::core::{Message, Role, ToolInvocation};

/// Prefix of keys synthesised for records without a persisted timestamp.
pub const PLACEHOLDER_PREFIX: &str = "seq-";

/// Tool whose arguments carry a `runtime` and a `code` body.
pub const CODE_EXECUTION_TOOL: &str = "code_execution";

const TOOL_ECHO_PREFIX: &str = "[Tool ";
const TOOL_ECHO_MARKER: &str = " result]";

/// Parse a persisted timestamp. Placeholder keys never parse.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with(PLACEHOLDER_PREFIX) {
        return None;
    }

    let normalized = match raw.strip_suffix(" UTC") {
        Some(stamp) => format!("{}+00:00", stamp),
        None => raw.to_string(),
    };

    DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%:z")
        .or_else(|_| DateTime::parse_from_rfc3339(&normalized))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Ordering key of a timeline entry; computed once when the entry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub raw: String,
    pub at: Option<DateTime<Utc>>,
}

impl SortKey {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let at = parse_timestamp(&raw);
        Self { raw, at }
    }

    fn placeholder(source: &str, index: usize) -> Self {
        Self::new(format!("{}{}-{}", PLACEHOLDER_PREFIX, source, index))
    }

    fn from_created_at(created_at: Option<&str>, source: &str, index: usize) -> Self {
        match created_at {
            Some(stamp) if !stamp.trim().is_empty() => Self::new(stamp),
            _ => Self::placeholder(source, index),
        }
    }

    /// Parsed keys ascending, unparseable keys after all parsed ones,
    /// everything else equal so a stable sort keeps input order.
    pub fn compare(&self, other: &SortKey) -> Ordering {
        match (self.at, other.at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDisplay {
    pub invocation: ToolInvocation,
    pub label: String,
    pub subtitle: String,
    pub status: ToolStatus,
    /// Only set for code execution entries.
    pub code_language: Option<CodeLanguage>,
    pub delegation: Option<Delegation>,
    pub memories: Vec<MemoryHit>,
}

impl ToolDisplay {
    pub fn new(invocation: ToolInvocation) -> Self {
        let result = invocation.result.as_deref().unwrap_or_default();
        let delegation = parse_delegation(result);
        let memories = parse_memory_hits(result);
        let code_language = (invocation.tool_name == CODE_EXECUTION_TOOL)
            .then(|| infer_code_language(&invocation.args));

        Self {
            label: tool_label(&invocation.tool_name, delegation.as_ref()),
            subtitle: tool_subtitle(delegation.as_ref()),
            status: classify_status(invocation.result.as_deref()),
            code_language,
            delegation,
            memories,
            invocation,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code_language?;
        self.invocation.arg_str("code")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    Message { key: SortKey, message: Message },
    Tool { key: SortKey, display: ToolDisplay },
}

impl TimelineEntry {
    pub fn key(&self) -> &SortKey {
        match self {
            TimelineEntry::Message { key, .. } | TimelineEntry::Tool { key, .. } => key,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            TimelineEntry::Message { message, .. } => Some(message),
            TimelineEntry::Tool { .. } => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolDisplay> {
        match self {
            TimelineEntry::Tool { display, .. } => Some(display),
            TimelineEntry::Message { .. } => None,
        }
    }

    /// Wrap a message that is not part of a persisted history.
    pub fn from_message(message: Message, index: usize) -> Self {
        let key = SortKey::from_created_at(message.created_at.as_deref(), "local", index);
        TimelineEntry::Message { key, message }
    }
}

/// True for system messages that repeat a tool result already shown as a
/// structured tool entry.
pub fn is_tool_result_echo(message: &Message) -> bool {
    message.role == Role::System
        && message.content.starts_with(TOOL_ECHO_PREFIX)
        && message.content.contains(TOOL_ECHO_MARKER)
}

/// Merge a persisted history and its tool calls into one ordered timeline.
///
/// The output depends only on the inputs: messages come before tool calls in
/// the pre-sort sequence and the sort is stable.
pub fn build(messages: &[Message], tool_calls: &[ToolInvocation]) -> Vec<TimelineEntry> {
    let drop_echoes = !tool_calls.is_empty();

    let mut entries: Vec<TimelineEntry> = messages
        .iter()
        .enumerate()
        .filter(|(_, message)| !(drop_echoes && is_tool_result_echo(message)))
        .map(|(index, message)| TimelineEntry::Message {
            key: SortKey::from_created_at(message.created_at.as_deref(), "msg", index),
            message: message.clone(),
        })
        .collect();

    entries.extend(tool_calls.iter().enumerate().map(|(index, call)| {
        TimelineEntry::Tool {
            key: SortKey::from_created_at(call.created_at.as_deref(), "tool", index),
            display: ToolDisplay::new(call.clone()),
        }
    }));

    // `sort_by` is a stable sort
    entries.sort_by(|a, b| a.key().compare(b.key()));

    tracing::debug!(
        "Built timeline with {} entries from {} messages and {} tool calls",
        entries.len(),
        messages.len(),
        tool_calls.len()
    );
    entries
}
