//! Extraction of display facts from opaque tool result text.
//!
//! Every function here is total: text that does not match the expected
//! micro-grammar yields an empty or neutral value, never an error.
//!
//! Grammar:
//! - delegation: first line `Subordinate Agent <digits> ...:`, the rest is
//!   the summary
//! - memory search: header line `Memories found:` followed by lines of
//!   `- [<namespace>/<area>] (score: <n>[, importance: <n>]) <content>`

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

pub const MEMORY_HEADER: &str = "Memories found:";

static DELEGATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Subordinate Agent (\d+)\b[^\n:]*:").expect("delegation pattern is valid")
});

static MEMORY_LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*- \[([^/\]]+)/([^\]]+)\] \(score: (-?[0-9]+(?:\.[0-9]+)?)(?:, importance: (-?[0-9]+(?:\.[0-9]+)?))?\)\s?(.*)$",
    )
    .expect("memory line pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub agent_id: u64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub namespace: String,
    pub area: String,
    /// Kept as the server printed it.
    pub score: String,
    pub importance: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Bash,
    Javascript,
}

impl CodeLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeLanguage::Python => "python",
            CodeLanguage::Bash => "bash",
            CodeLanguage::Javascript => "javascript",
        }
    }
}

pub fn parse_delegation(result: &str) -> Option<Delegation> {
    let captures = DELEGATION_PATTERN.captures(result)?;
    let agent_id = captures.get(1)?.as_str().parse().ok()?;
    let summary = result
        .split_once('\n')
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default();
    Some(Delegation { agent_id, summary })
}

pub fn parse_memory_hits(result: &str) -> Vec<MemoryHit> {
    let Some(body) = result.trim_start().strip_prefix(MEMORY_HEADER) else {
        return Vec::new();
    };

    body.lines()
        .filter_map(|line| {
            let captures = MEMORY_LINE_PATTERN.captures(line)?;
            Some(MemoryHit {
                namespace: captures[1].trim().to_string(),
                area: captures[2].trim().to_string(),
                score: captures[3].to_string(),
                importance: captures.get(4).map(|m| m.as_str().to_string()),
                content: captures[5].trim().to_string(),
            })
        })
        .collect()
}

pub fn classify_status(result: Option<&str>) -> ToolStatus {
    let Some(text) = result.filter(|text| !text.trim().is_empty()) else {
        return ToolStatus::Ok;
    };

    let lowered = text.trim_start().to_lowercase();
    if lowered.contains("timed out") {
        ToolStatus::Warning
    } else if lowered.starts_with("[error")
        || lowered.starts_with("error")
        || lowered.contains("error:")
        || lowered.contains("failed")
    {
        ToolStatus::Error
    } else {
        ToolStatus::Ok
    }
}

pub fn infer_code_language(args: &Map<String, Value>) -> CodeLanguage {
    match args.get("runtime").and_then(Value::as_str) {
        Some("shell") => CodeLanguage::Bash,
        Some("node") => CodeLanguage::Javascript,
        _ => CodeLanguage::Python,
    }
}

pub fn tool_label(tool_name: &str, delegation: Option<&Delegation>) -> String {
    match delegation {
        Some(d) => format!("Delegated to Agent {}", d.agent_id),
        None => format!("Tool: {}", tool_name),
    }
}

pub fn tool_subtitle(delegation: Option<&Delegation>) -> String {
    delegation.map(|d| d.summary.clone()).unwrap_or_default()
}
