//! Wire protocol between the orchestrator and a tool-using agent.
//!
//! Every agent turn must be exactly one JSON object, either a tool call
//! (`{"type":"tool","tool":"<name>","args":{...}}`) or a final answer
//! (`{"type":"final", ...}`) whose fields depend on the agent's role.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One parsed agent turn.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// The agent wants a tool executed and the result fed back.
    ToolCall { tool: String, args: Value },
    /// The agent is done; the payload is interpreted per role.
    Final(Value),
}

/// Why a turn could not be parsed. Each variant carries the corrective
/// message sent back to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    NotJson,
    MultipleObjects,
    NotAnObject,
    UnknownType(String),
    MissingToolName,
}

impl ReplyError {
    pub fn corrective_message(&self) -> String {
        match self {
            Self::NotJson => {
                "Invalid JSON. Respond with a single JSON object per instructions.".to_string()
            }
            Self::MultipleObjects => {
                "Multiple JSON objects detected. Return exactly ONE JSON object per response."
                    .to_string()
            }
            Self::NotAnObject => "The response must be a JSON object.".to_string(),
            Self::UnknownType(t) => format!("Unknown type '{}'. Use tool or final.", t),
            Self::MissingToolName => "Tool calls must include a \"tool\" name.".to_string(),
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotJson => write!(f, "reply is not valid JSON"),
            Self::MultipleObjects => write!(f, "reply contains more than one JSON value"),
            Self::NotAnObject => write!(f, "reply is not a JSON object"),
            Self::UnknownType(t) => write!(f, "unknown reply type '{}'", t),
            Self::MissingToolName => write!(f, "tool call without a tool name"),
        }
    }
}

impl std::error::Error for ReplyError {}

/// Remove a surrounding markdown code fence, if any.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an info string such as ```json
    let rest = match rest.find('\n') {
        Some(newline) if !rest[..newline].contains('{') => &rest[newline + 1..],
        _ => rest,
    };
    rest.trim_end().trim_end_matches('`').trim()
}

/// Parse one agent turn.
pub fn parse_reply(text: &str) -> Result<AgentReply, ReplyError> {
    let content = strip_fence(text);
    let mut stream = serde_json::Deserializer::from_str(content).into_iter::<Value>();

    let value = match stream.next() {
        Some(Ok(value)) => value,
        _ => return Err(ReplyError::NotJson),
    };
    if !content[stream.byte_offset()..].trim().is_empty() {
        return Err(ReplyError::MultipleObjects);
    }

    let Value::Object(map) = value else {
        return Err(ReplyError::NotAnObject);
    };

    match map.get("type").and_then(Value::as_str) {
        Some("tool") => {
            let tool = map
                .get("tool")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or(ReplyError::MissingToolName)?
                .to_string();
            let args = map
                .get("args")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            Ok(AgentReply::ToolCall { tool, args })
        }
        Some("final") => Ok(AgentReply::Final(Value::Object(map))),
        Some(other) => Err(ReplyError::UnknownType(other.to_string())),
        None => Err(ReplyError::UnknownType(String::new())),
    }
}

/// The Reviewer's verdict on a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Fix,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Fix => "fix",
        }
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "fix" => Ok(Self::Fix),
            other => Err(format!("unknown review decision '{}'", other)),
        }
    }
}

/// Anything other than an explicit approval is a request for fixes.
fn lenient_decision<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ReviewDecision, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("ok") | Some("approve") | Some("approved") => ReviewDecision::Approve,
        _ => ReviewDecision::Fix,
    })
}

fn default_decision() -> ReviewDecision {
    ReviewDecision::Fix
}

/// One reviewer finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "default_file")]
    pub file: String,
    #[serde(default)]
    pub note: String,
}

fn default_severity() -> String {
    "low".to_string()
}

fn default_file() -> String {
    "-".to_string()
}

/// Findings may arrive as objects or bare strings.
fn lenient_findings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Finding>, D::Error> {
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|item| match item {
            Value::String(note) => Some(Finding {
                severity: default_severity(),
                file: default_file(),
                note,
            }),
            Value::Object(_) => serde_json::from_value(item).ok(),
            _ => None,
        })
        .collect())
}

/// Final answer of the Reviewer Agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    #[serde(default = "default_decision", deserialize_with = "lenient_decision")]
    pub decision: ReviewDecision,
    #[serde(default)]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient_findings")]
    pub findings: Vec<Finding>,
    /// The agent's own reading of CI, free text.
    #[serde(default)]
    pub ci: String,
}

impl ReviewVerdict {
    pub fn from_final(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// An approval of a commit whose CI the agent itself saw failing is
    /// downgraded to a fix request.
    pub fn effective_decision(&self) -> ReviewDecision {
        let ci = self.ci.trim().to_ascii_lowercase();
        let ci_failed = matches!(ci.as_str(), "failed" | "failure" | "error");
        match self.decision {
            ReviewDecision::Approve if ci_failed => ReviewDecision::Fix,
            d => d,
        }
    }

    /// Markdown body used for the PR comment and the submitted review.
    pub fn to_markdown(&self) -> String {
        let mut body = format!(
            "**Decision:** {}\n\n**Summary:** {}\n",
            self.effective_decision(),
            if self.summary.is_empty() { "-" } else { &self.summary }
        );
        if !self.ci.is_empty() {
            body.push_str(&format!("\n**CI:** {}\n", self.ci));
        }
        body.push_str("\n**Findings:**\n");
        if self.findings.is_empty() {
            body.push_str("- No findings.\n");
        }
        for finding in &self.findings {
            body.push_str(&format!(
                "- [{}] `{}`: {}\n",
                finding.severity, finding.file, finding.note
            ));
        }
        body
    }
}

/// One file the Code Agent wants written or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub delete: bool,
}

/// Final answer of the Code Agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeProposal {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tests: String,
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

impl CodeProposal {
    pub fn from_final(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}
