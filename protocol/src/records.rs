//! Records produced by the engine for its embedders.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A finalized worker turn. Immutable once appended to the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Worker id as reported by the runtime.
    pub worker_id: String,
    /// Normalized worker name (runtime prefix stripped).
    pub worker_name: String,
    /// Full message text, fragments joined in arrival order.
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// Tool calls completed while this turn was active.
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Ephemeral subscriber-facing event. Delivered at most once per logical
/// occurrence and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub worker_id: String,
    pub worker_name: String,
    pub kind: StreamEventKind,
    pub timestamp: DateTime<Utc>,
    pub tool_name: Option<String>,
    pub tool_arguments: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEventKind {
    #[serde(rename = "turn-started")]
    TurnStarted,
    #[serde(rename = "tool-call")]
    ToolCall,
}

/// A deduplicated structured tool invocation. Identity is
/// (worker name, call id); at most one live record exists per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub provenance: CallProvenance,
}

/// Where a tool-call record was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallProvenance {
    /// Assembled from streamed fragments.
    Stream,
    /// Recovered from the final transcript after the stream ended.
    Conversation,
}

/// Classification of a forced termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationKind {
    #[serde(rename = "hard-timeout")]
    HardTimeout,
}

impl std::fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationKind::HardTimeout => write!(f, "hard-timeout"),
        }
    }
}

/// Outcome of one orchestration run. Produced exactly once, whether the
/// run completed, was forcibly terminated, or failed.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult<T> {
    pub run_id: Uuid,
    pub success: bool,
    /// Full rendered transcript.
    pub transcript: String,
    /// Finalized turns in order.
    pub turns: Vec<TurnRecord>,
    /// Completed tool calls keyed by worker name.
    pub tool_usage: HashMap<String, Vec<ToolCallRecord>>,
    /// Typed result produced by the result generator, when configured and
    /// when its reply deserialized cleanly.
    pub value: Option<T>,
    pub error: Option<String>,
    pub elapsed_secs: f64,
}
