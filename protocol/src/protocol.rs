//! Update events consumed from the multi-worker runtime.
//!
//! The runtime is free to ship tool-call payloads in whatever shape its
//! transport uses (attribute-style or dict-style keys, arguments as a raw
//! string or an already-parsed object). Everything is normalized here, at
//! the boundary, so orchestration logic only ever sees one canonical shape.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One entry of the ordered update sequence produced by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunUpdate {
    /// A per-worker streaming delta.
    Delta(WorkerDelta),
    /// Terminal event carrying the final transcript.
    Completed(TranscriptPayload),
}

/// Streamed output attributed to a single worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerDelta {
    #[serde(alias = "workerId")]
    pub worker_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "toolCallFragments")]
    pub tool_calls: Vec<ToolCallFragment>,
}

impl WorkerDelta {
    pub fn text(worker_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A possibly-partial tool invocation payload carried on a delta.
///
/// Fragments are only actionable once both `name` and `call_id` are
/// present; argument payloads may arrive as snapshots or as deltas and
/// are merged by the assembler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "callId", alias = "id")]
    pub call_id: Option<String>,
    #[serde(default, alias = "args")]
    pub arguments: Option<FragmentArguments>,
}

/// Tool arguments as shipped on the wire: either a raw (possibly partial)
/// string or an already-structured JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentArguments {
    Text(String),
    Structured(Value),
}

/// Terminal transcript payload. Runtimes ship either a bare message list
/// or an object exposing a `conversation` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptPayload {
    Wrapped { conversation: Vec<TranscriptMessage> },
    Messages(Vec<TranscriptMessage>),
}

impl TranscriptPayload {
    pub fn into_messages(self) -> Vec<TranscriptMessage> {
        match self {
            TranscriptPayload::Wrapped { conversation } => conversation,
            TranscriptPayload::Messages(messages) => messages,
        }
    }
}

/// One message of the final transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "name", alias = "source")]
    pub author: String,
    #[serde(default)]
    pub text: String,
    /// Structured content items in whatever shape the transport uses.
    #[serde(default, alias = "items")]
    pub content: Vec<Value>,
}

impl TranscriptMessage {
    pub fn assistant(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            author: author.into(),
            text: text.into(),
            content: Vec::new(),
        }
    }

    /// Canonicalized tool invocations found among this message's content
    /// items. Items lacking a name or a call id are not invocations.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.content
            .iter()
            .filter_map(FunctionCall::from_content_item)
            .collect()
    }
}

/// The single canonical tool-invocation shape used past the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub call_id: String,
    pub arguments: Option<Value>,
}

impl FunctionCall {
    /// Normalizes one transport-supplied content item. Accepts `call_id`,
    /// `callId`, or `id` for the identity key and `arguments` or `args`
    /// for the payload.
    pub fn from_content_item(item: &Value) -> Option<Self> {
        let obj = item.as_object()?;
        let name = obj.get("name")?.as_str()?.to_string();
        let call_id = ["call_id", "callId", "id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))?
            .to_string();
        let arguments = obj
            .get("arguments")
            .or_else(|| obj.get("args"))
            .filter(|v| !v.is_null())
            .cloned();
        Some(Self {
            name,
            call_id,
            arguments,
        })
    }
}

/// Strips any runtime-specific prefix (everything up to and including the
/// last `/`) from a reported worker id.
pub fn normalize_worker_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}
