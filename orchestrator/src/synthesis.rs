//! Bounded-context result synthesis.
//!
//! After the conversation ends, a bounded slice of the transcript plus a
//! caller-supplied target schema go to the result-generator collaborator,
//! which replies with free text expected to contain one conforming JSON
//! value. A malformed reply earns exactly one retry against a strictly
//! smaller slice.

use std::collections::HashSet;

use anyhow::Context;
use anyhow::anyhow;
use async_trait::async_trait;
use roundtable_protocol::TurnRecord;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::TranscriptBounds;
use crate::decision::extract_first_json;
use crate::errors::OrchestratorError;

/// One message of the bounded transcript slice.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedMessage {
    pub author: String,
    pub text: String,
}

/// External collaborator that serializes the conversation outcome into a
/// caller-specified structured schema.
#[async_trait]
pub trait ResultGenerator: Send + Sync {
    /// Returns free text expected to contain one JSON value conforming
    /// to `schema`.
    async fn generate(
        &self,
        transcript: &[BoundedMessage],
        schema: &Value,
    ) -> anyhow::Result<String>;
}

/// Runs the generator against a bounded slice, retrying once with a
/// strictly smaller slice on a malformed reply.
pub(crate) async fn synthesize(
    generator: &dyn ResultGenerator,
    turns: &[TurnRecord],
    exclude: &[&str],
    schema: &Value,
    bounds: TranscriptBounds,
) -> Result<Value, OrchestratorError> {
    let slice = bound_transcript(turns, exclude, &bounds);
    match attempt(generator, &slice, schema).await {
        Ok(value) => Ok(value),
        Err(first_failure) => {
            warn!("result generator reply rejected, retrying with smaller transcript: {first_failure:#}");
            let shrunk = bounds.shrunk();
            let slice = bound_transcript(turns, exclude, &shrunk);
            attempt(generator, &slice, schema)
                .await
                .map_err(|err| OrchestratorError::Synthesis(format!("{err:#}")))
        }
    }
}

async fn attempt(
    generator: &dyn ResultGenerator,
    slice: &[BoundedMessage],
    schema: &Value,
) -> anyhow::Result<Value> {
    let reply = generator
        .generate(slice, schema)
        .await
        .context("result generator call failed")?;
    let value = extract_first_json(&reply)
        .ok_or_else(|| anyhow!("no balanced JSON value in result generator reply"))?;
    conforms(&value, schema).map_err(|reason| anyhow!("reply does not match schema: {reason}"))?;
    Ok(value)
}

/// Builds the transcript slice: newest first, excluded authors and
/// duplicated payloads skipped, each message truncated to its budget,
/// stopping at the message or total-character cap, then re-ordered
/// chronologically.
pub(crate) fn bound_transcript(
    turns: &[TurnRecord],
    exclude: &[&str],
    bounds: &TranscriptBounds,
) -> Vec<BoundedMessage> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut out: Vec<BoundedMessage> = Vec::new();
    let mut total_chars = 0usize;

    for turn in turns.iter().rev() {
        if out.len() >= bounds.max_messages || total_chars >= bounds.max_total_chars {
            break;
        }
        let author = turn.worker_name.as_str();
        if exclude.iter().any(|ex| ex.eq_ignore_ascii_case(author)) {
            continue;
        }
        // Fingerprint screens out duplicated large payloads.
        let fingerprint = (
            author.to_string(),
            char_prefix(&turn.text, 200).to_string(),
            char_suffix(&turn.text, 200).to_string(),
        );
        if !seen.insert(fingerprint) {
            continue;
        }
        let text = truncate_middle(&turn.text, bounds.max_message_chars);
        let length = text.chars().count();
        if total_chars + length > bounds.max_total_chars {
            break;
        }
        total_chars += length;
        out.push(BoundedMessage {
            author: author.to_string(),
            text,
        });
    }

    debug!(
        messages = out.len(),
        total_chars, "bounded transcript slice built"
    );
    out.reverse();
    out
}

/// Truncates to `budget` characters preserving head and tail around a
/// sized marker.
fn truncate_middle(text: &str, budget: usize) -> String {
    let total = text.chars().count();
    if total <= budget {
        return text.to_string();
    }
    let head_chars = budget / 2;
    let tail_chars = budget - head_chars;
    let removed = total - head_chars - tail_chars;
    let head_end = char_offset(text, head_chars);
    let tail_start = char_offset(text, total - tail_chars);
    format!(
        "{}\n[TRUNCATED {removed} CHARS]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn char_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

fn char_prefix(text: &str, chars: usize) -> &str {
    &text[..char_offset(text, chars)]
}

fn char_suffix(text: &str, chars: usize) -> &str {
    let total = text.chars().count();
    if total <= chars {
        return text;
    }
    &text[char_offset(text, total - chars)..]
}

/// Loose structural validation against a JSON-Schema-shaped target: the
/// value must be an object, carry every `required` key, and match the
/// primitive `type` of any declared property it supplies.
pub(crate) fn conforms(value: &Value, schema: &Value) -> Result<(), String> {
    let Some(object) = value.as_object() else {
        return Err("value is not an object".to_string());
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("missing required field `{key}`"));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, field) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let ok = match expected {
                "string" => field.is_string(),
                "number" => field.is_number(),
                "integer" => field.is_i64() || field.is_u64(),
                "boolean" => field.is_boolean(),
                "array" => field.is_array(),
                "object" => field.is_object(),
                "null" => field.is_null(),
                _ => true,
            };
            if !ok {
                return Err(format!("field `{key}` is not of type {expected}"));
            }
        }
    }
    Ok(())
}

/// Values available to populate a best-effort result when the generator
/// is skipped (forced or non-"complete" termination).
#[derive(Debug)]
pub(crate) struct FallbackContext {
    pub(crate) reason: String,
    pub(crate) hard_terminated: bool,
    pub(crate) termination_type: Option<String>,
    pub(crate) process_id: Uuid,
    pub(crate) output: String,
}

/// Populates only the fields of the known optional set that the target
/// schema actually declares.
pub(crate) fn fallback_result(schema: &Value, ctx: &FallbackContext) -> Value {
    let declared = schema.get("properties").and_then(Value::as_object);
    let mut out = serde_json::Map::new();
    let mut put = |key: &str, value: Value| {
        if declared.is_some_and(|properties| properties.contains_key(key)) {
            out.insert(key.to_string(), value);
        }
    };
    put("result", Value::Null);
    put("reason", json!(ctx.reason));
    put("isHardTerminated", json!(ctx.hard_terminated));
    put(
        "terminationType",
        ctx.termination_type.as_deref().map_or(Value::Null, |t| json!(t)),
    );
    put("blockingIssues", json!([]));
    put("processId", json!(ctx.process_id.to_string()));
    put("output", json!(ctx.output));
    put("terminationOutput", json!(ctx.reason));
    Value::Object(out)
}
