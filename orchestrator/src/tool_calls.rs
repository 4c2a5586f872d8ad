//! Streamed tool-call assembly and deduplication.
//!
//! Argument payloads for one call may arrive as repeated full snapshots,
//! as incremental deltas, or as a single structured object depending on
//! the transport. Fragments are merged per (worker, call id) until the
//! buffered text parses, then exactly one record per identity is kept.

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::Utc;
use roundtable_protocol::CallProvenance;
use roundtable_protocol::FragmentArguments;
use roundtable_protocol::ToolCallFragment;
use roundtable_protocol::ToolCallRecord;
use roundtable_protocol::TranscriptMessage;
use roundtable_protocol::normalize_worker_id;
use serde_json::Value;

/// Identity of a tool call: (worker name, call id).
type CallKey = (String, String);

/// A call whose arguments just became complete.
#[derive(Debug)]
pub(crate) struct CompletedCall {
    pub(crate) record: ToolCallRecord,
    /// Whether a subscriber event should fire for this identity (true at
    /// most once per identity).
    pub(crate) emit: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ToolCallAssembler {
    /// Buffered raw argument text per pending identity.
    buffers: HashMap<CallKey, String>,
    recorded: HashSet<CallKey>,
    emitted: HashSet<CallKey>,
    /// Stable position of each identity in its worker's list.
    indices: HashMap<CallKey, usize>,
    usage: HashMap<String, Vec<ToolCallRecord>>,
}

impl ToolCallAssembler {
    /// Feeds one fragment. Fragments lacking a name or call id are not
    /// actionable yet and are ignored.
    pub(crate) fn ingest(
        &mut self,
        worker_name: &str,
        fragment: &ToolCallFragment,
    ) -> Option<CompletedCall> {
        let name = fragment.name.as_deref()?;
        let call_id = fragment.call_id.as_deref()?;
        let key: CallKey = (worker_name.to_string(), call_id.to_string());
        if self.recorded.contains(&key) {
            return None;
        }

        let complete_args = match &fragment.arguments {
            Some(FragmentArguments::Structured(value)) => Some(value.clone()),
            Some(FragmentArguments::Text(text)) => {
                let buffered = self.buffers.entry(key.clone()).or_default();
                merge_fragment(buffered, text);
                serde_json::from_str::<Value>(buffered).ok()
            }
            None => match self.buffers.get(&key) {
                // A buffered payload may have just become parseable.
                Some(buffered) => serde_json::from_str::<Value>(buffered).ok(),
                // No arguments anywhere: a no-arg call, complete as-is.
                None => Some(Value::Null),
            },
        };

        let arguments = complete_args?;
        self.buffers.remove(&key);
        self.recorded.insert(key.clone());
        let record = ToolCallRecord {
            name: name.to_string(),
            arguments,
            call_id: call_id.to_string(),
            timestamp: Utc::now(),
            provenance: CallProvenance::Stream,
        };
        self.insert_or_update(worker_name, key.clone(), record.clone());
        let emit = self.emitted.insert(key);
        Some(CompletedCall { record, emit })
    }

    /// Recovers tool invocations that only ever appeared in the final
    /// transcript (transports that stream text deltas alone). Identities
    /// already recorded from the stream are left untouched.
    pub(crate) fn absorb_transcript(&mut self, messages: &[TranscriptMessage]) {
        for message in messages {
            if !message.role.eq_ignore_ascii_case("assistant") {
                continue;
            }
            let worker_name = normalize_worker_id(&message.author).to_string();
            for call in message.function_calls() {
                let key: CallKey = (worker_name.clone(), call.call_id.clone());
                if self.recorded.contains(&key) {
                    continue;
                }
                let arguments = match call.arguments {
                    Some(Value::String(raw)) => {
                        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
                    }
                    Some(value) => value,
                    None => Value::Null,
                };
                let record = ToolCallRecord {
                    name: call.name,
                    arguments,
                    call_id: call.call_id,
                    timestamp: Utc::now(),
                    provenance: CallProvenance::Conversation,
                };
                self.recorded.insert(key.clone());
                self.insert_or_update(&worker_name, key, record);
            }
        }
    }

    fn insert_or_update(&mut self, worker_name: &str, key: CallKey, record: ToolCallRecord) {
        let list = self.usage.entry(worker_name.to_string()).or_default();
        match self.indices.get(&key) {
            Some(&index) => list[index] = record,
            None => {
                self.indices.insert(key, list.len());
                list.push(record);
            }
        }
    }

    pub(crate) fn into_usage(self) -> HashMap<String, Vec<ToolCallRecord>> {
        self.usage
    }

    #[cfg(test)]
    fn calls_for(&self, worker_name: &str) -> &[ToolCallRecord] {
        self.usage.get(worker_name).map_or(&[], Vec::as_slice)
    }
}

/// Merge rule for streamed argument text. Snapshots replace, stale short
/// fragments are dropped, anything else is treated as a delta.
fn merge_fragment(buffered: &mut String, fragment: &str) {
    if buffered.is_empty() {
        buffered.push_str(fragment);
    } else if fragment.starts_with(buffered.as_str()) {
        // Updated full snapshot.
        buffered.clear();
        buffered.push_str(fragment);
    } else if buffered.starts_with(fragment) {
        // Stale or short re-send; keep what we have.
    } else {
        buffered.push_str(fragment);
    }
}
