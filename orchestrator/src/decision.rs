//! Coordinator decision extraction and parsing.
//!
//! Coordinator turns carry a JSON routing decision followed by whatever
//! free text the model appended. Extraction takes the first balanced
//! JSON value and ignores the rest; anything that fails to extract or
//! parse means the turn carries no decision at all.

use serde::Deserialize;
use serde_json::Value;

/// Stop instructions recognized when no participant is selected.
const STOP_INSTRUCTIONS: [&str; 4] = ["complete", "blocked", "fail", "failed"];

/// A parsed Coordinator routing decision.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorDecision {
    #[serde(default, alias = "selected_participant")]
    pub selected_participant: Option<String>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub finish: bool,
    #[serde(default, alias = "final_message")]
    pub final_message: Option<String>,
}

impl CoordinatorDecision {
    /// Parses the decision carried by a Coordinator turn, if any.
    pub fn from_turn_text(text: &str) -> Option<Self> {
        let value = extract_first_json(text)?;
        serde_json::from_value(value).ok()
    }

    /// The selected participant, unless empty or the literal "none".
    pub fn selection(&self) -> Option<&str> {
        let selected = self.selected_participant.as_deref()?.trim();
        if selected.is_empty() || selected.eq_ignore_ascii_case("none") {
            return None;
        }
        Some(selected)
    }

    /// Whether this decision signals a stop: an explicit `finish`, or no
    /// selection combined with a terminal instruction.
    pub fn stop_signaled(&self) -> bool {
        if self.finish {
            return true;
        }
        self.selection().is_none()
            && STOP_INSTRUCTIONS
                .iter()
                .any(|stop| self.instruction.eq_ignore_ascii_case(stop))
    }

    pub fn is_complete_instruction(&self) -> bool {
        self.instruction.eq_ignore_ascii_case("complete")
    }
}

/// Extracts the first syntactically balanced JSON value from free-form
/// text. String contents and escapes are respected, so braces inside
/// string literals do not confuse the balance.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let candidate = &text[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in candidate.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = offset + ch.len_utf8();
                    return serde_json::from_str(&candidate[..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}
