//! Reviewer sign-off validation.
//!
//! A "complete" stop request only holds if every reviewer that has
//! spoken carries a latest `SIGN-OFF: PASS` marker in its own text.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use roundtable_protocol::TurnRecord;

static SIGN_OFF: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)sign-off:?\s*(pass|fail|pending)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignOffStatus {
    Pass,
    Fail,
    Pending,
    Missing,
}

impl SignOffStatus {
    fn as_str(self) -> &'static str {
        match self {
            SignOffStatus::Pass => "pass",
            SignOffStatus::Fail => "fail",
            SignOffStatus::Pending => "pending",
            SignOffStatus::Missing => "missing",
        }
    }
}

/// Validates that every participating reviewer's latest sign-off is PASS.
///
/// Workers named in `exclude` (the Coordinator and the result generator)
/// are not reviewers. Returns the offending reviewers and their statuses
/// on failure.
pub fn validate_sign_offs(turns: &[TurnRecord], exclude: &[&str]) -> Result<(), String> {
    let mut latest: HashMap<String, SignOffStatus> = HashMap::new();
    let mut reviewers: HashSet<String> = HashSet::new();

    for turn in turns.iter().rev() {
        let name = turn.worker_name.as_str();
        if exclude.iter().any(|ex| ex.eq_ignore_ascii_case(name)) {
            continue;
        }
        reviewers.insert(name.to_string());
        if latest.contains_key(name) {
            continue;
        }
        // Most recent marker wins; within one message, the last one.
        if let Some(status) = last_marker(&turn.text) {
            latest.insert(name.to_string(), status);
        }
    }

    let mut offenders: Vec<String> = reviewers
        .iter()
        .filter_map(|name| {
            let status = latest
                .get(name)
                .copied()
                .unwrap_or(SignOffStatus::Missing);
            (status != SignOffStatus::Pass).then(|| format!("{name}: {}", status.as_str()))
        })
        .collect();

    if offenders.is_empty() {
        return Ok(());
    }
    offenders.sort();
    Err(format!("reviewers not signed off ({})", offenders.join(", ")))
}

fn last_marker(text: &str) -> Option<SignOffStatus> {
    let verdict = SIGN_OFF
        .captures_iter(text)
        .last()
        .and_then(|captures| captures.get(1))?;
    match verdict.as_str().to_ascii_lowercase().as_str() {
        "pass" => Some(SignOffStatus::Pass),
        "fail" => Some(SignOffStatus::Fail),
        _ => Some(SignOffStatus::Pending),
    }
}
