//! Engine-private run state.
//!
//! The state is exclusively owned by the task driving the run loop, so no
//! synchronization primitive is used anywhere in it. Keeping it that way
//! is a hard invariant: nothing here may ever be shared across tasks.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use roundtable_protocol::TerminationKind;
use roundtable_protocol::TurnRecord;

use crate::guards::LoopGuard;
use crate::tool_calls::ToolCallAssembler;

/// Terminal decision for a run. First write wins; a requested and a
/// forced stop can never both be recorded.
#[derive(Debug, Clone)]
pub(crate) enum StopSignal {
    /// The Coordinator asked to stop.
    Requested {
        instruction: String,
        final_message: Option<String>,
    },
    /// A guard terminated the run.
    Forced {
        kind: TerminationKind,
        reason: String,
    },
}

/// The turn currently being streamed.
#[derive(Debug)]
pub(crate) struct ActiveTurn {
    pub(crate) worker_id: String,
    pub(crate) worker_name: String,
    pub(crate) started_at: DateTime<Utc>,
    /// Text fragments in arrival order, joined without separators on
    /// finalization.
    pub(crate) fragments: Vec<String>,
    /// Tool calls completed while this turn was active.
    pub(crate) calls: Vec<roundtable_protocol::ToolCallRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct OrchestrationState {
    pub(crate) active: Option<ActiveTurn>,
    /// Invocation times recorded when the Coordinator selects a worker,
    /// used to baseline that worker's next turn start.
    pub(crate) invocation_times: HashMap<String, DateTime<Utc>>,
    pub(crate) turns: Vec<TurnRecord>,
    pub(crate) tools: ToolCallAssembler,
    pub(crate) loop_guard: LoopGuard,
    /// Incremented once per finalized non-Coordinator turn.
    pub(crate) progress: u64,
    stop: Option<StopSignal>,
}

impl OrchestrationState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop(&self) -> Option<&StopSignal> {
        self.stop.as_ref()
    }

    /// Records a Coordinator-requested stop. No-op if any stop is already
    /// recorded; returns whether the write took effect.
    pub(crate) fn request_stop(
        &mut self,
        instruction: String,
        final_message: Option<String>,
    ) -> bool {
        if self.stop.is_some() {
            return false;
        }
        self.stop = Some(StopSignal::Requested {
            instruction,
            final_message,
        });
        true
    }

    /// Records a guard-forced stop. No-op if any stop is already
    /// recorded; returns whether the write took effect.
    pub(crate) fn force_stop(&mut self, kind: TerminationKind, reason: String) -> bool {
        if self.stop.is_some() {
            return false;
        }
        self.stop = Some(StopSignal::Forced { kind, reason });
        true
    }
}
