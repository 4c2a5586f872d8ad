//! Run configuration.

use std::time::Duration;

use serde_json::Value;

/// Configuration for one orchestration run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name of the distinguished Coordinator worker.
    pub coordinator_name: String,
    /// Name of the result-generator collaborator, when result synthesis
    /// is desired. Also excluded from sign-off scanning.
    pub result_generator_name: Option<String>,
    /// Target schema the synthesized result must conform to.
    pub result_schema: Option<Value>,
    /// Maximum number of finalized turns before forced termination.
    pub max_turns: Option<usize>,
    /// Wall-clock budget for the whole run.
    pub time_budget: Option<Duration>,
    /// Bounds applied when slicing the transcript for the result
    /// generator.
    pub bounds: TranscriptBounds,
}

impl OrchestratorConfig {
    pub fn new(coordinator_name: impl Into<String>) -> Self {
        Self {
            coordinator_name: coordinator_name.into(),
            result_generator_name: None,
            result_schema: None,
            max_turns: None,
            time_budget: None,
            bounds: TranscriptBounds::default(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_result_generator(
        mut self,
        name: impl Into<String>,
        schema: Value,
    ) -> Self {
        self.result_generator_name = Some(name.into());
        self.result_schema = Some(schema);
        self
    }

    pub fn with_bounds(mut self, bounds: TranscriptBounds) -> Self {
        self.bounds = bounds;
        self
    }
}

/// Size limits for the transcript slice sent to the result generator.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptBounds {
    pub max_messages: usize,
    pub max_total_chars: usize,
    pub max_message_chars: usize,
}

impl TranscriptBounds {
    /// Strictly smaller bounds used for the single retry after a
    /// malformed generator reply.
    pub fn shrunk(self) -> Self {
        Self {
            max_messages: (self.max_messages / 2).max(1),
            max_total_chars: (self.max_total_chars / 2).max(1),
            max_message_chars: (self.max_message_chars / 2).max(1),
        }
    }
}

impl Default for TranscriptBounds {
    fn default() -> Self {
        Self {
            max_messages: 30,
            max_total_chars: 60_000,
            max_message_chars: 6_000,
        }
    }
}
