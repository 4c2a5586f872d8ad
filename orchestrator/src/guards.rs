//! Loop/deadlock and round/wall-clock guards.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

/// Selections kept for diagnostics.
const SELECTION_HISTORY: usize = 10;
/// Identical selections with no intervening progress before termination.
const MAX_REPEATS: u32 = 3;

/// Detects the Coordinator repeating an identical selection while no
/// non-Coordinator turn completes in between.
#[derive(Debug, Default)]
pub struct LoopGuard {
    history: VecDeque<(String, String)>,
    last: Option<(String, String)>,
    streak: u32,
    progress_baseline: u64,
}

impl LoopGuard {
    /// Observes one Coordinator selection together with the current
    /// progress counter. Returns a termination reason once the same
    /// selection repeats [`MAX_REPEATS`] times without progress.
    pub fn observe(
        &mut self,
        participant: &str,
        instruction: &str,
        progress: u64,
    ) -> Option<String> {
        let key = (participant.to_string(), instruction.to_string());
        if self.history.len() == SELECTION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(key.clone());

        if self.last.as_ref() == Some(&key) {
            if progress > self.progress_baseline {
                // Real work happened between the repeats.
                self.streak = 1;
                self.progress_baseline = progress;
            } else {
                self.streak += 1;
            }
        } else {
            self.last = Some(key);
            self.streak = 1;
            self.progress_baseline = progress;
        }

        (self.streak >= MAX_REPEATS)
            .then(|| "repeated identical selection with no progress".to_string())
    }
}

/// Enforces the configured turn count and wall-clock budget.
#[derive(Debug)]
pub struct RoundGuard {
    max_turns: Option<usize>,
    time_budget: Option<Duration>,
    started: Instant,
}

impl RoundGuard {
    pub fn new(max_turns: Option<usize>, time_budget: Option<Duration>) -> Self {
        Self {
            max_turns,
            time_budget,
            started: Instant::now(),
        }
    }

    /// Checked after every event; returns a termination reason once
    /// either limit is hit.
    pub fn check(&self, finalized_turns: usize) -> Option<String> {
        if let Some(max) = self.max_turns
            && finalized_turns >= max
        {
            return Some(format!("maximum turn count of {max} reached"));
        }
        if let Some(budget) = self.time_budget {
            let elapsed = self.started.elapsed();
            if elapsed > budget {
                return Some(format!(
                    "wall-clock budget exceeded: {:.1}s elapsed of {:.1}s",
                    elapsed.as_secs_f64(),
                    budget.as_secs_f64()
                ));
            }
        }
        None
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
