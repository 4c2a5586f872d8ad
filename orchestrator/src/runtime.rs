//! Orchestration driver.
//!
//! One task owns the run state and consumes the ordered update stream to
//! completion or until a stop is recorded; there is no internal
//! parallelism and no locking. Subscriber callbacks fire synchronously
//! in event order, and a failing subscriber never affects the run.
//!
//! Cancellation is cooperative: once the driver disengages it simply
//! stops polling and drops the stream. No explicit cancellation signal
//! is sent to the producing runtime; a producer that cares observes its
//! send side closing.

use std::collections::HashMap;
use std::pin::pin;

use chrono::Utc;
use futures::Stream;
use futures::StreamExt;
use roundtable_protocol::OrchestrationResult;
use roundtable_protocol::RunUpdate;
use roundtable_protocol::StreamEvent;
use roundtable_protocol::StreamEventKind;
use roundtable_protocol::TerminationKind;
use roundtable_protocol::TurnRecord;
use roundtable_protocol::WorkerDelta;
use roundtable_protocol::normalize_worker_id;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::decision::CoordinatorDecision;
use crate::errors::OrchestratorError;
use crate::guards::RoundGuard;
use crate::signoff::validate_sign_offs;
use crate::state::ActiveTurn;
use crate::state::OrchestrationState;
use crate::state::StopSignal;
use crate::synthesis::FallbackContext;
use crate::synthesis::ResultGenerator;
use crate::synthesis::fallback_result;
use crate::synthesis::synthesize;

/// Subscriber hooks, invoked synchronously in event order. Errors are
/// logged and never alter orchestration state.
pub trait RunObserver<T>: Send {
    fn on_turn_finalized(&mut self, _turn: &TurnRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stream_event(&mut self, _event: &StreamEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_complete(&mut self, _result: &OrchestrationResult<T>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The conversation orchestrator, parameterized by the target result
/// type the embedder wants synthesized.
pub struct Orchestrator<T> {
    config: OrchestratorConfig,
    observers: Vec<Box<dyn RunObserver<T>>>,
    generator: Option<Box<dyn ResultGenerator>>,
}

impl<T> Orchestrator<T>
where
    T: DeserializeOwned + Serialize + Send,
{
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
            generator: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver<T>>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attaches the result-generator collaborator. Synthesis only runs
    /// when both this and a schema are configured.
    pub fn with_result_generator(mut self, generator: Box<dyn ResultGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Consumes the ordered update stream to completion and produces the
    /// run's single result.
    pub async fn run<S>(self, updates: S) -> OrchestrationResult<T>
    where
        S: Stream<Item = anyhow::Result<RunUpdate>>,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("orchestration_run", run_id = %run_id);
        self.run_inner(run_id, updates).instrument(span).await
    }

    async fn run_inner<S>(mut self, run_id: Uuid, updates: S) -> OrchestrationResult<T>
    where
        S: Stream<Item = anyhow::Result<RunUpdate>>,
    {
        info!(coordinator = %self.config.coordinator_name, "orchestration run started");
        let round_guard = RoundGuard::new(self.config.max_turns, self.config.time_budget);
        let mut state = OrchestrationState::new();
        let mut final_messages = None;
        let mut stream_error: Option<String> = None;

        let mut updates = pin!(updates);
        while state.stop().is_none() {
            let Some(item) = updates.next().await else {
                break;
            };
            match item {
                Ok(RunUpdate::Delta(delta)) => self.handle_delta(&mut state, delta),
                Ok(RunUpdate::Completed(payload)) => {
                    self.finalize_active(&mut state);
                    final_messages = Some(payload.into_messages());
                    break;
                }
                Err(err) => {
                    stream_error =
                        Some(OrchestratorError::Stream(format!("{err:#}")).to_string());
                    break;
                }
            }
            if state.stop().is_none()
                && let Some(reason) = round_guard.check(state.turns.len())
            {
                warn!("forcing termination: {reason}");
                state.force_stop(TerminationKind::HardTimeout, reason);
            }
        }

        // A trailing partial turn still belongs in the transcript.
        self.finalize_active(&mut state);
        if let Some(messages) = &final_messages {
            state.tools.absorb_transcript(messages);
        }

        self.finish(run_id, state, stream_error, round_guard).await
    }

    fn handle_delta(&mut self, state: &mut OrchestrationState, delta: WorkerDelta) {
        let worker_name = normalize_worker_id(&delta.worker_id).to_string();
        let switching = state
            .active
            .as_ref()
            .is_none_or(|active| active.worker_name != worker_name);
        if switching {
            self.finalize_active(state);
            let started_at = state
                .invocation_times
                .remove(&worker_name)
                .unwrap_or_else(Utc::now);
            state.active = Some(ActiveTurn {
                worker_id: delta.worker_id.clone(),
                worker_name: worker_name.clone(),
                started_at,
                fragments: Vec::new(),
                calls: Vec::new(),
            });
            self.dispatch_stream_event(&StreamEvent {
                worker_id: delta.worker_id.clone(),
                worker_name: worker_name.clone(),
                kind: StreamEventKind::TurnStarted,
                timestamp: Utc::now(),
                tool_name: None,
                tool_arguments: None,
            });
        }

        if let Some(text) = delta.text
            && let Some(active) = state.active.as_mut()
        {
            active.fragments.push(text);
        }

        for fragment in &delta.tool_calls {
            let Some(done) = state.tools.ingest(&worker_name, fragment) else {
                continue;
            };
            if done.emit {
                self.dispatch_stream_event(&StreamEvent {
                    worker_id: delta.worker_id.clone(),
                    worker_name: worker_name.clone(),
                    kind: StreamEventKind::ToolCall,
                    timestamp: done.record.timestamp,
                    tool_name: Some(done.record.name.clone()),
                    tool_arguments: Some(done.record.arguments.clone()),
                });
            }
            if let Some(active) = state.active.as_mut() {
                active.calls.push(done.record);
            }
        }
    }

    /// Finalizes the buffered turn, if any: joins fragments, appends the
    /// record, notifies subscribers, and reacts to Coordinator decisions.
    fn finalize_active(&mut self, state: &mut OrchestrationState) {
        let Some(active) = state.active.take() else {
            return;
        };
        // A selected worker that never produced output leaves no turn
        // behind (and advances no progress).
        if active.fragments.iter().all(String::is_empty) && active.calls.is_empty() {
            debug!(worker = %active.worker_name, "dropping empty turn");
            return;
        }
        let ended_at = Utc::now();
        let elapsed_secs =
            ((ended_at - active.started_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        let turn = TurnRecord {
            worker_id: active.worker_id,
            worker_name: active.worker_name,
            text: active.fragments.concat(),
            started_at: active.started_at,
            ended_at,
            elapsed_secs,
            tool_calls: active.calls,
            metadata: HashMap::new(),
        };
        state.turns.push(turn.clone());
        self.dispatch_turn(&turn);

        if turn
            .worker_name
            .eq_ignore_ascii_case(&self.config.coordinator_name)
        {
            self.apply_decision(state, &turn.text);
        } else {
            state.progress += 1;
        }
    }

    fn apply_decision(&mut self, state: &mut OrchestrationState, text: &str) {
        let Some(decision) = CoordinatorDecision::from_turn_text(text) else {
            debug!("coordinator turn carried no parseable decision");
            return;
        };
        let stop_signaled = decision.stop_signaled();

        if let Some(selected) = decision.selection() {
            if let Some(reason) =
                state
                    .loop_guard
                    .observe(selected, &decision.instruction, state.progress)
            {
                warn!(selected, "forcing termination: {reason}");
                state.force_stop(TerminationKind::HardTimeout, reason);
            }
            // Baseline the worker's next turn start, unless this
            // decision is also ending the run.
            if state.stop().is_none() && !stop_signaled {
                state
                    .invocation_times
                    .insert(selected.to_string(), Utc::now());
            }
        }

        if !stop_signaled {
            return;
        }
        if decision.is_complete_instruction() {
            match validate_sign_offs(&state.turns, &self.excluded_names()) {
                Ok(()) => {
                    state.request_stop(decision.instruction, decision.final_message);
                }
                Err(reason) => {
                    warn!("completion stop dropped: {reason}");
                }
            }
        } else {
            state.request_stop(decision.instruction, decision.final_message);
        }
    }

    async fn finish(
        mut self,
        run_id: Uuid,
        mut state: OrchestrationState,
        stream_error: Option<String>,
        round_guard: RoundGuard,
    ) -> OrchestrationResult<T> {
        let stop = state.stop().cloned();
        let turns = std::mem::take(&mut state.turns);
        let tool_usage = std::mem::take(&mut state.tools).into_usage();
        let transcript = render_transcript(&turns);

        let completed = matches!(
            &stop,
            Some(StopSignal::Requested { instruction, .. })
                if instruction.eq_ignore_ascii_case("complete")
        );
        let mut error = stream_error;
        let mut value: Option<T> = None;

        if error.is_none()
            && let (Some(generator), Some(schema)) =
                (self.generator.as_deref(), self.config.result_schema.clone())
        {
            if completed {
                match synthesize(
                    generator,
                    &turns,
                    &self.excluded_names(),
                    &schema,
                    self.config.bounds,
                )
                .await
                {
                    Ok(raw) => value = serde_json::from_value(raw).ok(),
                    Err(err) => error = Some(err.to_string()),
                }
            } else {
                let ctx = self.fallback_context(run_id, &stop, &turns);
                value = serde_json::from_value(fallback_result(&schema, &ctx)).ok();
            }
        }

        let success = error.is_none()
            && match &stop {
                None => true,
                Some(StopSignal::Requested { .. }) => completed,
                Some(StopSignal::Forced { .. }) => false,
            };
        let result = OrchestrationResult {
            run_id,
            success,
            transcript,
            turns,
            tool_usage,
            value,
            error,
            elapsed_secs: round_guard.elapsed().as_secs_f64(),
        };
        info!(
            success = result.success,
            turns = result.turns.len(),
            "orchestration run finished"
        );
        self.dispatch_complete(&result);
        result
    }

    fn fallback_context(
        &self,
        run_id: Uuid,
        stop: &Option<StopSignal>,
        turns: &[TurnRecord],
    ) -> FallbackContext {
        let (reason, hard_terminated, termination_type) = match stop {
            Some(StopSignal::Forced { kind, reason }) => {
                (reason.clone(), true, Some(kind.to_string()))
            }
            Some(StopSignal::Requested { instruction, .. }) => (
                format!("conversation terminated: {instruction}"),
                false,
                Some(instruction.clone()),
            ),
            None => (
                "update stream ended without a stop decision".to_string(),
                false,
                None,
            ),
        };
        let output = match stop {
            Some(StopSignal::Requested {
                final_message: Some(message),
                ..
            }) => message.clone(),
            _ => turns
                .iter()
                .rev()
                .find(|turn| {
                    !turn
                        .worker_name
                        .eq_ignore_ascii_case(&self.config.coordinator_name)
                })
                .map(|turn| turn.text.clone())
                .unwrap_or_default(),
        };
        FallbackContext {
            reason,
            hard_terminated,
            termination_type,
            process_id: run_id,
            output,
        }
    }

    fn excluded_names(&self) -> Vec<&str> {
        let mut names = vec![self.config.coordinator_name.as_str()];
        if let Some(generator_name) = self.config.result_generator_name.as_deref() {
            names.push(generator_name);
        }
        names
    }

    fn dispatch_turn(&mut self, turn: &TurnRecord) {
        for observer in &mut self.observers {
            if let Err(err) = observer.on_turn_finalized(turn) {
                warn!("observer failed on finalized turn: {err:#}");
            }
        }
    }

    fn dispatch_stream_event(&mut self, event: &StreamEvent) {
        for observer in &mut self.observers {
            if let Err(err) = observer.on_stream_event(event) {
                warn!("observer failed on stream event: {err:#}");
            }
        }
    }

    fn dispatch_complete(&mut self, result: &OrchestrationResult<T>) {
        for observer in &mut self.observers {
            if let Err(err) = observer.on_run_complete(result) {
                warn!("observer failed on run completion: {err:#}");
            }
        }
    }
}

fn render_transcript(turns: &[TurnRecord]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.worker_name, turn.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
