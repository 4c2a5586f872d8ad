//! Integration tests for the orchestration driver.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use pretty_assertions::assert_eq;
use roundtable_orchestrator::BoundedMessage;
use roundtable_orchestrator::Orchestrator;
use roundtable_orchestrator::OrchestratorConfig;
use roundtable_orchestrator::ResultGenerator;
use roundtable_orchestrator::RunObserver;
use roundtable_protocol::CallProvenance;
use roundtable_protocol::FragmentArguments;
use roundtable_protocol::OrchestrationResult;
use roundtable_protocol::RunUpdate;
use roundtable_protocol::StreamEvent;
use roundtable_protocol::StreamEventKind;
use roundtable_protocol::ToolCallFragment;
use roundtable_protocol::TranscriptMessage;
use roundtable_protocol::TranscriptPayload;
use roundtable_protocol::TurnRecord;
use roundtable_protocol::WorkerDelta;
use serde_json::Value;
use serde_json::json;

fn delta(worker: &str, text: &str) -> anyhow::Result<RunUpdate> {
    Ok(RunUpdate::Delta(WorkerDelta::text(worker, text)))
}

fn silent_delta(worker: &str) -> anyhow::Result<RunUpdate> {
    Ok(RunUpdate::Delta(WorkerDelta {
        worker_id: worker.to_string(),
        text: None,
        tool_calls: Vec::new(),
    }))
}

fn tool_delta(worker: &str, name: &str, call_id: &str, args: &str) -> anyhow::Result<RunUpdate> {
    Ok(RunUpdate::Delta(WorkerDelta {
        worker_id: worker.to_string(),
        text: None,
        tool_calls: vec![ToolCallFragment {
            name: Some(name.to_string()),
            call_id: Some(call_id.to_string()),
            arguments: Some(FragmentArguments::Text(args.to_string())),
        }],
    }))
}

struct FixedGenerator {
    reply: String,
}

#[async_trait]
impl ResultGenerator for FixedGenerator {
    async fn generate(
        &self,
        _transcript: &[BoundedMessage],
        _schema: &Value,
    ) -> anyhow::Result<String> {
        Ok(self.reply.clone())
    }
}

#[derive(Clone, Default)]
struct Collector {
    log: Arc<Mutex<Vec<String>>>,
}

impl Collector {
    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl RunObserver<Value> for Collector {
    fn on_turn_finalized(&mut self, turn: &TurnRecord) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("turn:{}", turn.worker_name));
        Ok(())
    }

    fn on_stream_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
        let kind = match event.kind {
            StreamEventKind::TurnStarted => "started",
            StreamEventKind::ToolCall => "tool",
        };
        self.log
            .lock()
            .unwrap()
            .push(format!("{kind}:{}", event.worker_name));
        Ok(())
    }

    fn on_run_complete(&mut self, result: &OrchestrationResult<Value>) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("complete:{}", result.success));
        Ok(())
    }
}

/// An observer that always fails; runs must shrug it off.
struct FaultyObserver;

impl RunObserver<Value> for FaultyObserver {
    fn on_turn_finalized(&mut self, _turn: &TurnRecord) -> anyhow::Result<()> {
        anyhow::bail!("observer exploded")
    }

    fn on_stream_event(&mut self, _event: &StreamEvent) -> anyhow::Result<()> {
        anyhow::bail!("observer exploded")
    }
}

fn result_schema() -> Value {
    json!({
        "properties": {"result": {"type": "string"}},
        "required": ["result"],
    })
}

#[tokio::test]
async fn completed_run_synthesizes_typed_result() {
    let config = OrchestratorConfig::new("Coordinator")
        .with_result_generator("Summarizer", result_schema());
    let orchestrator = Orchestrator::<Value>::new(config).with_result_generator(Box::new(
        FixedGenerator {
            reply: "Here it is: {\"result\": \"shipped\"} regards".to_string(),
        },
    ));

    let updates = stream::iter(vec![
        delta(
            "Coordinator",
            "{\"selectedParticipant\": \"Writer\", \"instruction\": \"draft\"}",
        ),
        delta("Writer", "Draft is ready. SIGN-OFF: PASS"),
        delta("Reviewer", "Looks correct. SIGN-OFF: PASS"),
        delta(
            "Coordinator",
            "{\"selectedParticipant\": \"none\", \"instruction\": \"complete\", \"finish\": true, \"finalMessage\": \"All done\"}",
        ),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.error, None);
    assert_eq!(result.value, Some(json!({"result": "shipped"})));
    assert_eq!(result.turns.len(), 4);
    assert!(result.transcript.contains("Writer: Draft is ready."));
}

#[tokio::test]
async fn pending_sign_off_drops_the_completion_stop() {
    let config = OrchestratorConfig::new("Coordinator")
        .with_result_generator("Summarizer", result_schema());
    let orchestrator = Orchestrator::<Value>::new(config).with_result_generator(Box::new(
        FixedGenerator {
            reply: "{\"result\": \"should not be requested\"}".to_string(),
        },
    ));

    let updates = stream::iter(vec![
        delta("Reviewer-A", "SIGN-OFF: PASS"),
        delta("Reviewer-B", "Not convinced yet. SIGN-OFF: PENDING"),
        delta(
            "Coordinator",
            "{\"finish\": true, \"instruction\": \"complete\"}",
        ),
        // The dropped stop means the conversation keeps flowing.
        delta("Reviewer-B", "Re-checked everything."),
    ]);

    let result = orchestrator.run(updates).await;
    // The run ended with the stream, not with a granted completion, so
    // the generator is skipped and the fallback populates the schema.
    assert_eq!(result.value, Some(json!({"result": null})));
    assert_eq!(result.turns.len(), 4);
}

#[tokio::test]
async fn completion_goes_through_once_reviewers_pass() {
    let config = OrchestratorConfig::new("Coordinator")
        .with_result_generator("Summarizer", result_schema());
    let orchestrator = Orchestrator::<Value>::new(config).with_result_generator(Box::new(
        FixedGenerator {
            reply: "{\"result\": \"approved\"}".to_string(),
        },
    ));

    let updates = stream::iter(vec![
        delta("Reviewer-A", "SIGN-OFF: PASS"),
        delta("Reviewer-B", "SIGN-OFF: PENDING"),
        delta(
            "Coordinator",
            "{\"finish\": true, \"instruction\": \"complete\"}",
        ),
        delta("Reviewer-B", "Fixed my concern. SIGN-OFF: PASS"),
        delta(
            "Coordinator",
            "{\"finish\": true, \"instruction\": \"complete\"}",
        ),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!({"result": "approved"})));
}

#[tokio::test]
async fn repeated_selection_without_progress_forces_termination() {
    let selection = "{\"selectedParticipant\": \"Reviewer\", \"instruction\": \"please check X\"}";
    let orchestrator =
        Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let updates = stream::iter(vec![
        delta("Coordinator", selection),
        silent_delta("Reviewer"),
        delta("Coordinator", selection),
        silent_delta("Reviewer"),
        delta("Coordinator", selection),
        silent_delta("Reviewer"),
        // Never reached: the third identical selection forces a stop.
        delta("Writer", "unreachable"),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(!result.success);
    assert_eq!(result.turns.len(), 3);
    assert!(
        result
            .turns
            .iter()
            .all(|turn| turn.worker_name == "Coordinator")
    );
}

#[tokio::test]
async fn intervening_progress_resets_the_loop_guard() {
    let selection = "{\"selectedParticipant\": \"Reviewer\", \"instruction\": \"please check X\"}";
    let orchestrator =
        Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let updates = stream::iter(vec![
        delta("Coordinator", selection),
        delta("Reviewer", "checked, found an issue"),
        delta("Coordinator", selection),
        delta("Reviewer", "checked again, another issue"),
        delta("Coordinator", selection),
        delta("Reviewer", "third check, all good. SIGN-OFF: PASS"),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(result.success);
    assert_eq!(result.turns.len(), 6);
}

#[tokio::test]
async fn turn_limit_forces_termination() {
    let config = OrchestratorConfig::new("Coordinator").with_max_turns(2);
    let orchestrator = Orchestrator::<Value>::new(config);

    let updates = stream::iter(vec![
        delta("Writer", "one"),
        delta("Reviewer", "two"),
        delta("Writer", "three"),
        delta("Reviewer", "four"),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(!result.success);
    // Two finalized turns trip the guard; the trailing buffer still
    // lands in the transcript on exit.
    assert_eq!(result.turns.len(), 3);
}

#[tokio::test]
async fn time_budget_forces_termination() {
    let config =
        OrchestratorConfig::new("Coordinator").with_time_budget(Duration::ZERO);
    let orchestrator = Orchestrator::<Value>::new(config);

    let updates = stream::iter(vec![delta("Writer", "one"), delta("Writer", "never read")]);
    let result = orchestrator.run(updates).await;
    assert!(!result.success);
}

#[tokio::test]
async fn forced_termination_populates_declared_fallback_fields() {
    let schema = json!({
        "properties": {
            "reason": {"type": "string"},
            "isHardTerminated": {"type": "boolean"},
            "terminationType": {"type": "string"},
            "output": {"type": "string"},
        }
    });
    let config = OrchestratorConfig::new("Coordinator")
        .with_max_turns(1)
        .with_result_generator("Summarizer", schema);
    let orchestrator = Orchestrator::<Value>::new(config).with_result_generator(Box::new(
        FixedGenerator {
            reply: "{\"never\": \"called\"}".to_string(),
        },
    ));

    let updates = stream::iter(vec![
        delta("Reviewer", "looked it over"),
        delta("Writer", "partial work"),
    ]);
    let result = orchestrator.run(updates).await;
    assert!(!result.success);

    let value = result.value.unwrap();
    assert_eq!(value["isHardTerminated"], json!(true));
    assert_eq!(value["terminationType"], json!("hard-timeout"));
    assert!(
        value["reason"].as_str().unwrap().contains("maximum turn count"),
        "{value}"
    );
    assert_eq!(value["output"], json!("partial work"));
}

#[tokio::test]
async fn streamed_tool_fragments_deduplicate_and_emit_once() {
    let collector = Collector::default();
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"))
        .with_observer(Box::new(collector.clone()));

    let updates = stream::iter(vec![
        delta("Writer", "calling a tool"),
        tool_delta("Writer", "search", "c1", "{\"q\":"),
        tool_delta("Writer", "search", "c1", "{\"q\":\"rust\"}"),
        tool_delta("Writer", "search", "c1", "{\"q\":\"rust\"}"),
    ]);

    let result = orchestrator.run(updates).await;
    let calls = &result.tool_usage["Writer"];
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, json!({"q": "rust"}));
    assert_eq!(calls[0].provenance, CallProvenance::Stream);
    assert_eq!(result.turns[0].tool_calls.len(), 1);

    let tool_events = collector
        .entries()
        .iter()
        .filter(|entry| entry.as_str() == "tool:Writer")
        .count();
    assert_eq!(tool_events, 1);
}

#[tokio::test]
async fn final_transcript_recovers_unstreamed_tool_calls() {
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let mut message = TranscriptMessage::assistant("chat/Writer", "used a tool silently");
    message.content = vec![json!({"name": "fetch", "callId": "c9", "arguments": "{\"url\":\"x\"}"})];

    let updates = stream::iter(vec![
        delta("Writer", "text only on the stream"),
        Ok(RunUpdate::Completed(TranscriptPayload::Messages(vec![
            message,
        ]))),
    ]);

    let result = orchestrator.run(updates).await;
    let calls = &result.tool_usage["Writer"];
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_id, "c9");
    assert_eq!(calls[0].provenance, CallProvenance::Conversation);
    assert_eq!(calls[0].arguments, json!({"url": "x"}));
}

#[tokio::test]
async fn observers_see_events_in_processing_order() {
    let collector = Collector::default();
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"))
        .with_observer(Box::new(collector.clone()))
        .with_observer(Box::new(FaultyObserver));

    let updates = stream::iter(vec![
        delta("Writer", "hello"),
        delta("Reviewer", "SIGN-OFF: PASS"),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(result.success);
    assert_eq!(
        collector.entries(),
        vec![
            "started:Writer",
            "turn:Writer",
            "started:Reviewer",
            "turn:Reviewer",
            "complete:true",
        ]
    );
}

#[tokio::test]
async fn worker_ids_are_normalized_across_the_run() {
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    // Same worker reported under two runtime prefixes: one turn each
    // time the speaker actually changes, merged otherwise.
    let updates = stream::iter(vec![
        delta("runtime-a/Writer", "part one, "),
        delta("runtime-b/Writer", "part two"),
        delta("Reviewer", "read it"),
    ]);

    let result = orchestrator.run(updates).await;
    assert_eq!(result.turns.len(), 2);
    assert_eq!(result.turns[0].worker_name, "Writer");
    assert_eq!(result.turns[0].text, "part one, part two");
}

#[tokio::test]
async fn stream_failure_preserves_partial_state() {
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let updates = stream::iter(vec![
        delta("Writer", "got this far"),
        Err(anyhow::anyhow!("runtime connection lost")),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("runtime connection lost"), "{error}");
    assert_eq!(result.turns.len(), 1);
    assert_eq!(result.turns[0].text, "got this far");
}

#[tokio::test]
async fn blocked_stop_is_not_a_success() {
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let updates = stream::iter(vec![
        delta("Writer", "tried everything"),
        delta(
            "Coordinator",
            "{\"selectedParticipant\": \"none\", \"instruction\": \"blocked\", \"finalMessage\": \"cannot proceed\"}",
        ),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(!result.success);
    assert_eq!(result.error, None);
    assert_eq!(result.turns.len(), 2);
}

#[tokio::test]
async fn malformed_coordinator_turn_is_ignored() {
    let orchestrator = Orchestrator::<Value>::new(OrchestratorConfig::new("Coordinator"));

    let updates = stream::iter(vec![
        delta("Coordinator", "thinking out loud, no decision here"),
        delta("Writer", "continuing"),
    ]);

    let result = orchestrator.run(updates).await;
    assert!(result.success);
    assert_eq!(result.turns.len(), 2);
}
