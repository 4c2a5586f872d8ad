//! Wire-facing data model for the Roundtable orchestration engine.
//!
//! This crate defines the update events consumed from a multi-worker
//! runtime, the canonical shapes they are normalized into at the stream
//! boundary, and the records the engine produces for its embedders.

pub mod protocol;
pub mod records;

pub use protocol::FragmentArguments;
pub use protocol::FunctionCall;
pub use protocol::RunUpdate;
pub use protocol::ToolCallFragment;
pub use protocol::TranscriptMessage;
pub use protocol::TranscriptPayload;
pub use protocol::WorkerDelta;
pub use protocol::normalize_worker_id;
pub use records::CallProvenance;
pub use records::OrchestrationResult;
pub use records::StreamEvent;
pub use records::StreamEventKind;
pub use records::TerminationKind;
pub use records::ToolCallRecord;
pub use records::TurnRecord;
