//! Conversation-orchestration engine for multi-worker runs.
//!
//! A distinguished Coordinator worker decides, each round, which worker
//! speaks next and when the conversation ends. This crate turns the
//! runtime's ordered, partially-streamed update events into clean
//! per-turn transcripts and deduplicated tool invocations, gates
//! completion on reviewer sign-offs, guards against Coordinator loops and
//! runaway rounds, and synthesizes a bounded, schema-conforming result.

pub mod config;
pub mod decision;
pub mod errors;
pub mod guards;
pub mod runtime;
pub mod signoff;
pub mod synthesis;

mod state;
mod tool_calls;

pub use config::OrchestratorConfig;
pub use config::TranscriptBounds;
pub use errors::OrchestratorError;
pub use runtime::Orchestrator;
pub use runtime::RunObserver;
pub use synthesis::BoundedMessage;
pub use synthesis::ResultGenerator;
