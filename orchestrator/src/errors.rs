//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The result generator failed to produce a schema-conforming reply,
    /// including after the one automatic retry.
    #[error("result synthesis failed: {0}")]
    Synthesis(String),

    /// The update stream yielded an error from the producing runtime.
    #[error("update stream failed: {0}")]
    Stream(String),
}
