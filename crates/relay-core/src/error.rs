//! The engine-wide error taxonomy.
//!
//! Variants map one-to-one onto how the runtime reacts: `Validation` is
//! never retried, `Action` and `Timeout` feed the retry policy, `Cancelled`
//! ends an execution as `terminated`, `Conflict` is the single-instance
//! gate speaking, and `Infrastructure` means the store itself failed.

use thiserror::Error;

/// Errors surfaced by the scheduling engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No such task or execution.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed config, bad cron, cyclic or unknown-child workflow, empty
    /// command. Surfaced to the caller; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The single-instance gate rejected a start because an active
    /// execution already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The action returned an error. Subject to the retry policy.
    #[error("action failed: {0}")]
    Action(String),

    /// The action observed `terminate_requested` and stopped.
    #[error("execution terminated by request")]
    Cancelled,

    /// The script runner killed the process after its wall-clock budget.
    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    /// The task store failed underneath us.
    #[error("storage error: {0}")]
    Infrastructure(#[source] anyhow::Error),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Infrastructure(err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
