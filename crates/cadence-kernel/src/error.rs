//! Error taxonomy for the orchestrator core (§7 of the design).
//!
//! `KernelError` never carries enough context to leak internal types across
//! a process boundary unencrypted; it is a display-ready summary. Store
//! drivers map their native error types into `KernelError::Store` at the
//! repository boundary so callers above the store never match on a driver
//! type.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("schedule expression could not be parsed: {0}")]
    ScheduleParse(String),

    #[error("unresolved template reference: {0}")]
    UnresolvedTemplate(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("tool error (retryable={retryable}): {message}")]
    ToolError { message: String, retryable: bool },

    #[error("run cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl KernelError {
    /// Whether the error classifies as retryable per §4.E / §4.J / §7.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelError::ToolError { retryable: true, .. })
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
