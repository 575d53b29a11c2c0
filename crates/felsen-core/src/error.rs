//! Closed error taxonomy for the evaluator
//!
//! Every fallible entry point returns [`EvalResult`]. The taxonomy is closed:
//! five kinds, nothing else crosses the boundary. Backend-internal failures
//! are caught and mapped to [`EvalError::UnidentifiedException`] before they
//! reach the caller.
//!
//! Numerical anomalies (NaN/Inf in kernel output) are deliberately *not*
//! signaled — checking every output would cost more than the anomaly. Callers
//! inspect outputs and use the rescaling mechanism to keep partials in range.

use thiserror::Error;

/// Result alias used across all evaluator crates.
pub type EvalResult<T> = Result<T, EvalError>;

/// The closed set of evaluator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Unspecified failure, e.g. no resource satisfies the requirement flags.
    #[error("general error: {0}")]
    General(String),

    /// Buffer allocation failed. The instance is left in its prior state; on
    /// creation failure no instance is produced at all.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A backend-internal failure that maps to no other kind.
    #[error("unidentified exception: {0}")]
    UnidentifiedException(String),

    /// The instance was never initialized, or has been finalized.
    #[error("uninitialized instance")]
    UninitializedInstance,

    /// An index or array length at the call boundary is outside the sizing
    /// fixed at instance creation.
    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },
}

impl EvalError {
    /// Stable negative code for each kind, for callers that keep an integer
    /// status convention at their own boundary. Success is conventionally a
    /// zero or non-negative handle and is not represented here.
    pub fn code(&self) -> i32 {
        match self {
            EvalError::General(_) => -1,
            EvalError::OutOfMemory(_) => -2,
            EvalError::UnidentifiedException(_) => -3,
            EvalError::UninitializedInstance => -4,
            EvalError::OutOfRange { .. } => -5,
        }
    }

    /// Shorthand for the pervasive bounds-check failure.
    pub fn out_of_range(what: &'static str, index: usize, limit: usize) -> Self {
        EvalError::OutOfRange { what, index, limit }
    }
}
