//! Instance sizing
//!
//! Eight constants, fixed for the lifetime of an instance, determine every
//! buffer length. All allocation happens at creation against these numbers;
//! kernels never allocate.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, EvalResult};

/// Sizing constants for one evaluator instance.
///
/// Buffer layouts derived from these:
/// - partials buffer: `state_count · pattern_count · category_count` reals,
///   indexed `[category][pattern][state]` with state fastest
/// - transition matrix buffer: `state_count² · category_count` reals,
///   category-major then row-major
/// - compact tip-state buffer: `pattern_count` integers in
///   `0..=state_count`, where `state_count` is the missing/ambiguous sentinel
/// - scaling-factor buffer: `pattern_count` log scalers, one per partials
///   buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSizing {
    /// Alphabet size (4 for nucleotides, 20 for amino acids, 61 for codons).
    pub state_count: usize,
    /// Number of distinct site patterns.
    pub pattern_count: usize,
    /// Number of discrete rate categories.
    pub category_count: usize,
    /// Number of tip (leaf) nodes. Buffer indices below this refer to tips.
    pub tip_count: usize,
    /// Number of partial-likelihood buffers.
    pub partials_buffer_count: usize,
    /// Number of compact tip-state buffers.
    pub compact_buffer_count: usize,
    /// Number of eigen-decomposition buffers.
    pub eigen_buffer_count: usize,
    /// Number of transition-matrix buffers.
    pub matrix_buffer_count: usize,
}

impl InstanceSizing {
    /// Length of one partials buffer.
    pub fn partials_len(&self) -> usize {
        self.state_count * self.pattern_count * self.category_count
    }

    /// Length of one transition-matrix buffer.
    pub fn matrix_len(&self) -> usize {
        self.state_count * self.state_count * self.category_count
    }

    /// Length of one eigenvector (or inverse eigenvector) array.
    pub fn eigen_len(&self) -> usize {
        self.state_count * self.state_count
    }

    /// Whether a child buffer index falls in the compact-tip range.
    pub fn is_tip(&self, buffer: usize) -> bool {
        buffer < self.tip_count
    }

    /// Reject sizings no instance could operate under.
    pub fn validate(&self) -> EvalResult<()> {
        if self.state_count < 2 {
            return Err(EvalError::out_of_range("state count", self.state_count, 2));
        }
        if self.pattern_count == 0 {
            return Err(EvalError::out_of_range("pattern count", 0, 1));
        }
        if self.category_count == 0 {
            return Err(EvalError::out_of_range("category count", 0, 1));
        }
        if self.partials_buffer_count == 0 {
            return Err(EvalError::out_of_range("partials buffer count", 0, 1));
        }
        if self.matrix_buffer_count == 0 {
            return Err(EvalError::out_of_range("matrix buffer count", 0, 1));
        }
        Ok(())
    }
}
