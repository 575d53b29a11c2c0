//! Partials-update operation list
//!
//! A batch of peeling steps is submitted as a list of 6-tuples. Within one
//! list, any operation's inputs must either be pre-existing buffers or the
//! destination of an earlier operation in the same list; the scheduler
//! dispatches in list order, so that dependency discipline is preserved by
//! construction.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, EvalResult};
use crate::sizing::InstanceSizing;

/// Number of integers per operation in the flat boundary encoding.
pub const OP_TUPLE_LEN: usize = 6;

/// Flat-encoding sentinel for "no scaling buffer".
pub const OP_NONE: i32 = -1;

/// One Felsenstein peeling step: combine two children through their edge
/// transition matrices into a destination partials buffer.
///
/// A child index below the instance's tip count addresses a tip; if that tip
/// holds compact states the kernel takes the cheap one-hot path, otherwise
/// the tip's partials buffer is used like any internal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialsOp {
    /// Destination partials buffer.
    pub destination: usize,
    /// Scaling-factor buffer receiving per-pattern log scalers when the
    /// batch runs with rescaling. Ignored otherwise. Must be greater than
    /// the tip count, so tip scaling histories can never be clobbered.
    pub destination_scaling: Option<usize>,
    /// First child partials (or compact tip) buffer.
    pub child1: usize,
    /// Transition-matrix buffer for the edge above `child1`.
    pub child1_matrix: usize,
    /// Second child partials (or compact tip) buffer.
    pub child2: usize,
    /// Transition-matrix buffer for the edge above `child2`.
    pub child2_matrix: usize,
}

impl PartialsOp {
    /// Operation without a scaling destination.
    pub fn new(
        destination: usize,
        child1: usize,
        child1_matrix: usize,
        child2: usize,
        child2_matrix: usize,
    ) -> Self {
        Self {
            destination,
            destination_scaling: None,
            child1,
            child1_matrix,
            child2,
            child2_matrix,
        }
    }

    /// Operation that logs rescaling into `scaling`.
    pub fn with_scaling(mut self, scaling: usize) -> Self {
        self.destination_scaling = Some(scaling);
        self
    }

    /// Decode a flat `6·m` integer list as submitted at the procedural
    /// boundary. Negative entries in the scaling slot mean "none"; any other
    /// negative entry is rejected.
    pub fn from_flat(flat: &[i32]) -> EvalResult<Vec<PartialsOp>> {
        if flat.len() % OP_TUPLE_LEN != 0 {
            return Err(EvalError::out_of_range(
                "operation list length",
                flat.len(),
                flat.len() / OP_TUPLE_LEN * OP_TUPLE_LEN,
            ));
        }
        let mut ops = Vec::with_capacity(flat.len() / OP_TUPLE_LEN);
        for tuple in flat.chunks_exact(OP_TUPLE_LEN) {
            let index = |value: i32, what: &'static str| -> EvalResult<usize> {
                usize::try_from(value)
                    .map_err(|_| EvalError::out_of_range(what, value as usize, 0))
            };
            ops.push(PartialsOp {
                destination: index(tuple[0], "operation destination")?,
                destination_scaling: if tuple[1] < 0 {
                    None
                } else {
                    Some(tuple[1] as usize)
                },
                child1: index(tuple[2], "operation child")?,
                child1_matrix: index(tuple[3], "operation matrix")?,
                child2: index(tuple[4], "operation child")?,
                child2_matrix: index(tuple[5], "operation matrix")?,
            });
        }
        Ok(ops)
    }
}

/// Validate a whole operation list against an instance sizing before any
/// dispatch, so an invalid entry anywhere in the batch leaves every buffer
/// untouched.
pub fn validate_operations(
    sizing: &InstanceSizing,
    operations: &[PartialsOp],
    rescale: bool,
) -> EvalResult<()> {
    for op in operations {
        for (what, index) in [
            ("operation destination", op.destination),
            ("operation child", op.child1),
            ("operation child", op.child2),
        ] {
            if index >= sizing.partials_buffer_count {
                return Err(EvalError::out_of_range(
                    what,
                    index,
                    sizing.partials_buffer_count,
                ));
            }
        }
        for matrix in [op.child1_matrix, op.child2_matrix] {
            if matrix >= sizing.matrix_buffer_count {
                return Err(EvalError::out_of_range(
                    "operation matrix",
                    matrix,
                    sizing.matrix_buffer_count,
                ));
            }
        }
        if rescale {
            let scaling = op.destination_scaling.ok_or(EvalError::OutOfRange {
                what: "scaling buffer",
                index: 0,
                limit: sizing.partials_buffer_count,
            })?;
            // Scaling destinations must clear the tip range entirely.
            if scaling <= sizing.tip_count || scaling >= sizing.partials_buffer_count {
                return Err(EvalError::out_of_range(
                    "scaling buffer",
                    scaling,
                    sizing.partials_buffer_count,
                ));
            }
        }
    }
    Ok(())
}
