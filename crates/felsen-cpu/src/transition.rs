//! Transition-matrix kernel
//!
//! Computes `M = U · diag(exp(λ·t·r)) · U⁻¹` per rate category from an
//! eigen-decomposition, plus first and second derivatives with respect to
//! branch length when asked. The three outputs share the `U · diag(...)`
//! intermediate; only the diagonal weights differ, so derivative requests
//! cost one extra matrix product each, not a fresh exponential.
//!
//! Policy: negative branch lengths are clamped to zero. Exponent arguments
//! are saturated well below the f64 overflow threshold so pathological edge
//! lengths degrade to the stationary limit instead of producing Inf or NaN.

use felsen_core::{EvalResult, MatrixRequest};

use crate::pool::{BufferPool, EigenDecomposition};

/// Largest exponent fed to `exp`. `exp(700)` is still finite in f64; a
/// proper rate matrix has non-positive eigenvalues so the cap is only ever
/// reached on malformed input.
const MAX_EXPONENT: f64 = 700.0;

/// Which diagonal weighting to apply: the probability matrix itself or a
/// branch-length derivative of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivative {
    None,
    First,
    Second,
}

impl Derivative {
    /// Chain-rule factor applied per eigenvalue: `(λ·r)^k`.
    fn chain_factor(self, value: f64, rate: f64) -> f64 {
        match self {
            Derivative::None => 1.0,
            Derivative::First => value * rate,
            Derivative::Second => (value * rate) * (value * rate),
        }
    }
}

/// Fill one `state_count × state_count` category slot of a transition-matrix
/// buffer from the eigen system, for effective distance `t · rate`.
pub fn category_matrix(
    eigen: &EigenDecomposition,
    state_count: usize,
    edge_length: f64,
    rate: f64,
    derivative: Derivative,
    out: &mut [f64],
) {
    debug_assert_eq!(out.len(), state_count * state_count);

    let t = edge_length.max(0.0);

    // diag weights: exp(λ t r), scaled by the chain factor for derivatives.
    let mut weights = vec![0.0; state_count];
    for (j, weight) in weights.iter_mut().enumerate() {
        let value = eigen.values[j];
        let exponent = (value * t * rate).min(MAX_EXPONENT);
        *weight = exponent.exp() * derivative.chain_factor(value, rate);
    }

    // out[s][s2] = Σ_j U[s][j] · w[j] · V[j][s2]
    for s in 0..state_count {
        let u_row = &eigen.vectors[s * state_count..(s + 1) * state_count];
        let out_row = &mut out[s * state_count..(s + 1) * state_count];
        out_row.fill(0.0);
        for j in 0..state_count {
            let scaled = u_row[j] * weights[j];
            if scaled == 0.0 {
                continue;
            }
            let v_row = &eigen.inverse_vectors[j * state_count..(j + 1) * state_count];
            for (entry, &v) in out_row.iter_mut().zip(v_row) {
                *entry += scaled * v;
            }
        }
    }
}

/// Execute a batch of transition-matrix requests against a buffer pool.
pub fn update_transition_matrices(
    pool: &mut BufferPool,
    eigen_index: usize,
    requests: &[MatrixRequest],
) -> EvalResult<()> {
    let sizing = *pool.sizing();
    let state_count = sizing.state_count;
    let per_category = state_count * state_count;

    if !pool.eigen(eigen_index)?.populated {
        return Err(felsen_core::EvalError::General(format!(
            "eigen buffer {eigen_index} was never set"
        )));
    }

    for request in requests {
        let targets = [
            (Some(request.matrix), Derivative::None),
            (request.first_derivative, Derivative::First),
            (request.second_derivative, Derivative::Second),
        ];
        for (target, derivative) in targets {
            let Some(matrix_index) = target else {
                continue;
            };
            let (eigen, rates, matrix) = pool.eigen_and_matrix_mut(eigen_index, matrix_index)?;
            for (category, rate) in rates.iter().enumerate() {
                let slot = &mut matrix[category * per_category..(category + 1) * per_category];
                category_matrix(
                    eigen,
                    state_count,
                    request.edge_length,
                    *rate,
                    derivative,
                    slot,
                );
            }
        }
    }
    Ok(())
}
