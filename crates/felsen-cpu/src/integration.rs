//! Root and edge integration kernels
//!
//! Root integration collapses a root partials buffer to per-pattern site
//! log-likelihoods under category weights and state frequencies, adding back
//! any accumulated scaling factors. Edge integration does the same with a
//! transition matrix inserted along one edge, and can additionally return
//! first and second derivatives of the site log-likelihoods with respect to
//! the edge length — the quantities a Newton-Raphson branch optimizer needs.

use felsen_core::{EdgeSpec, EvalError, EvalResult, RootSpec};

use crate::pool::{BufferPool, ChildView};
use crate::simd;

/// Sum per-pattern site log-likelihoods across the listed roots into `out`.
///
/// Each root's category-weight row carries any per-root mixture weight the
/// caller wants applied; the outer combination across roots is additive in
/// the log domain.
pub fn root_log_likelihoods(
    pool: &BufferPool,
    roots: &[RootSpec<'_>],
    out: &mut [f64],
) -> EvalResult<()> {
    let sizing = pool.sizing();
    check_len("site log-likelihood length", out.len(), sizing.pattern_count)?;
    out.fill(0.0);

    let mut site = vec![0.0; sizing.state_count];
    for root in roots {
        check_len(
            "category weights length",
            root.category_weights.len(),
            sizing.category_count,
        )?;
        check_len(
            "state frequencies length",
            root.state_frequencies.len(),
            sizing.state_count,
        )?;
        let partials = pool.partials(root.partials)?;
        let per_category = sizing.state_count * sizing.pattern_count;

        for pattern in 0..sizing.pattern_count {
            site.fill(0.0);
            for (category, &weight) in root.category_weights.iter().enumerate() {
                let offset = category * per_category + pattern * sizing.state_count;
                for (accumulated, &value) in
                    site.iter_mut().zip(&partials[offset..offset + sizing.state_count])
                {
                    *accumulated += weight * value;
                }
            }
            let likelihood = simd::dot_scalar(root.state_frequencies, &site);
            out[pattern] += likelihood.ln();
        }

        for &scaling in root.scale_buffers {
            let factors = pool.scale_factors(scaling)?;
            for (entry, &factor) in out.iter_mut().zip(factors) {
                *entry += factor;
            }
        }
    }
    Ok(())
}

/// Accumulators for the three weighted integrals an edge contributes: with
/// the probability matrix, and with its first and second derivatives.
struct EdgeIntegrals {
    f0: f64,
    f1: f64,
    f2: f64,
}

/// Sum per-pattern site log-likelihoods (and optional derivatives) across
/// the listed edges.
pub fn edge_log_likelihoods(
    pool: &BufferPool,
    edges: &[EdgeSpec<'_>],
    out: &mut [f64],
    mut out_first: Option<&mut [f64]>,
    mut out_second: Option<&mut [f64]>,
) -> EvalResult<()> {
    let sizing = pool.sizing();
    check_len("site log-likelihood length", out.len(), sizing.pattern_count)?;
    out.fill(0.0);
    if let Some(first) = out_first.as_deref_mut() {
        check_len("first derivative length", first.len(), sizing.pattern_count)?;
        first.fill(0.0);
    }
    if let Some(second) = out_second.as_deref_mut() {
        check_len("second derivative length", second.len(), sizing.pattern_count)?;
        second.fill(0.0);
    }

    for edge in edges {
        check_len(
            "category weights length",
            edge.category_weights.len(),
            sizing.category_count,
        )?;
        check_len(
            "state frequencies length",
            edge.state_frequencies.len(),
            sizing.state_count,
        )?;
        if out_first.is_some() && edge.first_derivative.is_none() {
            return Err(EvalError::General(
                "first derivative output requested without a derivative matrix".to_string(),
            ));
        }
        if out_second.is_some() && (edge.second_derivative.is_none() || edge.first_derivative.is_none())
        {
            return Err(EvalError::General(
                "second derivative output requested without derivative matrices".to_string(),
            ));
        }

        let parent = pool.partials(edge.parent)?;
        let child = match pool.tip_states(edge.child) {
            Some(states) => ChildView::States(states),
            None => ChildView::Partials(pool.partials(edge.child)?),
        };
        let matrix = pool.matrix(edge.matrix)?;
        let first_matrix = match edge.first_derivative {
            Some(buffer) => Some(pool.matrix(buffer)?),
            None => None,
        };
        let second_matrix = match edge.second_derivative {
            Some(buffer) => Some(pool.matrix(buffer)?),
            None => None,
        };

        for pattern in 0..sizing.pattern_count {
            let integrals = integrate_pattern(
                sizing.state_count,
                sizing.pattern_count,
                sizing.category_count,
                pattern,
                parent,
                child,
                matrix,
                first_matrix,
                second_matrix,
                edge.category_weights,
                edge.state_frequencies,
            );

            out[pattern] += integrals.f0.ln();
            // Scale factors are constant in the edge length, so they cancel
            // out of both derivative ratios.
            if let Some(first) = out_first.as_deref_mut() {
                first[pattern] += integrals.f1 / integrals.f0;
            }
            if let Some(second) = out_second.as_deref_mut() {
                let ratio = integrals.f1 / integrals.f0;
                second[pattern] += integrals.f2 / integrals.f0 - ratio * ratio;
            }
        }

        for &scaling in edge.scale_buffers {
            let factors = pool.scale_factors(scaling)?;
            for (entry, &factor) in out.iter_mut().zip(factors) {
                *entry += factor;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn integrate_pattern(
    states: usize,
    patterns: usize,
    categories: usize,
    pattern: usize,
    parent: &[f64],
    child: ChildView<'_>,
    matrix: &[f64],
    first_matrix: Option<&[f64]>,
    second_matrix: Option<&[f64]>,
    weights: &[f64],
    frequencies: &[f64],
) -> EdgeIntegrals {
    let per_category = states * patterns;
    let matrix_stride = states * states;
    let mut integrals = EdgeIntegrals {
        f0: 0.0,
        f1: 0.0,
        f2: 0.0,
    };

    for (category, &weight) in weights.iter().enumerate().take(categories) {
        let parent_row =
            &parent[category * per_category + pattern * states..][..states];

        let accumulate = |target: &mut f64, m: &[f64]| {
            let m_cat = &m[category * matrix_stride..(category + 1) * matrix_stride];
            let mut sum = 0.0;
            for s in 0..states {
                let row = &m_cat[s * states..(s + 1) * states];
                let inner = match child {
                    ChildView::Partials(partials) => {
                        let column =
                            &partials[category * per_category + pattern * states..][..states];
                        simd::dot_scalar(row, column)
                    }
                    ChildView::States(tip_states) => {
                        let state = tip_states[pattern] as usize;
                        if state < states {
                            row[state]
                        } else {
                            row.iter().sum()
                        }
                    }
                };
                sum += frequencies[s] * parent_row[s] * inner;
            }
            *target += weight * sum;
        };

        accumulate(&mut integrals.f0, matrix);
        if let Some(m) = first_matrix {
            accumulate(&mut integrals.f1, m);
        }
        if let Some(m) = second_matrix {
            accumulate(&mut integrals.f2, m);
        }
    }
    integrals
}

fn check_len(what: &'static str, got: usize, want: usize) -> EvalResult<()> {
    if got != want {
        return Err(EvalError::out_of_range(what, got, want));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use felsen_core::InstanceSizing;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: 2,
            category_count: 2,
            tip_count: 2,
            partials_buffer_count: 5,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    const UNIFORM: [f64; 4] = [0.25; 4];

    #[test]
    fn root_integration_weights_categories() {
        let mut pool = BufferPool::new(sizing()).unwrap();
        // Category 0 carries likelihood 0.8 in every state, category 1
        // carries 0.4; weights 0.75/0.25 mix them.
        let mut partials = vec![0.8; 16];
        partials[8..].fill(0.4);
        pool.set_partials(4, &partials).unwrap();

        let root = RootSpec {
            partials: 4,
            category_weights: &[0.75, 0.25],
            state_frequencies: &UNIFORM,
            scale_buffers: &[],
        };
        let mut out = vec![0.0; 2];
        root_log_likelihoods(&pool, &[root], &mut out).unwrap();

        let expected = (0.75f64 * 0.8 + 0.25 * 0.4).ln();
        assert!((out[0] - expected).abs() < 1e-12);
        assert!((out[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn scale_factors_are_added_back() {
        let mut pool = BufferPool::new(sizing()).unwrap();
        pool.set_partials(4, &vec![0.5; 16]).unwrap();

        // Stage a scaling history through the pool's own reset-then-peel
        // path: emulate by writing through a rescaled peel.
        let mut out_plain = vec![0.0; 2];
        let root = RootSpec {
            partials: 4,
            category_weights: &[0.5, 0.5],
            state_frequencies: &UNIFORM,
            scale_buffers: &[],
        };
        root_log_likelihoods(&pool, &[root], &mut out_plain).unwrap();

        let root_scaled = RootSpec {
            partials: 4,
            category_weights: &[0.5, 0.5],
            state_frequencies: &UNIFORM,
            scale_buffers: &[3, 3],
        };
        let mut out_scaled = vec![0.0; 2];
        root_log_likelihoods(&pool, &[root_scaled], &mut out_scaled).unwrap();
        // Untouched scale buffers hold zeros: results agree.
        assert_eq!(out_plain, out_scaled);
    }

    #[test]
    fn multiple_roots_sum_in_log_domain() {
        let mut pool = BufferPool::new(sizing()).unwrap();
        pool.set_partials(3, &vec![0.5; 16]).unwrap();
        pool.set_partials(4, &vec![0.25; 16]).unwrap();

        let weights = [0.5, 0.5];
        let roots = [
            RootSpec {
                partials: 3,
                category_weights: &weights,
                state_frequencies: &UNIFORM,
                scale_buffers: &[],
            },
            RootSpec {
                partials: 4,
                category_weights: &weights,
                state_frequencies: &UNIFORM,
                scale_buffers: &[],
            },
        ];
        let mut out = vec![0.0; 2];
        root_log_likelihoods(&pool, &roots, &mut out).unwrap();
        let expected = 0.5f64.ln() + 0.25f64.ln();
        assert!((out[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn edge_with_identity_matrix_matches_combined_root() {
        let mut pool = BufferPool::new(sizing()).unwrap();

        let parent: Vec<f64> = (0..16).map(|i| 0.1 + i as f64 * 0.02).collect();
        let child: Vec<f64> = (0..16).map(|i| 0.9 - i as f64 * 0.03).collect();
        pool.set_partials(3, &parent).unwrap();
        pool.set_partials(4, &child).unwrap();

        let mut identity = vec![0.0; 32];
        for category in 0..2 {
            for s in 0..4 {
                identity[category * 16 + s * 4 + s] = 1.0;
            }
        }
        pool.set_transition_matrix(0, &identity).unwrap();

        let weights = [0.6, 0.4];
        let edge = EdgeSpec {
            parent: 3,
            child: 4,
            matrix: 0,
            first_derivative: None,
            second_derivative: None,
            category_weights: &weights,
            state_frequencies: &UNIFORM,
            scale_buffers: &[],
        };
        let mut edge_out = vec![0.0; 2];
        edge_log_likelihoods(&pool, &[edge], &mut edge_out, None, None).unwrap();

        // Root over the element-wise product of parent and child.
        let combined: Vec<f64> = parent.iter().zip(&child).map(|(a, b)| a * b).collect();
        pool.set_partials(2, &combined).unwrap();
        let root = RootSpec {
            partials: 2,
            category_weights: &weights,
            state_frequencies: &UNIFORM,
            scale_buffers: &[],
        };
        let mut root_out = vec![0.0; 2];
        root_log_likelihoods(&pool, &[root], &mut root_out).unwrap();

        for (a, b) in edge_out.iter().zip(&root_out) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn derivative_outputs_require_derivative_matrices() {
        let mut pool = BufferPool::new(sizing()).unwrap();
        pool.set_partials(3, &vec![0.5; 16]).unwrap();
        pool.set_partials(4, &vec![0.5; 16]).unwrap();
        pool.set_transition_matrix(0, &vec![0.25; 32]).unwrap();

        let edge = EdgeSpec {
            parent: 3,
            child: 4,
            matrix: 0,
            first_derivative: None,
            second_derivative: None,
            category_weights: &[0.5, 0.5],
            state_frequencies: &UNIFORM,
            scale_buffers: &[],
        };
        let mut out = vec![0.0; 2];
        let mut first = vec![0.0; 2];
        let err =
            edge_log_likelihoods(&pool, &[edge], &mut out, Some(&mut first), None).unwrap_err();
        assert_eq!(err.code(), -1);
    }
}
