//! Felsenstein peeling kernel
//!
//! Combines two children through their edge transition matrices into a
//! destination partials buffer:
//!
//! ```text
//! dest[c,p,s] = (Σ_s' M1[c,s,s'] · child1[c,p,s'])
//!             · (Σ_s' M2[c,s,s'] · child2[c,p,s'])
//! ```
//!
//! A compact-state child collapses its inner sum to a single matrix column
//! (`M[c,s,state]`), or to the matrix row sum for the missing sentinel. That
//! is why unambiguous tips are dramatically cheaper to peel than dense
//! partials.
//!
//! Rescaling divides each pattern's values by their maximum across all
//! categories and states, logging the scaler per pattern, so partials stay
//! in floating-point range on deep trees.

use felsen_core::InstanceSizing;
use rayon::prelude::*;

use crate::pool::{ChildView, PeelViews};
use crate::simd;

/// Pattern count below which the vector engine stays single-threaded; the
/// rayon fork/join overhead swamps the kernel on small problems.
const PARALLEL_PATTERN_THRESHOLD: usize = 256;

/// How the inner loops should run. The engine picks this once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Scalar,
    /// NEON inner products plus pattern-parallel threading on large inputs.
    Vector,
}

/// Execute one peeling operation over views borrowed from the pool.
pub fn peel(sizing: &InstanceSizing, views: PeelViews<'_>, mode: LoopMode) {
    let states = sizing.state_count;
    let patterns = sizing.pattern_count;
    let per_category = states * patterns;
    let matrix_stride = states * states;

    let PeelViews {
        destination,
        scale,
        child1,
        matrix1,
        child2,
        matrix2,
    } = views;

    for category in 0..sizing.category_count {
        let m1 = &matrix1[category * matrix_stride..(category + 1) * matrix_stride];
        let m2 = &matrix2[category * matrix_stride..(category + 1) * matrix_stride];
        let dest_cat = &mut destination[category * per_category..(category + 1) * per_category];

        let run = |pattern: usize, out_row: &mut [f64]| {
            let factor1 = child_factor(child1, category, pattern, patterns, states, m1, mode);
            let factor2 = child_factor(child2, category, pattern, patterns, states, m2, mode);
            for s in 0..states {
                out_row[s] = factor1(s) * factor2(s);
            }
        };

        if mode == LoopMode::Vector && patterns >= PARALLEL_PATTERN_THRESHOLD {
            dest_cat
                .par_chunks_mut(states)
                .enumerate()
                .for_each(|(pattern, out_row)| run(pattern, out_row));
        } else {
            for (pattern, out_row) in dest_cat.chunks_exact_mut(states).enumerate() {
                run(pattern, out_row);
            }
        }
    }

    if let Some(scale) = scale {
        rescale(destination, scale, states, patterns, sizing.category_count);
    }
}

/// Per-state contribution of one child at one pattern, as a closure so the
/// compact and dense paths share the outer loop.
fn child_factor<'a>(
    child: ChildView<'a>,
    category: usize,
    pattern: usize,
    patterns: usize,
    states: usize,
    matrix: &'a [f64],
    mode: LoopMode,
) -> impl Fn(usize) -> f64 + 'a {
    move |s: usize| {
        let row = &matrix[s * states..(s + 1) * states];
        match child {
            ChildView::Partials(partials) => {
                let offset = category * states * patterns + pattern * states;
                let column = &partials[offset..offset + states];
                match mode {
                    LoopMode::Scalar => simd::dot_scalar(row, column),
                    LoopMode::Vector => simd::dot(row, column),
                }
            }
            ChildView::States(tip_states) => {
                let state = tip_states[pattern] as usize;
                if state < states {
                    row[state]
                } else {
                    // Missing/ambiguous sentinel: an all-ones column.
                    row.iter().sum()
                }
            }
        }
    }
}

/// Divide each pattern's values by their maximum across categories and
/// states, recording `ln(max)` per pattern. An all-zero column keeps a unit
/// scaler so the log stays finite.
fn rescale(
    destination: &mut [f64],
    scale: &mut [f64],
    states: usize,
    patterns: usize,
    categories: usize,
) {
    let per_category = states * patterns;
    for pattern in 0..patterns {
        let mut max = 0.0f64;
        for category in 0..categories {
            let offset = category * per_category + pattern * states;
            for &value in &destination[offset..offset + states] {
                max = max.max(value);
            }
        }
        if max > 0.0 {
            let inverse = 1.0 / max;
            for category in 0..categories {
                let offset = category * per_category + pattern * states;
                for value in &mut destination[offset..offset + states] {
                    *value *= inverse;
                }
            }
            scale[pattern] = max.ln();
        } else {
            scale[pattern] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use felsen_core::PartialsOp;

    fn sizing(patterns: usize) -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: patterns,
            category_count: 2,
            tip_count: 2,
            partials_buffer_count: 5,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    /// Identity transition matrices for both categories.
    fn set_identity_matrix(pool: &mut BufferPool, buffer: usize) {
        let mut matrix = vec![0.0; 32];
        for category in 0..2 {
            for s in 0..4 {
                matrix[category * 16 + s * 4 + s] = 1.0;
            }
        }
        pool.set_transition_matrix(buffer, &matrix).unwrap();
    }

    #[test]
    fn identity_peel_multiplies_children() {
        let mut pool = BufferPool::new(sizing(3)).unwrap();
        set_identity_matrix(&mut pool, 0);
        set_identity_matrix(&mut pool, 1);

        let child1: Vec<f64> = (0..24).map(|i| (i + 1) as f64).collect();
        let child2: Vec<f64> = (0..24).map(|i| 0.5 + i as f64).collect();
        pool.set_partials(2, &child1).unwrap();
        pool.set_partials(3, &child2).unwrap();

        let op = PartialsOp::new(4, 2, 0, 3, 1);
        let views = pool.peel_views(&op, false).unwrap();
        peel(&sizing(3), views, LoopMode::Scalar);

        let result = pool.partials(4).unwrap();
        for i in 0..24 {
            assert!((result[i] - child1[i] * child2[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn compact_tip_equals_one_hot_partials() {
        let sizing = sizing(3);
        let mut matrix = vec![0.0; 32];
        // An arbitrary dense matrix, different per category.
        for (i, entry) in matrix.iter_mut().enumerate() {
            *entry = 0.01 + (i as f64) * 0.003;
        }

        // Run 1: compact states for tip 0, with pattern 2 missing.
        let mut compact = BufferPool::new(sizing).unwrap();
        compact.set_transition_matrix(0, &matrix).unwrap();
        compact.set_transition_matrix(1, &matrix).unwrap();
        compact.set_tip_states(0, &[1, 3, 4]).unwrap();
        let dense_child: Vec<f64> = (0..24).map(|i| 0.2 + i as f64 * 0.01).collect();
        compact.set_partials(2, &dense_child).unwrap();
        let op = PartialsOp::new(3, 0, 0, 2, 1);
        let views = compact.peel_views(&op, false).unwrap();
        peel(&sizing, views, LoopMode::Scalar);
        let compact_result = compact.partials(3).unwrap().to_vec();

        // Run 2: the same tip as explicit one-hot partials (all-ones for the
        // missing pattern), replicated across categories.
        let mut dense = BufferPool::new(sizing).unwrap();
        dense.set_transition_matrix(0, &matrix).unwrap();
        dense.set_transition_matrix(1, &matrix).unwrap();
        let mut tip = vec![0.0; 12];
        tip[1] = 1.0; // pattern 0, state 1
        tip[7] = 1.0; // pattern 1, state 3
        tip[8..12].fill(1.0); // pattern 2: missing

        dense.set_tip_partials(0, &tip).unwrap();
        dense.set_partials(2, &dense_child).unwrap();
        let views = dense.peel_views(&op, false).unwrap();
        peel(&sizing, views, LoopMode::Scalar);
        let dense_result = dense.partials(3).unwrap().to_vec();

        for (a, b) in compact_result.iter().zip(&dense_result) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn scalar_and_vector_modes_agree() {
        // Enough patterns to cross the threading threshold.
        let sizing = sizing(300);
        let mut matrix = vec![0.0; 32];
        for (i, entry) in matrix.iter_mut().enumerate() {
            *entry = ((i * 37 % 11) as f64 + 1.0) / 12.0;
        }

        let run = |mode: LoopMode| {
            let mut pool = BufferPool::new(sizing).unwrap();
            pool.set_transition_matrix(0, &matrix).unwrap();
            pool.set_transition_matrix(1, &matrix).unwrap();
            let child: Vec<f64> = (0..sizing.partials_len())
                .map(|i| ((i * 13 % 29) as f64 + 0.5) / 30.0)
                .collect();
            pool.set_partials(2, &child).unwrap();
            pool.set_partials(3, &child).unwrap();
            let op = PartialsOp::new(4, 2, 0, 3, 1);
            let views = pool.peel_views(&op, false).unwrap();
            peel(&sizing, views, mode);
            pool.partials(4).unwrap().to_vec()
        };

        let scalar = run(LoopMode::Scalar);
        let vector = run(LoopMode::Vector);
        for (a, b) in scalar.iter().zip(&vector) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn rescaling_keeps_log_likelihood_information() {
        let sizing = sizing(3);
        let mut pool = BufferPool::new(sizing).unwrap();
        set_identity_matrix(&mut pool, 0);
        set_identity_matrix(&mut pool, 1);

        // Tiny child values drive the product toward underflow territory.
        let child: Vec<f64> = vec![1e-140; 24];
        pool.set_partials(0, &child).unwrap();
        pool.set_partials(1, &child).unwrap();

        let op = PartialsOp::new(4, 0, 0, 1, 1).with_scaling(3);
        let views = pool.peel_views(&op, true).unwrap();
        peel(&sizing, views, LoopMode::Scalar);

        let result = pool.partials(4).unwrap();
        // After rescaling the pattern maxima are exactly one.
        for pattern in 0..3 {
            let max = (0..2)
                .flat_map(|c| result[c * 12 + pattern * 4..c * 12 + pattern * 4 + 4].iter())
                .cloned()
                .fold(0.0f64, f64::max);
            assert!((max - 1.0).abs() < 1e-12);
        }
        let scale = pool.scale_factors(3).unwrap();
        for &entry in scale {
            assert!((entry - (1e-280f64).ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn all_zero_pattern_keeps_finite_scaler() {
        let sizing = sizing(3);
        let mut pool = BufferPool::new(sizing).unwrap();
        set_identity_matrix(&mut pool, 0);
        set_identity_matrix(&mut pool, 1);
        pool.set_partials(0, &vec![0.0; 24]).unwrap();
        pool.set_partials(1, &vec![0.0; 24]).unwrap();

        let op = PartialsOp::new(4, 0, 0, 1, 1).with_scaling(3);
        let views = pool.peel_views(&op, true).unwrap();
        peel(&sizing, views, LoopMode::Scalar);

        for &entry in pool.scale_factors(3).unwrap() {
            assert!(entry.is_finite());
            assert_eq!(entry, 0.0);
        }
    }
}
