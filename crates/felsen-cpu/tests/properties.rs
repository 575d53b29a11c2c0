//! Property tests for the CPU kernels.
//!
//! These drive the kernels with randomized branch lengths, rates, matrices
//! and pattern data rather than hand-picked cases: row-stochasticity and
//! scaling invariance are laws, not examples.

use proptest::prelude::*;

use felsen_core::{InstanceSizing, MatrixRequest, PartialsOp};
use felsen_cpu::peeling::{peel, LoopMode};
use felsen_cpu::transition::update_transition_matrices;
use felsen_cpu::BufferPool;

fn jc_sizing(pattern_count: usize, category_count: usize) -> InstanceSizing {
    InstanceSizing {
        state_count: 4,
        pattern_count,
        category_count,
        tip_count: 2,
        partials_buffer_count: 6,
        compact_buffer_count: 2,
        eigen_buffer_count: 1,
        matrix_buffer_count: 2,
    }
}

fn set_jc_eigen(pool: &mut BufferPool) {
    let vectors = [
        1.0, 2.0, 0.0, 0.5, //
        1.0, -2.0, 0.5, 0.0, //
        1.0, 2.0, 0.0, -0.5, //
        1.0, -2.0, -0.5, 0.0,
    ];
    let inverse = [
        0.25, 0.25, 0.25, 0.25, //
        0.125, -0.125, 0.125, -0.125, //
        0.0, 1.0, 0.0, -1.0, //
        1.0, 0.0, -1.0, 0.0,
    ];
    let values = [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];
    pool.set_eigen_decomposition(0, &vectors, &inverse, &values)
        .unwrap();
}

proptest! {
    /// Every row of every computed transition matrix sums to one, for any
    /// branch length and rate scalers in a generous range.
    #[test]
    fn transition_rows_sum_to_one(
        edge_length in 0.0f64..10.0,
        rate_a in 0.01f64..5.0,
        rate_b in 0.01f64..5.0,
    ) {
        let mut pool = BufferPool::new(jc_sizing(1, 2)).unwrap();
        set_jc_eigen(&mut pool);
        pool.set_category_rates(&[rate_a, rate_b]).unwrap();
        update_transition_matrices(
            &mut pool,
            0,
            &[MatrixRequest::probabilities(0, edge_length)],
        )
        .unwrap();

        let matrix = pool.matrix(0).unwrap();
        for category in 0..2 {
            for s in 0..4 {
                let row = &matrix[category * 16 + s * 4..category * 16 + (s + 1) * 4];
                let sum: f64 = row.iter().sum();
                prop_assert!((sum - 1.0).abs() < 1e-10);
                for &entry in row {
                    prop_assert!((-1e-12..=1.0 + 1e-12).contains(&entry));
                }
            }
        }
    }

    /// Peeling with and without rescaling carries the same information: the
    /// unscaled destination equals the rescaled one multiplied back by the
    /// logged per-pattern scalers.
    #[test]
    fn rescaling_preserves_partials(
        seed_values in prop::collection::vec(1e-12f64..1.0, 4 * 5 * 2),
        matrix_rows in prop::collection::vec(0.01f64..1.0, 4 * 4 * 2),
    ) {
        let sizing = jc_sizing(5, 2);
        // Row-normalize the random matrix so it is a plausible transition
        // matrix; the law holds for any positive matrix regardless.
        let mut matrix = vec![0.0; 32];
        for category in 0..2 {
            for s in 0..4 {
                let row = &matrix_rows[category * 16 + s * 4..category * 16 + (s + 1) * 4];
                let total: f64 = row.iter().sum();
                for (k, &value) in row.iter().enumerate() {
                    matrix[category * 16 + s * 4 + k] = value / total;
                }
            }
        }

        let run = |rescale: bool| {
            let mut pool = BufferPool::new(sizing).unwrap();
            pool.set_transition_matrix(0, &matrix).unwrap();
            pool.set_transition_matrix(1, &matrix).unwrap();
            pool.set_partials(0, &seed_values).unwrap();
            pool.set_partials(1, &seed_values).unwrap();
            let op = if rescale {
                PartialsOp::new(4, 0, 0, 1, 1).with_scaling(3)
            } else {
                PartialsOp::new(4, 0, 0, 1, 1)
            };
            let views = pool.peel_views(&op, rescale).unwrap();
            peel(&sizing, views, LoopMode::Scalar);
            let partials = pool.partials(4).unwrap().to_vec();
            let scale = pool.scale_factors(3).unwrap().to_vec();
            (partials, scale)
        };

        let (unscaled, _) = run(false);
        let (rescaled, scale) = run(true);

        for category in 0..2 {
            for pattern in 0..5 {
                let factor = scale[pattern].exp();
                for s in 0..4 {
                    let index = category * 20 + pattern * 4 + s;
                    let restored = rescaled[index] * factor;
                    let reference = unscaled[index];
                    let tolerance = 1e-10 * reference.abs().max(1e-300);
                    prop_assert!(
                        (restored - reference).abs() <= tolerance.max(1e-300),
                        "index {}: {} vs {}", index, restored, reference
                    );
                }
            }
        }
    }

    /// A compact tip and the equivalent one-hot partials produce identical
    /// destinations for arbitrary states, including the missing sentinel.
    #[test]
    fn compact_tips_match_one_hot_partials(
        states in prop::collection::vec(0u32..=4, 5),
        matrix_rows in prop::collection::vec(0.01f64..1.0, 4 * 4 * 2),
        child_values in prop::collection::vec(0.01f64..1.0, 4 * 5 * 2),
    ) {
        let sizing = jc_sizing(5, 2);
        let run = |compact: bool| {
            let mut pool = BufferPool::new(sizing).unwrap();
            pool.set_transition_matrix(0, &matrix_rows).unwrap();
            pool.set_transition_matrix(1, &matrix_rows).unwrap();
            pool.set_partials(2, &child_values).unwrap();
            if compact {
                pool.set_tip_states(0, &states).unwrap();
            } else {
                let mut tip = vec![0.0; 20];
                for (pattern, &state) in states.iter().enumerate() {
                    if state < 4 {
                        tip[pattern * 4 + state as usize] = 1.0;
                    } else {
                        tip[pattern * 4..(pattern + 1) * 4].fill(1.0);
                    }
                }
                pool.set_tip_partials(0, &tip).unwrap();
            }
            let op = PartialsOp::new(4, 0, 0, 2, 1);
            let views = pool.peel_views(&op, false).unwrap();
            peel(&sizing, views, LoopMode::Scalar);
            pool.partials(4).unwrap().to_vec()
        };

        let with_states = run(true);
        let with_partials = run(false);
        for (a, b) in with_states.iter().zip(&with_partials) {
            prop_assert!((a - b).abs() < 1e-12);
        }
    }
}
