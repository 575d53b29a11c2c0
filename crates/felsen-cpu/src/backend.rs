//! The CPU engines
//!
//! One struct, two constructors: [`CpuBackend::scalar`] is the plain
//! double-precision baseline, [`CpuBackend::vectorized`] runs NEON inner
//! products on aarch64 and threads the pattern loop on large problems. Both
//! are synchronous — every call completes before returning, so the wait
//! barrier is a no-op.

use log::{debug, trace};

use felsen_core::{
    validate_operations, Capabilities, EdgeSpec, EvalResult, InstanceSizing, LikelihoodBackend,
    MatrixRequest, PartialsOp, RootSpec,
};

use crate::integration;
use crate::peeling::{self, LoopMode};
use crate::pool::BufferPool;
use crate::transition;

/// Synchronous CPU likelihood engine over a host-memory buffer pool.
pub struct CpuBackend {
    pool: BufferPool,
    mode: LoopMode,
    resource_index: usize,
}

impl CpuBackend {
    /// Scalar double-precision engine (registry entry 0).
    pub fn scalar(sizing: InstanceSizing) -> EvalResult<Self> {
        debug!(
            "creating scalar CPU backend: {} states, {} patterns, {} categories",
            sizing.state_count, sizing.pattern_count, sizing.category_count
        );
        Ok(Self {
            pool: BufferPool::new(sizing)?,
            mode: LoopMode::Scalar,
            resource_index: 0,
        })
    }

    /// Vectorized engine (registry entry 1).
    pub fn vectorized(sizing: InstanceSizing) -> EvalResult<Self> {
        debug!(
            "creating vector CPU backend: {} states, {} patterns, {} categories",
            sizing.state_count, sizing.pattern_count, sizing.category_count
        );
        Ok(Self {
            pool: BufferPool::new(sizing)?,
            mode: LoopMode::Vector,
            resource_index: 1,
        })
    }
}

impl LikelihoodBackend for CpuBackend {
    fn sizing(&self) -> &InstanceSizing {
        self.pool.sizing()
    }

    fn capabilities(&self) -> Capabilities {
        let base = Capabilities::PROCESSOR_CPU
            | Capabilities::PRECISION_DOUBLE
            | Capabilities::COMPUTATION_SYNCH;
        match self.mode {
            LoopMode::Scalar => base,
            LoopMode::Vector => {
                #[cfg(target_arch = "aarch64")]
                {
                    base | Capabilities::VECTOR_NEON
                }
                #[cfg(not(target_arch = "aarch64"))]
                {
                    base
                }
            }
        }
    }

    fn resource_index(&self) -> usize {
        self.resource_index
    }

    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> EvalResult<()> {
        self.pool.set_partials(buffer, partials)
    }

    fn get_partials(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.pool.get_partials(buffer, out)
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> EvalResult<()> {
        self.pool.set_tip_partials(tip, partials)
    }

    fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> EvalResult<()> {
        self.pool.set_tip_states(tip, states)
    }

    fn set_eigen_decomposition(
        &mut self,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()> {
        self.pool
            .set_eigen_decomposition(buffer, vectors, inverse_vectors, values)
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> EvalResult<()> {
        self.pool.set_category_rates(rates)
    }

    fn set_transition_matrix(&mut self, buffer: usize, matrix: &[f64]) -> EvalResult<()> {
        self.pool.set_transition_matrix(buffer, matrix)
    }

    fn get_transition_matrix(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.pool.get_transition_matrix(buffer, out)
    }

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        requests: &[MatrixRequest],
    ) -> EvalResult<()> {
        trace!("updating {} transition matrices from eigen {eigen}", requests.len());
        transition::update_transition_matrices(&mut self.pool, eigen, requests)
    }

    fn update_partials(&mut self, operations: &[PartialsOp], rescale: bool) -> EvalResult<()> {
        // The whole batch is validated before the first destination is
        // touched, so a bad entry anywhere leaves every buffer as it was.
        validate_operations(self.pool.sizing(), operations, rescale)?;
        trace!(
            "peeling {} operations ({})",
            operations.len(),
            if rescale { "rescaled" } else { "unscaled" }
        );
        let sizing = *self.pool.sizing();
        for op in operations {
            let views = self.pool.peel_views(op, rescale)?;
            peeling::peel(&sizing, views, self.mode);
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, scaling: usize) -> EvalResult<()> {
        self.pool.reset_scale_factors(scaling)
    }

    fn root_log_likelihoods(&mut self, roots: &[RootSpec<'_>], out: &mut [f64]) -> EvalResult<()> {
        integration::root_log_likelihoods(&self.pool, roots, out)
    }

    fn edge_log_likelihoods(
        &mut self,
        edges: &[EdgeSpec<'_>],
        out: &mut [f64],
        out_first: Option<&mut [f64]>,
        out_second: Option<&mut [f64]>,
    ) -> EvalResult<()> {
        integration::edge_log_likelihoods(&self.pool, edges, out, out_first, out_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: 1,
            category_count: 1,
            tip_count: 2,
            partials_buffer_count: 4,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    /// Jukes-Cantor eigen-system (see transition kernel tests).
    fn set_jc_eigen(backend: &mut CpuBackend) {
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
        backend
            .set_eigen_decomposition(0, &vectors, &inverse, &values)
            .unwrap();
    }

    /// The classic two-tip sanity check: both tips in state 0, branch length
    /// t on each side, JC model, uniform frequencies. The likelihood is
    /// 0.25·(0.25 + 0.75·exp(−4/3·2t)).
    #[test]
    fn two_tip_jukes_cantor_likelihood() {
        let mut backend = CpuBackend::scalar(sizing()).unwrap();
        set_jc_eigen(&mut backend);
        backend.set_tip_states(0, &[0]).unwrap();
        backend.set_tip_states(1, &[0]).unwrap();

        let t = 0.1;
        backend
            .update_transition_matrices(
                0,
                &[
                    MatrixRequest::probabilities(0, t),
                    MatrixRequest::probabilities(1, t),
                ],
            )
            .unwrap();
        backend
            .update_partials(&[PartialsOp::new(2, 0, 0, 1, 1)], false)
            .unwrap();

        let mut out = [0.0];
        backend
            .root_log_likelihoods(
                &[RootSpec {
                    partials: 2,
                    category_weights: &[1.0],
                    state_frequencies: &[0.25; 4],
                    scale_buffers: &[],
                }],
                &mut out,
            )
            .unwrap();

        let expected = (0.25 * (0.25 + 0.75 * (-4.0 / 3.0 * 2.0 * t).exp())).ln();
        assert!((out[0] - expected).abs() < 1e-10, "{} vs {expected}", out[0]);
    }

    #[test]
    fn invalid_batch_leaves_state_untouched() {
        let mut backend = CpuBackend::scalar(sizing()).unwrap();
        backend.set_partials(0, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        backend.set_partials(1, &[0.4, 0.3, 0.2, 0.1]).unwrap();
        backend.set_partials(2, &[9.0, 9.0, 9.0, 9.0]).unwrap();
        backend
            .set_transition_matrix(0, &{
                let mut identity = vec![0.0; 16];
                for s in 0..4 {
                    identity[s * 4 + s] = 1.0;
                }
                identity
            })
            .unwrap();

        // Second op is out of range; the first must not run.
        let ops = [
            PartialsOp::new(2, 0, 0, 1, 0),
            PartialsOp::new(3, 2, 0, 9, 0),
        ];
        assert!(backend.update_partials(&ops, false).is_err());

        let mut untouched = [0.0; 4];
        backend.get_partials(2, &mut untouched).unwrap();
        assert_eq!(untouched, [9.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn capabilities_report_the_engine() {
        let scalar = CpuBackend::scalar(sizing()).unwrap();
        assert!(scalar.capabilities().satisfies(
            Capabilities::PROCESSOR_CPU
                | Capabilities::PRECISION_DOUBLE
                | Capabilities::COMPUTATION_SYNCH
        ));
        assert_eq!(scalar.resource_index(), 0);

        let vector = CpuBackend::vectorized(sizing()).unwrap();
        assert_eq!(vector.resource_index(), 1);
    }
}
