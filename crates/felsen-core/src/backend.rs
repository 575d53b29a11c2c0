//! The backend trait
//!
//! Every engine — scalar CPU, vectorized CPU, Metal GPU — implements this one
//! capability set. The engine is chosen once at instance creation, so kernel
//! inner loops stay monomorphic behind a single `Box<dyn LikelihoodBackend>`
//! dispatch per call.
//!
//! All slices at this boundary are caller-allocated transient I/O windows;
//! implementations copy across, never retain.

use crate::error::EvalResult;
use crate::flags::Capabilities;
use crate::ops::PartialsOp;
use crate::sizing::InstanceSizing;

/// One transition-matrix computation request: which matrix buffer to fill
/// from the eigen-decomposition, optionally with branch-length derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatrixRequest {
    /// Destination transition-matrix buffer.
    pub matrix: usize,
    /// Optional destination for `dM/dt`.
    pub first_derivative: Option<usize>,
    /// Optional destination for `d²M/dt²`.
    pub second_derivative: Option<usize>,
    /// Branch length. Negative lengths are clamped to zero, uniformly across
    /// backends.
    pub edge_length: f64,
}

impl MatrixRequest {
    /// Probability matrix only, no derivatives.
    pub fn probabilities(matrix: usize, edge_length: f64) -> Self {
        Self {
            matrix,
            first_derivative: None,
            second_derivative: None,
            edge_length,
        }
    }
}

/// One root integration term.
///
/// When several roots are integrated in one call, each root's per-category
/// weight row carries any per-root weight the caller wants applied; the
/// per-root site log-likelihoods are then summed.
#[derive(Debug, Clone, Copy)]
pub struct RootSpec<'a> {
    /// Root partials buffer.
    pub partials: usize,
    /// Category weights, length `category_count`.
    pub category_weights: &'a [f64],
    /// State frequencies at the root, length `state_count`.
    pub state_frequencies: &'a [f64],
    /// Scaling-factor buffers whose per-pattern log scalers are added back
    /// into the site log-likelihoods.
    pub scale_buffers: &'a [usize],
}

/// One edge integration term: parent and child partials joined through the
/// transition matrix (and optional derivative matrices) of the connecting
/// edge. This is the kernel branch-length optimizers drive.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSpec<'a> {
    /// Parent partials buffer.
    pub parent: usize,
    /// Child partials (or compact tip) buffer.
    pub child: usize,
    /// Transition-matrix buffer for the edge.
    pub matrix: usize,
    /// First-derivative matrix buffer, required when `out_first` is wanted.
    pub first_derivative: Option<usize>,
    /// Second-derivative matrix buffer, required when `out_second` is wanted.
    pub second_derivative: Option<usize>,
    /// Category weights, length `category_count`.
    pub category_weights: &'a [f64],
    /// State frequencies, length `state_count`.
    pub state_frequencies: &'a [f64],
    /// Scaling-factor buffers added back into the site log-likelihoods.
    pub scale_buffers: &'a [usize],
}

/// The uniform engine capability set.
///
/// Implementations own their buffer pool in device-appropriate memory. A
/// backend is `Send` so an instance can migrate between caller threads, but
/// not `Sync`: a single instance is driven by one thread at a time.
pub trait LikelihoodBackend: Send {
    /// The sizing this backend's pool was allocated against.
    fn sizing(&self) -> &InstanceSizing;

    /// Effective capability flags (not the caller's preferences).
    fn capabilities(&self) -> Capabilities;

    /// Registry index of the resource this backend runs on.
    fn resource_index(&self) -> usize;

    /// Complete deferred device setup (pipeline compilation and the like).
    /// Synchronous CPU engines have nothing to defer.
    fn initialize(&mut self) -> EvalResult<()> {
        Ok(())
    }

    /// Copy partials in, layout `[category][pattern][state]`, state fastest.
    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> EvalResult<()>;

    /// Copy partials out. Blocks until any pending asynchronous write to the
    /// buffer has completed.
    fn get_partials(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()>;

    /// Copy partials for a tip from a `state_count · pattern_count`
    /// observation matrix, replicated across rate categories.
    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> EvalResult<()>;

    /// Copy compact states into a tip buffer. Each entry must lie in
    /// `0..=state_count`; `state_count` is the missing/ambiguous sentinel.
    fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> EvalResult<()>;

    /// Copy an eigen-decomposition `(U, U⁻¹, λ)` in, row-major.
    fn set_eigen_decomposition(
        &mut self,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()>;

    /// Copy the instance-level category rate scalers in.
    fn set_category_rates(&mut self, rates: &[f64]) -> EvalResult<()>;

    /// Copy a closed-form transition matrix in, bypassing the eigen path.
    /// Write-wins: a later `update_transition_matrices` on the same index
    /// simply overwrites it, and vice versa.
    fn set_transition_matrix(&mut self, buffer: usize, matrix: &[f64]) -> EvalResult<()>;

    /// Copy a transition matrix out.
    fn get_transition_matrix(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()>;

    /// For each request, compute `M[c] = U·diag(exp(λ·t·r_c))·U⁻¹` per rate
    /// category into the request's matrix buffer, plus first/second
    /// branch-length derivatives where asked.
    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        requests: &[MatrixRequest],
    ) -> EvalResult<()>;

    /// Execute a peeling batch in list order. With `rescale`, per-pattern
    /// maxima are divided out of each destination and their logs recorded in
    /// the operation's scaling buffer.
    ///
    /// Asynchronous backends may return after enqueueing; the results become
    /// observable through [`LikelihoodBackend::wait_for_partials`] or any
    /// read of the destination.
    fn update_partials(&mut self, operations: &[PartialsOp], rescale: bool) -> EvalResult<()>;

    /// Block until every listed destination buffer is stable in memory.
    /// No-op on synchronous backends.
    fn wait_for_partials(&mut self, destinations: &[usize]) -> EvalResult<()> {
        let _ = destinations;
        Ok(())
    }

    /// Zero a scaling-factor buffer so its history can be recycled.
    fn reset_scale_factors(&mut self, scaling: usize) -> EvalResult<()>;

    /// Integrate root partials into site log-likelihoods, summing across the
    /// listed roots and adding back accumulated scaling factors.
    fn root_log_likelihoods(&mut self, roots: &[RootSpec<'_>], out: &mut [f64]) -> EvalResult<()>;

    /// Like root integration with a transition matrix inserted along one
    /// edge, optionally yielding first and second derivatives of the site
    /// log-likelihoods with respect to the edge length.
    fn edge_log_likelihoods(
        &mut self,
        edges: &[EdgeSpec<'_>],
        out: &mut [f64],
        out_first: Option<&mut [f64]>,
        out_second: Option<&mut [f64]>,
    ) -> EvalResult<()>;
}
