//! Instance lifecycle: backend selection, initialization, delegation
//!
//! An instance is the unit of isolation: it owns one backend and, through
//! it, every buffer. Backend selection happens exactly once, at creation,
//! by scanning the resource registry in order — requirement flags are hard
//! filters, preference flags rank the survivors, registry order breaks ties.

use log::debug;

use felsen_core::{
    resources, Capabilities, EdgeSpec, EvalError, EvalResult, InstanceSizing, LikelihoodBackend,
    MatrixRequest, PartialsOp, Resource, ResourceKind, RootSpec,
};
use felsen_cpu::CpuBackend;

/// What `initialize` reports: where the instance landed and the effective
/// (not requested) capability flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDetails {
    pub resource_index: usize,
    pub resource_name: String,
    pub flags: Capabilities,
}

/// A likelihood evaluator bound to one backend.
///
/// Not `Sync`: a single instance is driven by one thread at a time. Distinct
/// instances are fully independent.
pub struct Instance {
    backend: Box<dyn LikelihoodBackend>,
    resource_name: String,
    initialized: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("resource_name", &self.resource_name)
            .field("initialized", &self.initialized)
            .finish()
    }
}

/// Pick the best registry entry for the given constraints.
fn select_resource(
    allowed: Option<&[usize]>,
    preferred: Capabilities,
    required: Capabilities,
) -> EvalResult<&'static Resource> {
    let mut best: Option<(&Resource, u32)> = None;
    for resource in resources() {
        if let Some(allowed) = allowed {
            if !allowed.contains(&resource.index) {
                continue;
            }
        }
        if !resource.supported.satisfies(required) {
            continue;
        }
        let score = resource.supported.preference_score(preferred);
        // Strictly-greater keeps the earliest entry on ties.
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((resource, score));
        }
    }
    best.map(|(resource, _)| resource).ok_or_else(|| {
        EvalError::General(format!(
            "no resource satisfies requirement flags {required:?}"
        ))
    })
}

fn build_backend(
    resource: &Resource,
    sizing: InstanceSizing,
) -> EvalResult<Box<dyn LikelihoodBackend>> {
    match resource.kind {
        ResourceKind::CpuScalar => Ok(Box::new(CpuBackend::scalar(sizing)?)),
        ResourceKind::CpuVector => Ok(Box::new(CpuBackend::vectorized(sizing)?)),
        #[cfg(all(feature = "gpu", target_os = "macos"))]
        ResourceKind::MetalGpu => Ok(Box::new(felsen_gpu::MetalBackend::new(sizing)?)),
        #[cfg(not(all(feature = "gpu", target_os = "macos")))]
        ResourceKind::MetalGpu => Err(EvalError::General(
            "GPU resource listed but not compiled in".to_string(),
        )),
    }
}

impl Instance {
    /// Select a backend and allocate every buffer. On failure nothing is
    /// created. The instance must still be initialized before use.
    pub fn create(
        sizing: InstanceSizing,
        allowed_resources: Option<&[usize]>,
        preferred: Capabilities,
        required: Capabilities,
    ) -> EvalResult<Self> {
        sizing.validate()?;
        let resource = select_resource(allowed_resources, preferred, required)?;
        debug!(
            "instance create: selected resource {} ({})",
            resource.index, resource.name
        );
        let backend = build_backend(resource, sizing)?;
        Ok(Self {
            backend,
            resource_name: resource.name.clone(),
            initialized: false,
        })
    }

    /// Complete deferred backend setup and report where the instance landed.
    pub fn initialize(&mut self) -> EvalResult<InstanceDetails> {
        self.backend.initialize()?;
        self.initialized = true;
        Ok(self.details())
    }

    /// The chosen resource and effective capability flags.
    pub fn details(&self) -> InstanceDetails {
        InstanceDetails {
            resource_index: self.backend.resource_index(),
            resource_name: self.resource_name.clone(),
            flags: self.backend.capabilities(),
        }
    }

    pub fn sizing(&self) -> &InstanceSizing {
        self.backend.sizing()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Every operation below requires a completed `initialize`; anything
    /// earlier (or after finalization through the registry) reports an
    /// uninitialized instance.
    fn ready(&self) -> EvalResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(EvalError::UninitializedInstance)
        }
    }

    pub fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.set_partials(buffer, partials)
    }

    pub fn get_partials(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.get_partials(buffer, out)
    }

    pub fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.set_tip_partials(tip, partials)
    }

    pub fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> EvalResult<()> {
        self.ready()?;
        self.backend.set_tip_states(tip, states)
    }

    pub fn set_eigen_decomposition(
        &mut self,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()> {
        self.ready()?;
        self.backend
            .set_eigen_decomposition(buffer, vectors, inverse_vectors, values)
    }

    pub fn set_category_rates(&mut self, rates: &[f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.set_category_rates(rates)
    }

    pub fn set_transition_matrix(&mut self, buffer: usize, matrix: &[f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.set_transition_matrix(buffer, matrix)
    }

    pub fn get_transition_matrix(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.ready()?;
        self.backend.get_transition_matrix(buffer, out)
    }

    pub fn update_transition_matrices(
        &mut self,
        eigen: usize,
        requests: &[MatrixRequest],
    ) -> EvalResult<()> {
        self.ready()?;
        self.backend.update_transition_matrices(eigen, requests)
    }

    pub fn update_partials(&mut self, operations: &[PartialsOp], rescale: bool) -> EvalResult<()> {
        self.ready()?;
        self.backend.update_partials(operations, rescale)
    }

    pub fn wait_for_partials(&mut self, destinations: &[usize]) -> EvalResult<()> {
        self.ready()?;
        self.backend.wait_for_partials(destinations)
    }

    pub fn reset_scale_factors(&mut self, scaling: usize) -> EvalResult<()> {
        self.ready()?;
        self.backend.reset_scale_factors(scaling)
    }

    pub fn root_log_likelihoods(
        &mut self,
        roots: &[RootSpec<'_>],
        out: &mut [f64],
    ) -> EvalResult<()> {
        self.ready()?;
        self.backend.root_log_likelihoods(roots, out)
    }

    pub fn edge_log_likelihoods(
        &mut self,
        edges: &[EdgeSpec<'_>],
        out: &mut [f64],
        out_first: Option<&mut [f64]>,
        out_second: Option<&mut [f64]>,
    ) -> EvalResult<()> {
        self.ready()?;
        self.backend
            .edge_log_likelihoods(edges, out, out_first, out_second)
    }
}
