//! Handle-based instance registry
//!
//! The procedural boundary: integer handles in, status codes out. Each slot
//! holds an `Arc<Mutex<Instance>>`, so distinct handles can be driven from
//! distinct threads without coordination while a single handle still
//! serializes its calls. Handles are recycled after finalization; any use of
//! a finalized handle reports an uninitialized instance.

use std::sync::{Arc, Mutex};

use log::debug;

use felsen_core::{
    Capabilities, EdgeSpec, EvalError, EvalResult, InstanceSizing, MatrixRequest, PartialsOp,
    RootSpec,
};

use crate::instance::{Instance, InstanceDetails};
use crate::scheduler;

type Slot = Option<Arc<Mutex<Instance>>>;

/// Registry mapping non-negative integer handles to live instances.
#[derive(Default)]
pub struct InstanceRegistry {
    slots: Mutex<Vec<Slot>>,
}

fn poisoned(_: impl std::fmt::Debug) -> EvalError {
    EvalError::UnidentifiedException("lock poisoned".to_string())
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance and return its handle. The lowest free slot is
    /// reused, so handles stay small and dense across proposal cycles.
    pub fn create(
        &self,
        sizing: InstanceSizing,
        allowed_resources: Option<&[usize]>,
        preferred: Capabilities,
        required: Capabilities,
    ) -> EvalResult<i32> {
        let instance = Instance::create(sizing, allowed_resources, preferred, required)?;
        let mut slots = self.slots.lock().map_err(poisoned)?;
        let slot = slots.iter().position(Option::is_none).unwrap_or_else(|| {
            slots.push(None);
            slots.len() - 1
        });
        slots[slot] = Some(Arc::new(Mutex::new(instance)));
        debug!("instance handle {slot} created");
        Ok(slot as i32)
    }

    /// Finish backend initialization and report the effective details.
    pub fn initialize(&self, handle: i32) -> EvalResult<InstanceDetails> {
        let instance = self.instance(handle)?;
        let mut instance = instance.lock().map_err(poisoned)?;
        instance.initialize()
    }

    /// Release the instance and recycle its handle.
    pub fn finalize(&self, handle: i32) -> EvalResult<()> {
        let index = usize::try_from(handle).map_err(|_| EvalError::UninitializedInstance)?;
        let mut slots = self.slots.lock().map_err(poisoned)?;
        match slots.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!("instance handle {handle} finalized");
                Ok(())
            }
            _ => Err(EvalError::UninitializedInstance),
        }
    }

    fn instance(&self, handle: i32) -> EvalResult<Arc<Mutex<Instance>>> {
        let index = usize::try_from(handle).map_err(|_| EvalError::UninitializedInstance)?;
        let slots = self.slots.lock().map_err(poisoned)?;
        slots
            .get(index)
            .and_then(Clone::clone)
            .ok_or(EvalError::UninitializedInstance)
    }

    fn with_instance<T>(
        &self,
        handle: i32,
        f: impl FnOnce(&mut Instance) -> EvalResult<T>,
    ) -> EvalResult<T> {
        let instance = self.instance(handle)?;
        let mut instance = instance.lock().map_err(poisoned)?;
        f(&mut instance)
    }

    // ------------------------------------------------------------------
    // Delegated operations
    // ------------------------------------------------------------------

    pub fn set_partials(&self, handle: i32, buffer: usize, partials: &[f64]) -> EvalResult<()> {
        self.with_instance(handle, |i| i.set_partials(buffer, partials))
    }

    pub fn get_partials(&self, handle: i32, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.with_instance(handle, |i| i.get_partials(buffer, out))
    }

    pub fn set_tip_partials(&self, handle: i32, tip: usize, partials: &[f64]) -> EvalResult<()> {
        self.with_instance(handle, |i| i.set_tip_partials(tip, partials))
    }

    pub fn set_tip_states(&self, handle: i32, tip: usize, states: &[u32]) -> EvalResult<()> {
        self.with_instance(handle, |i| i.set_tip_states(tip, states))
    }

    pub fn set_eigen_decomposition(
        &self,
        handle: i32,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| {
            i.set_eigen_decomposition(buffer, vectors, inverse_vectors, values)
        })
    }

    pub fn set_category_rates(&self, handle: i32, rates: &[f64]) -> EvalResult<()> {
        self.with_instance(handle, |i| i.set_category_rates(rates))
    }

    pub fn set_transition_matrix(
        &self,
        handle: i32,
        buffer: usize,
        matrix: &[f64],
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| i.set_transition_matrix(buffer, matrix))
    }

    pub fn get_transition_matrix(
        &self,
        handle: i32,
        buffer: usize,
        out: &mut [f64],
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| i.get_transition_matrix(buffer, out))
    }

    pub fn update_transition_matrices(
        &self,
        handle: i32,
        eigen: usize,
        requests: &[MatrixRequest],
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| i.update_transition_matrices(eigen, requests))
    }

    /// Dispatch one operation list to every listed handle, in list order per
    /// handle. The whole batch is validated against every instance before
    /// any instance executes.
    pub fn update_partials(
        &self,
        handles: &[i32],
        operations: &[PartialsOp],
        rescale: bool,
    ) -> EvalResult<()> {
        scheduler::update_partials_batch(self, handles, operations, rescale)
    }

    /// Block until the listed destinations are stable on every listed
    /// handle.
    pub fn wait_for_partials(&self, handles: &[i32], destinations: &[usize]) -> EvalResult<()> {
        for &handle in handles {
            self.with_instance(handle, |i| i.wait_for_partials(destinations))?;
        }
        Ok(())
    }

    pub fn reset_scale_factors(&self, handle: i32, scaling: usize) -> EvalResult<()> {
        self.with_instance(handle, |i| i.reset_scale_factors(scaling))
    }

    pub fn root_log_likelihoods(
        &self,
        handle: i32,
        roots: &[RootSpec<'_>],
        out: &mut [f64],
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| i.root_log_likelihoods(roots, out))
    }

    pub fn edge_log_likelihoods(
        &self,
        handle: i32,
        edges: &[EdgeSpec<'_>],
        out: &mut [f64],
        out_first: Option<&mut [f64]>,
        out_second: Option<&mut [f64]>,
    ) -> EvalResult<()> {
        self.with_instance(handle, |i| {
            i.edge_log_likelihoods(edges, out, out_first, out_second)
        })
    }

    pub(crate) fn instance_for_scheduler(
        &self,
        handle: i32,
    ) -> EvalResult<Arc<Mutex<Instance>>> {
        self.instance(handle)
    }
}
