//! Operation scheduler
//!
//! Interprets a batched operation list: validates every entry against every
//! target instance before anything runs, then dispatches the list in order
//! to each handle. List order *is* the dependency order — an operation may
//! consume any earlier operation's destination, so no reordering happens
//! here. Asynchronous backends are free to overlap work internally as long
//! as they honor that order; the scheduler itself never inserts barriers.

use log::trace;

use felsen_core::{validate_operations, EvalResult, PartialsOp};

use crate::registry::InstanceRegistry;

/// Dispatch one operation list to every listed handle.
///
/// The same list goes to each instance — the multi-handle form exists to
/// batch identically-shaped independent instances (e.g. parallel MCMC
/// chains), not to split work.
pub(crate) fn update_partials_batch(
    registry: &InstanceRegistry,
    handles: &[i32],
    operations: &[PartialsOp],
    rescale: bool,
) -> EvalResult<()> {
    // Validation pass first: a bad entry anywhere must leave every instance
    // in the batch untouched, including instances earlier in the handle
    // list.
    for &handle in handles {
        let instance = registry.instance_for_scheduler(handle)?;
        let instance = instance
            .lock()
            .map_err(|_| felsen_core::EvalError::UnidentifiedException("lock poisoned".into()))?;
        if !instance.is_initialized() {
            return Err(felsen_core::EvalError::UninitializedInstance);
        }
        validate_operations(instance.sizing(), operations, rescale)?;
    }

    trace!(
        "dispatching {} operations to {} instance(s)",
        operations.len(),
        handles.len()
    );
    for &handle in handles {
        let instance = registry.instance_for_scheduler(handle)?;
        let mut instance = instance
            .lock()
            .map_err(|_| felsen_core::EvalError::UnidentifiedException("lock poisoned".into()))?;
        instance.update_partials(operations, rescale)?;
    }
    Ok(())
}
