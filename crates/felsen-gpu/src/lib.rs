//! Metal GPU backend for the Felsen likelihood evaluator
//!
//! Single-precision, asynchronous. All device buffers live in shared
//! (unified) memory, so host-side setters write straight into GPU-visible
//! storage and integration outputs read straight back without staging
//! copies.
//!
//! ## Asynchrony
//!
//! `update_partials` encodes its whole operation batch into one command
//! buffer — Metal's automatic hazard tracking orders the passes over their
//! shared buffers, which matches the operation list's dependency order — and
//! returns after commit. Reads (`get_partials`, the integration kernels) and
//! `wait_for_partials` are the synchronization points.
//!
//! ## Division of labor
//!
//! Transition matrices are computed on the host with the shared eigen kernel
//! and written into device memory: the eigen transform is `O(S³·C)` per
//! branch, negligible next to the `O(S²·P·C)` peeling work that stays on the
//! GPU. Peeling and integration run as compute kernels, one thread per site
//! pattern.

#![cfg(target_os = "macos")]

use log::debug;
use metal::{
    Buffer, CommandBuffer, CommandQueue, CompileOptions, ComputePipelineState, Device, Library,
    MTLResourceOptions, MTLSize,
};
use std::collections::HashMap;

use felsen_core::{EvalError, EvalResult, InstanceSizing};

mod backend;

/// Kernel entry points compiled from the shader library.
const KERNEL_NAMES: [&str; 6] = [
    "peel_partials_partials",
    "peel_states_partials",
    "peel_states_states",
    "integrate_root",
    "integrate_edge_partials",
    "integrate_edge_states",
];

/// Metal likelihood engine. One per instance; owns every device allocation.
pub struct MetalBackend {
    sizing: InstanceSizing,
    device: Device,
    queue: CommandQueue,
    /// Compiled on `initialize`, not on creation.
    pipelines: Option<HashMap<&'static str, ComputePipelineState>>,

    partials: Vec<Buffer>,
    scale_factors: Vec<Buffer>,
    matrices: Vec<Buffer>,
    tip_states: Vec<Option<Buffer>>,
    /// Per-pattern output vectors for the integration kernels.
    site_out: Buffer,
    site_d1: Buffer,
    site_d2: Buffer,

    /// Host-side eigen systems and rates; only their matrix products travel
    /// to the device.
    eigens: Vec<felsen_cpu::EigenDecomposition>,
    category_rates: Vec<f64>,

    /// Last command buffer writing each partials destination.
    pending: HashMap<usize, CommandBuffer>,
}

// MTLDevice and MTLCommandQueue are documented thread-safe; everything else
// in here is reached through one owner at a time (an instance is never
// driven from two threads concurrently).
unsafe impl Send for MetalBackend {}

impl MetalBackend {
    pub fn new(sizing: InstanceSizing) -> EvalResult<Self> {
        sizing.validate()?;
        let device = Device::system_default()
            .ok_or_else(|| EvalError::General("no Metal device available".to_string()))?;
        debug!("creating Metal backend on {}", device.name());
        let queue = device.new_command_queue();

        let float_buffer = |len: usize| -> Buffer {
            device.new_buffer(
                (len * std::mem::size_of::<f32>()) as u64,
                MTLResourceOptions::StorageModeShared,
            )
        };

        let partials: Vec<Buffer> = (0..sizing.partials_buffer_count)
            .map(|_| float_buffer(sizing.partials_len()))
            .collect();
        let scale_factors: Vec<Buffer> = (0..sizing.partials_buffer_count)
            .map(|_| float_buffer(sizing.pattern_count))
            .collect();
        let matrices: Vec<Buffer> = (0..sizing.matrix_buffer_count)
            .map(|_| float_buffer(sizing.matrix_len()))
            .collect();
        let site_out = float_buffer(sizing.pattern_count);
        let site_d1 = float_buffer(sizing.pattern_count);
        let site_d2 = float_buffer(sizing.pattern_count);

        let eigens = (0..sizing.eigen_buffer_count)
            .map(|_| felsen_cpu::EigenDecomposition {
                vectors: vec![0.0; sizing.eigen_len()],
                inverse_vectors: vec![0.0; sizing.eigen_len()],
                values: vec![0.0; sizing.state_count],
                populated: false,
            })
            .collect();

        Ok(Self {
            device,
            queue,
            pipelines: None,
            partials,
            scale_factors,
            matrices,
            tip_states: vec![None; sizing.compact_buffer_count],
            site_out,
            site_d1,
            site_d2,
            eigens,
            category_rates: vec![1.0; sizing.category_count],
            pending: HashMap::new(),
            sizing,
        })
    }

    /// Compile the shader library and one pipeline per kernel. Deferred to
    /// `initialize` so creation stays cheap and compilation failures arrive
    /// through the documented initialization path.
    fn compile_pipelines(&mut self) -> EvalResult<()> {
        if self.pipelines.is_some() {
            return Ok(());
        }
        let source = include_str!("shaders/likelihood.metal");
        let library: Library = self
            .device
            .new_library_with_source(source, &CompileOptions::new())
            .map_err(|e| EvalError::UnidentifiedException(format!("shader compile: {e}")))?;

        let mut pipelines = HashMap::new();
        for name in KERNEL_NAMES {
            let function = library
                .get_function(name, None)
                .map_err(|e| EvalError::UnidentifiedException(format!("kernel {name}: {e}")))?;
            let pipeline = self
                .device
                .new_compute_pipeline_state_with_function(&function)
                .map_err(|e| EvalError::UnidentifiedException(format!("pipeline {name}: {e}")))?;
            pipelines.insert(name, pipeline);
        }
        self.pipelines = Some(pipelines);
        debug!("Metal pipelines compiled ({} kernels)", KERNEL_NAMES.len());
        Ok(())
    }

    fn pipeline(&self, name: &'static str) -> EvalResult<&ComputePipelineState> {
        self.pipelines
            .as_ref()
            .and_then(|p| p.get(name))
            .ok_or(EvalError::UninitializedInstance)
    }

    /// 1D dispatch geometry: one thread per pattern.
    fn pattern_grid(&self, pipeline: &ComputePipelineState) -> (MTLSize, MTLSize) {
        let width = pipeline
            .max_total_threads_per_threadgroup()
            .min(256)
            .max(1);
        let patterns = self.sizing.pattern_count as u64;
        let groups = patterns.div_ceil(width);
        (MTLSize::new(groups, 1, 1), MTLSize::new(width, 1, 1))
    }

    /// Block until a pending write to `buffer` (if any) has landed.
    fn sync_buffer(&mut self, buffer: usize) {
        if let Some(command) = self.pending.remove(&buffer) {
            command.wait_until_completed();
        }
    }

    /// Block until every enqueued write has landed.
    fn sync_all(&mut self) {
        for (_, command) in self.pending.drain() {
            command.wait_until_completed();
        }
    }

    /// A small shared-memory buffer holding caller-supplied reals as f32.
    fn upload_f32(&self, values: &[f64]) -> Buffer {
        let converted: Vec<f32> = values.iter().map(|&v| v as f32).collect();
        self.device.new_buffer_with_data(
            converted.as_ptr() as *const std::ffi::c_void,
            std::mem::size_of_val(converted.as_slice()) as u64,
            MTLResourceOptions::StorageModeShared,
        )
    }

    fn write_f32(buffer: &Buffer, values: &[f64]) {
        let contents = buffer.contents() as *mut f32;
        // SAFETY: every device buffer was sized for exactly this many f32
        // entries at creation, and callers synchronize in-flight GPU work
        // before host writes.
        unsafe {
            for (i, &value) in values.iter().enumerate() {
                *contents.add(i) = value as f32;
            }
        }
    }

    fn read_f32(buffer: &Buffer, out: &mut [f64]) {
        let contents = buffer.contents() as *const f32;
        // SAFETY: as above; reads follow a completed wait.
        unsafe {
            for (i, entry) in out.iter_mut().enumerate() {
                *entry = *contents.add(i) as f64;
            }
        }
    }

    fn check_index(&self, what: &'static str, index: usize, limit: usize) -> EvalResult<()> {
        if index >= limit {
            return Err(EvalError::out_of_range(what, index, limit));
        }
        Ok(())
    }

    fn check_len(what: &'static str, got: usize, want: usize) -> EvalResult<()> {
        if got != want {
            return Err(EvalError::out_of_range(what, got, want));
        }
        Ok(())
    }
}
