//! Capability flags for resources and instances
//!
//! A single bitmask describes both what a resource *supports* and what a
//! caller *wants*: precision, synchrony, device class, and SIMD extensions.
//! Requirement flags are hard constraints during backend selection;
//! preference flags are soft and only rank candidates.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Closed capability set used for resource description and for instance
    /// creation preferences/requirements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        /// Single-precision (f32) arithmetic.
        const PRECISION_SINGLE = 1 << 0;
        /// Double-precision (f64) arithmetic.
        const PRECISION_DOUBLE = 1 << 1;
        /// Kernels complete before the call returns.
        const COMPUTATION_SYNCH = 1 << 2;
        /// Kernels may be enqueued; reads and wait barriers synchronize.
        const COMPUTATION_ASYNCH = 1 << 3;
        /// General-purpose CPU.
        const PROCESSOR_CPU = 1 << 4;
        /// Graphics processor.
        const PROCESSOR_GPU = 1 << 5;
        /// FPGA accelerator.
        const PROCESSOR_FPGA = 1 << 6;
        /// Cell-class accelerator.
        const PROCESSOR_CELL = 1 << 7;
        /// x86 SSE vector units.
        const VECTOR_SSE = 1 << 8;
        /// ARM NEON vector units.
        const VECTOR_NEON = 1 << 9;
    }
}

impl Capabilities {
    /// True when every flag in `required` is present. Requirement flags are
    /// hard: a resource missing any of them is rejected outright.
    pub fn satisfies(self, required: Capabilities) -> bool {
        self.contains(required)
    }

    /// Number of `preferred` flags this set matches. Preference flags are
    /// soft: candidates are ranked by this score, registry order breaking
    /// ties.
    pub fn preference_score(self, preferred: Capabilities) -> u32 {
        (self & preferred).bits().count_ones()
    }
}
