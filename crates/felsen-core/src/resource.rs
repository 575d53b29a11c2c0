//! Resource registry
//!
//! An ordered, read-only listing of the computational resources this build
//! can drive. The listing is computed once per process and never owns any
//! computation — it is a lookup service for backend selection.
//!
//! Entry order is meaningful: instance creation scans the registry in order
//! and breaks preference ties in favor of earlier entries, so the scalar CPU
//! engine is always the fallback of last resort at index 0.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::flags::Capabilities;

/// Which backend implementation a registry entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Scalar double-precision CPU engine.
    CpuScalar,
    /// Vectorized CPU engine (NEON on aarch64, scalar-equivalent elsewhere).
    CpuVector,
    /// Metal GPU engine (single precision, asynchronous).
    MetalGpu,
}

/// One entry in the resource registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Position in the registry; also the index reported by instance details.
    pub index: usize,
    /// Human-readable name.
    pub name: String,
    /// Longer description of the hardware path.
    pub description: String,
    /// Every capability the resource can run with.
    pub supported: Capabilities,
    /// Capabilities in effect when the resource is selected without further
    /// preference.
    pub defaults: Capabilities,
    /// Backend constructor this entry maps to.
    pub kind: ResourceKind,
}

fn build_registry() -> Vec<Resource> {
    let mut list = Vec::new();

    list.push(Resource {
        index: 0,
        name: "CPU (scalar)".to_string(),
        description: "Scalar double-precision CPU engine".to_string(),
        supported: Capabilities::PROCESSOR_CPU
            | Capabilities::PRECISION_DOUBLE
            | Capabilities::COMPUTATION_SYNCH,
        defaults: Capabilities::PROCESSOR_CPU
            | Capabilities::PRECISION_DOUBLE
            | Capabilities::COMPUTATION_SYNCH,
        kind: ResourceKind::CpuScalar,
    });

    // The NEON flag is published only where the dedicated path exists; the
    // vector engine's loops fall back to scalar arithmetic on other targets.
    let vector_caps = Capabilities::PROCESSOR_CPU
        | Capabilities::PRECISION_DOUBLE
        | Capabilities::COMPUTATION_SYNCH;
    #[cfg(target_arch = "aarch64")]
    let vector_caps = vector_caps | Capabilities::VECTOR_NEON;
    list.push(Resource {
        index: 1,
        name: "CPU (vector)".to_string(),
        description: "Vectorized CPU engine with pattern-parallel threading".to_string(),
        supported: vector_caps,
        defaults: vector_caps,
        kind: ResourceKind::CpuVector,
    });

    #[cfg(all(feature = "gpu", target_os = "macos"))]
    {
        let gpu_caps = Capabilities::PROCESSOR_GPU
            | Capabilities::PRECISION_SINGLE
            | Capabilities::COMPUTATION_ASYNCH;
        list.push(Resource {
            index: 2,
            name: "GPU (Metal)".to_string(),
            description: "Metal compute engine, single precision, asynchronous".to_string(),
            supported: gpu_caps,
            defaults: gpu_caps,
            kind: ResourceKind::MetalGpu,
        });
    }

    list
}

/// The process-wide resource listing, computed on first use.
pub fn resources() -> &'static [Resource] {
    static REGISTRY: OnceLock<Vec<Resource>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}
