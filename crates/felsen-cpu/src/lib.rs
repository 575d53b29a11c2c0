//! CPU backends for the Felsen likelihood evaluator
//!
//! Two engines share this crate: the scalar double-precision baseline and a
//! vectorized variant that uses NEON inner products on aarch64 plus
//! pattern-parallel threading for large pattern counts. Both run the same
//! four kernels over the same buffer pool; the vector engine differs only in
//! how the innermost state loops are executed.
//!
//! The kernels are exposed as plain-slice functions so other backends can
//! borrow the host-side pieces (the Metal engine computes its transition
//! matrices here before uploading them).

pub mod backend;
pub mod integration;
pub mod peeling;
pub mod pool;
pub mod transition;

mod simd;

pub use backend::CpuBackend;
pub use pool::{BufferPool, EigenDecomposition};
