//! Instance management and operation scheduling for the Felsen evaluator
//!
//! This crate is the surface a phylogenetic inference engine links against.
//! It selects a backend for each new instance by matching the caller's
//! preference and requirement flags against the resource registry, tracks
//! initialization state, and dispatches batched peeling operations.
//!
//! Two surfaces share the same machinery:
//! - [`Instance`] is the idiomatic object: create it, initialize it, call
//!   methods on it.
//! - [`InstanceRegistry`] is the procedural boundary: non-negative integer
//!   handles, recycled after finalization, safe to drive from one thread per
//!   handle without further coordination.
//!
//! # Example
//!
//! ```no_run
//! use felsen_core::{Capabilities, InstanceSizing};
//! use felsen_engine::Instance;
//!
//! let sizing = InstanceSizing {
//!     state_count: 4,
//!     pattern_count: 1000,
//!     category_count: 4,
//!     tip_count: 16,
//!     partials_buffer_count: 32,
//!     compact_buffer_count: 16,
//!     eigen_buffer_count: 1,
//!     matrix_buffer_count: 30,
//! };
//! let mut instance = Instance::create(
//!     sizing,
//!     None,
//!     Capabilities::VECTOR_NEON,
//!     Capabilities::PRECISION_DOUBLE,
//! ).unwrap();
//! let details = instance.initialize().unwrap();
//! println!("running on {}", details.resource_name);
//! ```

pub mod instance;
pub mod registry;
pub mod scheduler;

pub use felsen_core::{
    resources, Capabilities, EdgeSpec, EvalError, EvalResult, InstanceSizing, MatrixRequest,
    PartialsOp, Resource, RootSpec,
};
pub use instance::{Instance, InstanceDetails};
pub use registry::InstanceRegistry;
