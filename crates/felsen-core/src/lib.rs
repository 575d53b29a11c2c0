//! Core types and traits for the Felsen phylogenetic likelihood evaluator
//!
//! This crate provides the foundational vocabulary shared by every backend:
//! instance sizing, capability flags, the closed error taxonomy, the resource
//! registry, the operation list, and the backend trait itself.
//!
//! # Design Philosophy: One Dispatch Per Instance
//!
//! A likelihood evaluator is driven millions of times per analysis — once per
//! proposed tree change. Backend polymorphism therefore happens exactly once,
//! at instance creation: the caller picks a resource, the engine constructs a
//! backend for it, and every kernel afterwards runs monomorphic inner loops.
//! The trait in [`backend`] is that single seam.
//!
//! Buffers are owned by the instance and addressed by integer index. The
//! caller manages which index holds which node's partials; on a rejected
//! proposal it simply reuses the previous index. Nothing here allocates after
//! instance creation.

pub mod backend;
pub mod error;
pub mod flags;
pub mod ops;
pub mod resource;
pub mod sizing;

pub use backend::{EdgeSpec, LikelihoodBackend, MatrixRequest, RootSpec};
pub use error::{EvalError, EvalResult};
pub use flags::Capabilities;
pub use ops::{validate_operations, PartialsOp, OP_TUPLE_LEN};
pub use resource::{resources, Resource, ResourceKind};
pub use sizing::InstanceSizing;
