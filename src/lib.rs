//! # expandr
//!
//! **Shape-static tensor-graph expansion of batched, blocked linear-algebra
//! decompositions.**
//!
//! expandr rewrites an opaque "QR decomposition" operation into a dataflow
//! graph over a small set of primitive tensor ops: slice, broadcast,
//! elementwise arithmetic, reductions, batched matmul, and static-trip
//! counted loops. The emitted graph runs on any backend that implements the
//! primitives; no bespoke linear-algebra kernel is required.
//!
//! ## Why a graph?
//!
//! - **Static shapes**: every tensor's shape is fixed when the graph is
//!   built; the algorithm masks full-width tensors instead of shrinking
//!   sub-panels, so backends never see data-dependent shapes
//! - **Batched**: one decomposition per batch element, with no per-batch
//!   branching anywhere in the graph
//! - **Blocked + compact-WY**: panel reflectors are aggregated into
//!   `I - Y T Y^T` block updates, so the bulk of the work is matmul
//! - **Deterministic**: building twice from the same operand signature
//!   yields structurally equal graphs, so shape-keyed caching is sound
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use expandr::prelude::*;
//!
//! let mut g = Graph::new();
//! let a = g.parameter([3, 3], DType::F64);
//! let qr = build_qr(&mut g, a, 128, Precision::Highest)?;
//! g.set_outputs(&[qr]);
//!
//! let input = Tensor::from_slice(&[12.0, -51.0, 4.0, 6.0, 167.0, -68.0, -4.0, 24.0, -41.0], [3, 3]);
//! let out = Evaluator::new(&g).run(&[input])?;
//! let (q, r) = (out[0].as_tuple()?[0].as_tensor()?, out[0].as_tuple()?[1].as_tensor()?);
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): multi-threaded batched matmul in the reference
//!   backend

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod dtype;
pub mod error;
pub mod expand;
pub mod graph;
pub mod runtime;
pub mod tensor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::expand::{build_qr, QrExpander, DEFAULT_BLOCK_SIZE};
    pub use crate::graph::{Graph, Precision, TensorRef};
    pub use crate::runtime::{Evaluator, Value};
    pub use crate::tensor::{Shape, Tensor};
}
