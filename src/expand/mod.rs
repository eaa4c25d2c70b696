//! Graph expansions of opaque linear-algebra operations
//!
//! An expansion rewrites one opaque operation into a subgraph of primitive
//! ops, built once per operand signature. [`QrExpander`] wraps the QR
//! expansion with the shape-keyed cache its callers want: construction is a
//! pure function of `(shape, dtype)`, so a cached graph is indistinguishable
//! from a rebuilt one.

mod qr;

pub use qr::{build_qr, compact_wy, qr_panel, PanelQr, DEFAULT_BLOCK_SIZE};

use crate::dtype::DType;
use crate::error::Result;
use crate::graph::{Graph, Precision};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds and caches QR expansion graphs keyed by operand signature
///
/// The emitted graph takes one parameter (the operand) and returns a tuple
/// `(Q, R)`. Expansions use [`DEFAULT_BLOCK_SIZE`] and
/// [`Precision::Highest`]; callers wanting other settings drive
/// [`build_qr`] on their own graph.
#[derive(Default)]
pub struct QrExpander {
    cache: Mutex<HashMap<(Vec<usize>, DType), Arc<Graph>>>,
}

impl QrExpander {
    /// Create an expander with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The QR expansion graph for an operand of `shape` and `dtype`.
    pub fn expand(&self, shape: &[usize], dtype: DType) -> Result<Arc<Graph>> {
        let key = (shape.to_vec(), dtype);
        if let Some(graph) = self.cache.lock().get(&key) {
            return Ok(graph.clone());
        }
        let mut g = Graph::new();
        let a = g.parameter(shape, dtype);
        let qr = build_qr(&mut g, a, DEFAULT_BLOCK_SIZE, Precision::Highest)?;
        g.set_outputs(&[qr]);
        let graph = Arc::new(g);
        self.cache.lock().insert(key, graph.clone());
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_returns_same_graph() {
        let expander = QrExpander::new();
        let g1 = expander.expand(&[3, 3], DType::F32).unwrap();
        let g2 = expander.expand(&[3, 3], DType::F32).unwrap();
        assert!(Arc::ptr_eq(&g1, &g2));
        let g3 = expander.expand(&[3, 3], DType::F64).unwrap();
        assert!(!Arc::ptr_eq(&g1, &g3));
    }

    #[test]
    fn test_rebuild_is_structurally_identical() {
        let e1 = QrExpander::new();
        let e2 = QrExpander::new();
        let g1 = e1.expand(&[2, 4, 3], DType::F64).unwrap();
        let g2 = e2.expand(&[2, 4, 3], DType::F64).unwrap();
        assert_eq!(*g1, *g2);
    }

    #[test]
    fn test_invalid_rank_rejected() {
        let expander = QrExpander::new();
        assert!(expander.expand(&[5], DType::F32).is_err());
    }
}
