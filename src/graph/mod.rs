//! Expansion graph: an append-only arena of primitive tensor operations
//!
//! A [`Graph`] is built once per operand signature and handed to a backend.
//! Handles ([`TensorRef`]) are symbolic: they name a node whose shape and
//! dtype are known at construction time, never its data. Construction is a
//! pure function of its inputs — no addresses, clocks, or global counters
//! enter the structure — so two graphs built from the same arguments compare
//! equal node-for-node. Shape-keyed caching of built graphs relies on this.

mod builder;
mod matrix;
mod op;

pub use op::{BinaryOp, CompareOp, ConstValue, Op, Precision, UnaryOp};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Shape;

/// Index of a node within its graph's arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Arena position of the node.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Graph-time handle to a node's value
///
/// Carries no shape or data; the owning [`Graph`] answers shape and dtype
/// queries. Handles from one graph are meaningless in another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorRef {
    pub(crate) id: NodeId,
}

impl TensorRef {
    /// The node this handle names.
    #[inline]
    pub fn id(self) -> NodeId {
        self.id
    }
}

/// Static type of a node's value: a tensor or a tuple of values
#[derive(Clone, Debug, PartialEq)]
pub enum ValueType {
    /// A tensor with static shape and element type
    Tensor {
        /// The static shape
        shape: Shape,
        /// The element type
        dtype: DType,
    },
    /// A tuple of values (loop state, multi-result roots)
    Tuple(Vec<ValueType>),
}

impl ValueType {
    /// Construct a tensor type.
    pub fn tensor(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::Tensor {
            shape: shape.into(),
            dtype,
        }
    }
}

/// One node of the arena: an op, its operand ids, and its result type
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// The operation
    pub op: Op,
    /// Operand node ids, in operand order
    pub inputs: Vec<NodeId>,
    /// Result type
    pub ty: ValueType,
}

/// An expansion graph
///
/// Nodes are appended in construction order, which is therefore a
/// topological order: every operand of a node precedes it.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    outputs: Vec<NodeId>,
    param_count: usize,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// All nodes in construction (topological) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The node behind an id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of parameters declared so far.
    pub fn num_parameters(&self) -> usize {
        self.param_count
    }

    /// The graph's result nodes.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Declare the graph's results.
    pub fn set_outputs(&mut self, outputs: &[TensorRef]) {
        self.outputs = outputs.iter().map(|r| r.id).collect();
    }

    /// Result type of a handle.
    pub fn value_type(&self, r: TensorRef) -> &ValueType {
        &self.nodes[r.id.0].ty
    }

    /// Shape of a tensor-valued handle.
    pub fn shape_of(&self, r: TensorRef) -> Result<&Shape> {
        match self.value_type(r) {
            ValueType::Tensor { shape, .. } => Ok(shape),
            ValueType::Tuple(_) => Err(Error::Internal(
                "expected a tensor value, got a tuple".to_string(),
            )),
        }
    }

    /// Dtype of a tensor-valued handle.
    pub fn dtype_of(&self, r: TensorRef) -> Result<DType> {
        match self.value_type(r) {
            ValueType::Tensor { dtype, .. } => Ok(*dtype),
            ValueType::Tuple(_) => Err(Error::Internal(
                "expected a tensor value, got a tuple".to_string(),
            )),
        }
    }

    pub(crate) fn push(&mut self, op: Op, inputs: Vec<NodeId>, ty: ValueType) -> TensorRef {
        debug_assert!(inputs.iter().all(|id| id.0 < self.nodes.len()));
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, inputs, ty });
        TensorRef { id }
    }
}
