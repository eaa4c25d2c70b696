//! Reference backend: executes an expansion graph on host tensors
//!
//! The evaluator walks the arena in construction order (which is
//! topological), materializing one host tensor per node. It exists to give
//! expansions a concrete, deterministic semantics; throughput backends are
//! expected elsewhere. Identical inputs produce bitwise-identical outputs:
//! there is no hashing by address and no iteration-order dependence.

mod kernels;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{Graph, Op, ValueType};
use crate::tensor::Tensor;

/// A runtime value: a tensor or a tuple of values
#[derive(Clone, Debug)]
pub enum Value {
    /// A host tensor
    Tensor(Tensor),
    /// A tuple (loop state, multi-result roots)
    Tuple(Vec<Value>),
}

impl Value {
    /// Borrow the tensor inside, failing on tuples.
    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            Value::Tuple(_) => Err(Error::Internal(
                "expected a tensor value, got a tuple".to_string(),
            )),
        }
    }

    /// Borrow the tuple elements inside, failing on tensors.
    pub fn as_tuple(&self) -> Result<&[Value]> {
        match self {
            Value::Tuple(vs) => Ok(vs),
            Value::Tensor(_) => Err(Error::Internal(
                "expected a tuple value, got a tensor".to_string(),
            )),
        }
    }
}

/// Executes one graph over host tensors
pub struct Evaluator<'g> {
    graph: &'g Graph,
}

impl<'g> Evaluator<'g> {
    /// Create an evaluator for a graph.
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Run the graph on the given parameter tensors and return its outputs.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Vec<Value>> {
        let params: Vec<Value> = inputs.iter().map(|t| Value::Tensor(t.clone())).collect();
        eval_graph(self.graph, &params)
    }
}

fn eval_graph(graph: &Graph, params: &[Value]) -> Result<Vec<Value>> {
    if params.len() != graph.num_parameters() {
        return Err(Error::invalid_argument(
            "inputs",
            format!(
                "graph takes {} parameters, got {}",
                graph.num_parameters(),
                params.len()
            ),
        ));
    }
    let mut values: Vec<Option<Value>> = vec![None; graph.num_nodes()];
    for (i, node) in graph.nodes().iter().enumerate() {
        let get = |id: crate::graph::NodeId| -> &Value {
            values[id.index()]
                .as_ref()
                .expect("operands precede their users")
        };
        let value = match &node.op {
            Op::Parameter { index } => {
                let value = params[*index].clone();
                check_param_type(&value, &node.ty)?;
                value
            }
            Op::Constant { value } => Value::Tensor(kernels::constant(*value)),
            Op::Iota { axis } => {
                Value::Tensor(kernels::iota(expect_tensor_ty(&node.ty)?.0, *axis))
            }
            Op::Unary(op) => {
                Value::Tensor(kernels::unary(*op, get(node.inputs[0]).as_tensor()?)?)
            }
            Op::Binary(op) => Value::Tensor(kernels::binary(
                *op,
                get(node.inputs[0]).as_tensor()?,
                get(node.inputs[1]).as_tensor()?,
            )?),
            Op::Compare(op) => Value::Tensor(kernels::compare(
                *op,
                get(node.inputs[0]).as_tensor()?,
                get(node.inputs[1]).as_tensor()?,
            )?),
            Op::Select => Value::Tensor(kernels::select(
                get(node.inputs[0]).as_tensor()?,
                get(node.inputs[1]).as_tensor()?,
                get(node.inputs[2]).as_tensor()?,
            )?),
            Op::Cast => {
                let (_, dtype) = expect_tensor_ty(&node.ty)?;
                Value::Tensor(kernels::cast(get(node.inputs[0]).as_tensor()?, dtype))
            }
            Op::BroadcastInDim { broadcast_dims } => {
                let (shape, _) = expect_tensor_ty(&node.ty)?;
                Value::Tensor(kernels::broadcast_in_dim(
                    get(node.inputs[0]).as_tensor()?,
                    shape,
                    broadcast_dims,
                ))
            }
            Op::Reshape => {
                let (shape, _) = expect_tensor_ty(&node.ty)?;
                Value::Tensor(kernels::reshape(
                    get(node.inputs[0]).as_tensor()?,
                    shape,
                ))
            }
            Op::ReduceSum { axis } => Value::Tensor(kernels::reduce_sum(
                get(node.inputs[0]).as_tensor()?,
                *axis,
            )?),
            Op::Matmul {
                transpose_a,
                transpose_b,
                precision,
            } => Value::Tensor(kernels::matmul(
                get(node.inputs[0]).as_tensor()?,
                *transpose_a,
                get(node.inputs[1]).as_tensor()?,
                *transpose_b,
                *precision,
            )?),
            Op::Slice { starts, limits } => Value::Tensor(kernels::slice(
                get(node.inputs[0]).as_tensor()?,
                starts,
                limits,
            )),
            Op::UpdateSlice { starts } => Value::Tensor(kernels::update_slice(
                get(node.inputs[0]).as_tensor()?,
                get(node.inputs[1]).as_tensor()?,
                starts,
            )),
            Op::DynamicSlice { sizes } => {
                let starts = scalar_starts(&node.inputs[1..], &values)?;
                Value::Tensor(kernels::dynamic_slice(
                    get(node.inputs[0]).as_tensor()?,
                    &starts,
                    sizes,
                ))
            }
            Op::DynamicUpdateSlice => {
                let starts = scalar_starts(&node.inputs[2..], &values)?;
                Value::Tensor(kernels::dynamic_update_slice(
                    get(node.inputs[0]).as_tensor()?,
                    get(node.inputs[1]).as_tensor()?,
                    &starts,
                ))
            }
            Op::Loop { trip_count, body } => {
                let mut state: Vec<Value> =
                    node.inputs.iter().map(|&id| get(id).clone()).collect();
                for j in 0..*trip_count {
                    let mut body_params = Vec::with_capacity(state.len() + 1);
                    body_params.push(Value::Tensor(Tensor::scalar(j as i32)));
                    body_params.extend(state);
                    state = eval_graph(body, &body_params)?;
                }
                Value::Tuple(state)
            }
            Op::Tuple => Value::Tuple(node.inputs.iter().map(|&id| get(id).clone()).collect()),
            Op::TupleGet { index } => {
                let elems = get(node.inputs[0]).as_tuple()?;
                elems[*index].clone()
            }
        };
        values[i] = Some(value);
    }
    graph
        .outputs()
        .iter()
        .map(|&id| {
            values[id.index()]
                .clone()
                .ok_or_else(|| Error::Internal("unset graph output".to_string()))
        })
        .collect()
}

fn expect_tensor_ty(ty: &ValueType) -> Result<(&crate::tensor::Shape, DType)> {
    match ty {
        ValueType::Tensor { shape, dtype } => Ok((shape, *dtype)),
        ValueType::Tuple(_) => Err(Error::Internal("expected tensor node type".to_string())),
    }
}

fn check_param_type(value: &Value, ty: &ValueType) -> Result<()> {
    match (value, ty) {
        (Value::Tensor(t), ValueType::Tensor { shape, dtype }) => {
            if t.dtype() != *dtype {
                return Err(Error::DTypeMismatch {
                    lhs: *dtype,
                    rhs: t.dtype(),
                });
            }
            if t.shape().as_slice() != shape.as_slice() {
                return Err(Error::shape_mismatch(shape, t.shape()));
            }
            Ok(())
        }
        _ => Err(Error::Internal(
            "parameter value does not match its declared type".to_string(),
        )),
    }
}

fn scalar_starts(
    ids: &[crate::graph::NodeId],
    values: &[Option<Value>],
) -> Result<Vec<i64>> {
    ids.iter()
        .map(|&id| {
            let t = values[id.index()]
                .as_ref()
                .expect("operands precede their users")
                .as_tensor()?;
            Ok(t.as_slice::<i32>()[0] as i64)
        })
        .collect()
}
