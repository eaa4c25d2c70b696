//! Shape-inferring constructors for every primitive op
//!
//! Each method validates operand shapes and dtypes at graph-construction
//! time and appends a node; nothing is deferred to the backend. All errors
//! are surfaced synchronously as `Result`s.

use super::op::{BinaryOp, CompareOp, ConstValue, Op, Precision, UnaryOp};
use super::{Graph, TensorRef, ValueType};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Shape;

impl Graph {
    /// Declare the next graph parameter.
    pub fn parameter(&mut self, shape: impl Into<Shape>, dtype: DType) -> TensorRef {
        let index = self.param_count;
        self.param_count += 1;
        self.push(
            Op::Parameter { index },
            vec![],
            ValueType::tensor(shape, dtype),
        )
    }

    /// A scalar constant node.
    pub fn constant(&mut self, value: ConstValue) -> TensorRef {
        let dtype = value.dtype();
        self.push(
            Op::Constant { value },
            vec![],
            ValueType::tensor(Shape::new(), dtype),
        )
    }

    /// A scalar float constant of the given dtype.
    pub fn constant_float(&mut self, dtype: DType, value: f64) -> Result<TensorRef> {
        if !dtype.is_float() {
            return Err(Error::unsupported_dtype(dtype, "constant_float"));
        }
        Ok(self.constant(ConstValue::float(dtype, value)))
    }

    /// A scalar i32 constant.
    pub fn constant_i32(&mut self, value: i32) -> TensorRef {
        self.constant(ConstValue::i32(value))
    }

    /// I32 tensor of the given shape holding each element's index along
    /// `axis`.
    pub fn iota(&mut self, shape: impl Into<Shape>, axis: usize) -> Result<TensorRef> {
        let shape = shape.into();
        if axis >= shape.ndim() {
            return Err(Error::InvalidDimension {
                dim: axis,
                ndim: shape.ndim(),
            });
        }
        Ok(self.push(
            Op::Iota { axis },
            vec![],
            ValueType::tensor(shape, DType::I32),
        ))
    }

    fn unary(&mut self, op: UnaryOp, x: TensorRef) -> Result<TensorRef> {
        let dtype = self.dtype_of(x)?;
        if matches!(op, UnaryOp::Sqrt) && !dtype.is_float() {
            return Err(Error::unsupported_dtype(dtype, "sqrt"));
        }
        if dtype.is_bool() {
            return Err(Error::unsupported_dtype(dtype, "unary arithmetic"));
        }
        let ty = self.value_type(x).clone();
        Ok(self.push(Op::Unary(op), vec![x.id], ty))
    }

    /// Elementwise negation.
    pub fn neg(&mut self, x: TensorRef) -> Result<TensorRef> {
        self.unary(UnaryOp::Neg, x)
    }

    /// Elementwise square root.
    pub fn sqrt(&mut self, x: TensorRef) -> Result<TensorRef> {
        self.unary(UnaryOp::Sqrt, x)
    }

    fn check_same_shape_dtype(&self, a: TensorRef, b: TensorRef) -> Result<(Shape, DType)> {
        let (sa, da) = (self.shape_of(a)?.clone(), self.dtype_of(a)?);
        let (sb, db) = (self.shape_of(b)?, self.dtype_of(b)?);
        if da != db {
            return Err(Error::DTypeMismatch { lhs: da, rhs: db });
        }
        if sa.as_slice() != sb.as_slice() {
            return Err(Error::shape_mismatch(&sa, sb));
        }
        Ok((sa, da))
    }

    fn binary(&mut self, op: BinaryOp, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        let (shape, dtype) = self.check_same_shape_dtype(a, b)?;
        if dtype.is_bool() {
            return Err(Error::unsupported_dtype(dtype, "binary arithmetic"));
        }
        if matches!(op, BinaryOp::Div) && !dtype.is_float() {
            return Err(Error::unsupported_dtype(dtype, "div"));
        }
        Ok(self.push(
            Op::Binary(op),
            vec![a.id, b.id],
            ValueType::tensor(shape, dtype),
        ))
    }

    /// Elementwise addition.
    pub fn add(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.binary(BinaryOp::Add, a, b)
    }

    /// Elementwise subtraction.
    pub fn sub(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.binary(BinaryOp::Sub, a, b)
    }

    /// Elementwise multiplication.
    pub fn mul(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.binary(BinaryOp::Mul, a, b)
    }

    /// Elementwise division.
    pub fn div(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.binary(BinaryOp::Div, a, b)
    }

    fn compare(&mut self, op: CompareOp, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        let (shape, _) = self.check_same_shape_dtype(a, b)?;
        Ok(self.push(
            Op::Compare(op),
            vec![a.id, b.id],
            ValueType::tensor(shape, DType::Bool),
        ))
    }

    /// Elementwise equality, producing Bool.
    pub fn eq(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.compare(CompareOp::Eq, a, b)
    }

    /// Elementwise less-than, producing Bool.
    pub fn lt(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.compare(CompareOp::Lt, a, b)
    }

    /// Elementwise greater-than, producing Bool.
    pub fn gt(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.compare(CompareOp::Gt, a, b)
    }

    /// Elementwise greater-or-equal, producing Bool.
    pub fn ge(&mut self, a: TensorRef, b: TensorRef) -> Result<TensorRef> {
        self.compare(CompareOp::Ge, a, b)
    }

    /// Elementwise `cond ? on_true : on_false` over equal shapes.
    pub fn select(
        &mut self,
        cond: TensorRef,
        on_true: TensorRef,
        on_false: TensorRef,
    ) -> Result<TensorRef> {
        let cond_dtype = self.dtype_of(cond)?;
        if !cond_dtype.is_bool() {
            return Err(Error::unsupported_dtype(cond_dtype, "select condition"));
        }
        let (shape, dtype) = self.check_same_shape_dtype(on_true, on_false)?;
        let cond_shape = self.shape_of(cond)?;
        if cond_shape.as_slice() != shape.as_slice() {
            return Err(Error::shape_mismatch(&shape, cond_shape));
        }
        Ok(self.push(
            Op::Select,
            vec![cond.id, on_true.id, on_false.id],
            ValueType::tensor(shape, dtype),
        ))
    }

    /// Elementwise conversion to `dtype`.
    pub fn cast(&mut self, x: TensorRef, dtype: DType) -> Result<TensorRef> {
        let shape = self.shape_of(x)?.clone();
        Ok(self.push(Op::Cast, vec![x.id], ValueType::tensor(shape, dtype)))
    }

    /// Broadcast `x` into `out_shape`, with `broadcast_dims[i]` naming the
    /// output axis operand axis `i` maps to. Unmapped output axes are
    /// replicated; mapped axes must agree in size or be 1 in the operand.
    pub fn broadcast_in_dim(
        &mut self,
        x: TensorRef,
        out_shape: impl Into<Shape>,
        broadcast_dims: &[usize],
    ) -> Result<TensorRef> {
        let out_shape = out_shape.into();
        let in_shape = self.shape_of(x)?.clone();
        let dtype = self.dtype_of(x)?;
        if broadcast_dims.len() != in_shape.ndim() {
            return Err(Error::Internal(format!(
                "broadcast_in_dim: {} broadcast dims for operand of rank {}",
                broadcast_dims.len(),
                in_shape.ndim()
            )));
        }
        let mut prev: Option<usize> = None;
        for (i, &dim) in broadcast_dims.iter().enumerate() {
            if dim >= out_shape.ndim() {
                return Err(Error::InvalidDimension {
                    dim,
                    ndim: out_shape.ndim(),
                });
            }
            if prev.is_some_and(|p| dim <= p) {
                return Err(Error::Internal(
                    "broadcast_in_dim: broadcast dims must be strictly increasing".to_string(),
                ));
            }
            prev = Some(dim);
            if in_shape[i] != out_shape[dim] && in_shape[i] != 1 {
                return Err(Error::shape_mismatch(&out_shape, &in_shape));
            }
        }
        Ok(self.push(
            Op::BroadcastInDim {
                broadcast_dims: broadcast_dims.to_vec(),
            },
            vec![x.id],
            ValueType::tensor(out_shape, dtype),
        ))
    }

    /// Reshape to an equal element count.
    pub fn reshape(&mut self, x: TensorRef, shape: impl Into<Shape>) -> Result<TensorRef> {
        let shape = shape.into();
        let in_shape = self.shape_of(x)?;
        if shape.elem_count() != in_shape.elem_count() {
            return Err(Error::shape_mismatch(&shape, in_shape));
        }
        let dtype = self.dtype_of(x)?;
        Ok(self.push(Op::Reshape, vec![x.id], ValueType::tensor(shape, dtype)))
    }

    /// Sum along a single axis, removing it.
    pub fn reduce_sum(&mut self, x: TensorRef, axis: usize) -> Result<TensorRef> {
        let in_shape = self.shape_of(x)?.clone();
        let dtype = self.dtype_of(x)?;
        if dtype.is_bool() {
            return Err(Error::unsupported_dtype(dtype, "reduce_sum"));
        }
        if axis >= in_shape.ndim() {
            return Err(Error::InvalidDimension {
                dim: axis,
                ndim: in_shape.ndim(),
            });
        }
        let out_shape: Shape = in_shape
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != axis)
            .map(|(_, &d)| d)
            .collect();
        Ok(self.push(
            Op::ReduceSum { axis },
            vec![x.id],
            ValueType::tensor(out_shape, dtype),
        ))
    }

    /// Batched matrix multiply with per-operand transpose flags.
    ///
    /// Operands are `[*B, m, k]` and `[*B, k, n]` after transposition; the
    /// batch prefixes must be identical. The precision tag is forwarded to
    /// the backend.
    pub fn matmul(
        &mut self,
        a: TensorRef,
        transpose_a: bool,
        b: TensorRef,
        transpose_b: bool,
        precision: Precision,
    ) -> Result<TensorRef> {
        let (sa, da) = (self.shape_of(a)?.clone(), self.dtype_of(a)?);
        let (sb, db) = (self.shape_of(b)?.clone(), self.dtype_of(b)?);
        if da != db {
            return Err(Error::DTypeMismatch { lhs: da, rhs: db });
        }
        if !da.is_float() {
            return Err(Error::unsupported_dtype(da, "matmul"));
        }
        if sa.ndim() < 2 || sb.ndim() != sa.ndim() {
            return Err(Error::shape_mismatch(&sa, &sb));
        }
        let rank = sa.ndim();
        if sa[..rank - 2] != sb[..rank - 2] {
            return Err(Error::shape_mismatch(&sa, &sb));
        }
        let (am, ak) = trailing_dims(&sa, transpose_a);
        let (bk, bn) = trailing_dims(&sb, transpose_b);
        if ak != bk {
            return Err(Error::shape_mismatch(&sa, &sb));
        }
        let out_shape = Shape::concat(&sa[..rank - 2], &[am, bn]);
        Ok(self.push(
            Op::Matmul {
                transpose_a,
                transpose_b,
                precision,
            },
            vec![a.id, b.id],
            ValueType::tensor(out_shape, da),
        ))
    }

    /// Static slice of the trailing dims; leading dims are taken whole.
    pub fn slice_in_minor_dims(
        &mut self,
        x: TensorRef,
        starts: &[usize],
        limits: &[usize],
    ) -> Result<TensorRef> {
        let in_shape = self.shape_of(x)?.clone();
        let dtype = self.dtype_of(x)?;
        let rank = in_shape.ndim();
        if starts.len() != limits.len() || starts.len() > rank {
            return Err(Error::Internal(format!(
                "slice_in_minor_dims: {} starts / {} limits for rank {}",
                starts.len(),
                limits.len(),
                rank
            )));
        }
        let lead = rank - starts.len();
        let mut full_starts = vec![0usize; rank];
        let mut full_limits: Vec<usize> = in_shape.to_vec();
        for (i, (&s, &l)) in starts.iter().zip(limits).enumerate() {
            let dim = in_shape[lead + i];
            if s > l || l > dim {
                return Err(Error::IndexOutOfBounds { index: l, size: dim });
            }
            full_starts[lead + i] = s;
            full_limits[lead + i] = l;
        }
        let out_shape: Shape = full_starts
            .iter()
            .zip(&full_limits)
            .map(|(&s, &l)| l - s)
            .collect();
        Ok(self.push(
            Op::Slice {
                starts: full_starts,
                limits: full_limits,
            },
            vec![x.id],
            ValueType::tensor(out_shape, dtype),
        ))
    }

    /// Static update of the trailing dims with `update`'s contents.
    pub fn update_slice_in_minor_dims(
        &mut self,
        x: TensorRef,
        update: TensorRef,
        starts: &[usize],
    ) -> Result<TensorRef> {
        let in_shape = self.shape_of(x)?.clone();
        let up_shape = self.shape_of(update)?.clone();
        let dtype = self.dtype_of(x)?;
        let up_dtype = self.dtype_of(update)?;
        if dtype != up_dtype {
            return Err(Error::DTypeMismatch {
                lhs: dtype,
                rhs: up_dtype,
            });
        }
        let rank = in_shape.ndim();
        if up_shape.ndim() != rank || starts.len() > rank {
            return Err(Error::shape_mismatch(&in_shape, &up_shape));
        }
        let lead = rank - starts.len();
        let mut full_starts = vec![0usize; rank];
        for (i, &s) in starts.iter().enumerate() {
            full_starts[lead + i] = s;
        }
        for d in 0..rank {
            if full_starts[d] + up_shape[d] > in_shape[d] {
                return Err(Error::IndexOutOfBounds {
                    index: full_starts[d] + up_shape[d],
                    size: in_shape[d],
                });
            }
            if d < lead && up_shape[d] != in_shape[d] {
                return Err(Error::shape_mismatch(&in_shape, &up_shape));
            }
        }
        Ok(self.push(
            Op::UpdateSlice {
                starts: full_starts,
            },
            vec![x.id, update.id],
            ValueType::tensor(in_shape, dtype),
        ))
    }

    fn check_scalar_i32_starts(&self, starts: &[TensorRef]) -> Result<()> {
        for &s in starts {
            let dtype = self.dtype_of(s)?;
            let shape = self.shape_of(s)?;
            if dtype != DType::I32 || shape.ndim() != 0 {
                return Err(Error::Internal(
                    "dynamic slice starts must be I32 scalars".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Slice of the trailing dims at starts held in I32 scalar handles.
    ///
    /// Starts are clamped at evaluation time so the window stays in bounds.
    pub fn dynamic_slice_in_minor_dims(
        &mut self,
        x: TensorRef,
        starts: &[TensorRef],
        sizes: &[usize],
    ) -> Result<TensorRef> {
        let in_shape = self.shape_of(x)?.clone();
        let dtype = self.dtype_of(x)?;
        let rank = in_shape.ndim();
        if starts.len() != sizes.len() || starts.len() > rank {
            return Err(Error::Internal(format!(
                "dynamic_slice_in_minor_dims: {} starts / {} sizes for rank {}",
                starts.len(),
                sizes.len(),
                rank
            )));
        }
        self.check_scalar_i32_starts(starts)?;
        let lead = rank - sizes.len();
        let mut out_shape: Shape = in_shape[..lead].into();
        for (i, &sz) in sizes.iter().enumerate() {
            if sz > in_shape[lead + i] {
                return Err(Error::IndexOutOfBounds {
                    index: sz,
                    size: in_shape[lead + i],
                });
            }
            out_shape.push(sz);
        }
        let mut inputs = vec![x.id];
        inputs.extend(starts.iter().map(|r| r.id));
        Ok(self.push(
            Op::DynamicSlice {
                sizes: sizes.to_vec(),
            },
            inputs,
            ValueType::tensor(out_shape, dtype),
        ))
    }

    /// Update of the trailing dims at starts held in I32 scalar handles.
    pub fn dynamic_update_slice_in_minor_dims(
        &mut self,
        x: TensorRef,
        update: TensorRef,
        starts: &[TensorRef],
    ) -> Result<TensorRef> {
        let in_shape = self.shape_of(x)?.clone();
        let up_shape = self.shape_of(update)?.clone();
        let dtype = self.dtype_of(x)?;
        if dtype != self.dtype_of(update)? {
            return Err(Error::DTypeMismatch {
                lhs: dtype,
                rhs: self.dtype_of(update)?,
            });
        }
        let rank = in_shape.ndim();
        if up_shape.ndim() != rank || starts.len() > rank {
            return Err(Error::shape_mismatch(&in_shape, &up_shape));
        }
        self.check_scalar_i32_starts(starts)?;
        let lead = rank - starts.len();
        for d in 0..rank {
            if up_shape[d] > in_shape[d] || (d < lead && up_shape[d] != in_shape[d]) {
                return Err(Error::shape_mismatch(&in_shape, &up_shape));
            }
        }
        let mut inputs = vec![x.id, update.id];
        inputs.extend(starts.iter().map(|r| r.id));
        Ok(self.push(
            Op::DynamicUpdateSlice,
            inputs,
            ValueType::tensor(in_shape, dtype),
        ))
    }

    /// Static-trip counted loop.
    ///
    /// `body` is called once, with a fresh sub-graph, an I32 scalar index
    /// parameter, and one parameter per element of `init`; it returns the
    /// next state, which must have exactly the types of `init` (the loop
    /// body is shape-invariant). The returned handles are the final state.
    ///
    /// Handles from the enclosing graph are not visible inside the body;
    /// values the body needs must ride along in `init`.
    pub fn for_each_index<F>(
        &mut self,
        trip_count: usize,
        init: &[TensorRef],
        body: F,
    ) -> Result<Vec<TensorRef>>
    where
        F: FnOnce(&mut Graph, TensorRef, &[TensorRef]) -> Result<Vec<TensorRef>>,
    {
        let state_tys: Vec<ValueType> = init
            .iter()
            .map(|&r| match self.value_type(r) {
                t @ ValueType::Tensor { .. } => Ok(t.clone()),
                ValueType::Tuple(_) => Err(Error::Internal(
                    "loop state must be tensors, not tuples".to_string(),
                )),
            })
            .collect::<Result<_>>()?;

        let mut body_graph = Graph::new();
        let index = body_graph.parameter(Shape::new(), DType::I32);
        let state_params: Vec<TensorRef> = state_tys
            .iter()
            .map(|ty| match ty {
                ValueType::Tensor { shape, dtype } => body_graph.parameter(shape.clone(), *dtype),
                ValueType::Tuple(_) => unreachable!(),
            })
            .collect();

        let results = body(&mut body_graph, index, &state_params)?;
        if results.len() != init.len() {
            return Err(Error::Internal(format!(
                "loop body returned {} values for {} state elements",
                results.len(),
                init.len()
            )));
        }
        for (r, ty) in results.iter().zip(&state_tys) {
            if body_graph.value_type(*r) != ty {
                return Err(Error::Internal(
                    "loop body must preserve state shapes and dtypes".to_string(),
                ));
            }
        }
        body_graph.set_outputs(&results);

        let loop_ref = self.push(
            Op::Loop {
                trip_count,
                body: body_graph,
            },
            init.iter().map(|r| r.id).collect(),
            ValueType::Tuple(state_tys),
        );
        (0..init.len()).map(|i| self.tuple_get(loop_ref, i)).collect()
    }

    /// Pack handles into a tuple value.
    pub fn tuple(&mut self, elems: &[TensorRef]) -> TensorRef {
        let tys = elems.iter().map(|&r| self.value_type(r).clone()).collect();
        self.push(
            Op::Tuple,
            elems.iter().map(|r| r.id).collect(),
            ValueType::Tuple(tys),
        )
    }

    /// Project element `index` out of a tuple-valued handle.
    pub fn tuple_get(&mut self, t: TensorRef, index: usize) -> Result<TensorRef> {
        let ty = match self.value_type(t) {
            ValueType::Tuple(tys) => {
                tys.get(index)
                    .cloned()
                    .ok_or(Error::IndexOutOfBounds {
                        index,
                        size: tys.len(),
                    })?
            }
            ValueType::Tensor { .. } => {
                return Err(Error::Internal(
                    "tuple_get on a tensor-valued handle".to_string(),
                ))
            }
        };
        Ok(self.push(Op::TupleGet { index }, vec![t.id], ty))
    }
}

fn trailing_dims(shape: &Shape, transpose: bool) -> (usize, usize) {
    let rank = shape.ndim();
    if transpose {
        (shape[rank - 1], shape[rank - 2])
    } else {
        (shape[rank - 2], shape[rank - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_shape_inference() {
        let mut g = Graph::new();
        let a = g.parameter([2, 3, 4], DType::F32);
        let b = g.parameter([2, 5, 4], DType::F32);
        let c = g.matmul(a, false, b, true, Precision::Default).unwrap();
        assert_eq!(g.shape_of(c).unwrap().as_slice(), &[2, 3, 5]);
        // contraction mismatch without the transpose
        assert!(g.matmul(a, false, b, false, Precision::Default).is_err());
    }

    #[test]
    fn test_slice_in_minor_dims() {
        let mut g = Graph::new();
        let a = g.parameter([2, 4, 6], DType::F64);
        let s = g.slice_in_minor_dims(a, &[1, 2], &[4, 5]).unwrap();
        assert_eq!(g.shape_of(s).unwrap().as_slice(), &[2, 3, 3]);
        assert!(g.slice_in_minor_dims(a, &[0, 0], &[4, 7]).is_err());
    }

    #[test]
    fn test_broadcast_in_dim_validation() {
        let mut g = Graph::new();
        let v = g.parameter([3], DType::F32);
        let b = g.broadcast_in_dim(v, [2, 3], &[1]).unwrap();
        assert_eq!(g.shape_of(b).unwrap().as_slice(), &[2, 3]);
        assert!(g.broadcast_in_dim(v, [2, 4], &[1]).is_err());
        let s = g.parameter([], DType::F32);
        let sb = g.broadcast_in_dim(s, [2, 3], &[]).unwrap();
        assert_eq!(g.shape_of(sb).unwrap().as_slice(), &[2, 3]);
    }

    #[test]
    fn test_loop_state_invariance() {
        let mut g = Graph::new();
        let x = g.parameter([4], DType::F32);
        // body that changes the state shape must be rejected
        let bad = g.for_each_index(3, &[x], |g, _j, state| {
            let sliced = g.slice_in_minor_dims(state[0], &[0], &[2])?;
            Ok(vec![sliced])
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_mixed_dtype_rejected() {
        let mut g = Graph::new();
        let a = g.parameter([2], DType::F32);
        let b = g.parameter([2], DType::F64);
        assert!(g.add(a, b).is_err());
    }
}
