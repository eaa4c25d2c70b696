//! Derived matrix helpers built from the primitives
//!
//! None of these add ops to the primitive set; they are iota/compare/select
//! idioms every expansion needs.

use super::op::ConstValue;
use super::{Graph, TensorRef};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Shape;

impl Graph {
    /// A tensor of the given shape filled with one scalar value.
    pub fn splat(
        &mut self,
        dtype: DType,
        value: f64,
        shape: impl Into<Shape>,
    ) -> Result<TensorRef> {
        let c = match dtype {
            DType::F32 | DType::F64 => self.constant(ConstValue::float(dtype, value)),
            DType::I32 => self.constant(ConstValue::i32(value as i32)),
            DType::Bool => self.constant(ConstValue::Bool(value != 0.0)),
        };
        self.broadcast_in_dim(c, shape, &[])
    }

    /// A tensor with the shape and dtype of `x`, filled with `value`.
    pub fn scalar_like(&mut self, x: TensorRef, value: f64) -> Result<TensorRef> {
        let shape = self.shape_of(x)?.clone();
        let dtype = self.dtype_of(x)?;
        self.splat(dtype, value, shape)
    }

    /// A zero tensor with the shape and dtype of `x`.
    pub fn zeros_like(&mut self, x: TensorRef) -> Result<TensorRef> {
        self.scalar_like(x, 0.0)
    }

    /// The `m x n` identity matrix (ones on the main diagonal).
    pub fn identity_matrix(&mut self, dtype: DType, m: usize, n: usize) -> Result<TensorRef> {
        let row = self.iota([m, n], 0)?;
        let col = self.iota([m, n], 1)?;
        let diag = self.eq(row, col)?;
        self.cast(diag, dtype)
    }

    /// Bool mask over the trailing two dims of `x`'s shape: true on and
    /// below the diagonal shifted by `diagonal` (`-1` selects the strictly
    /// lower triangle).
    pub fn triangle_mask(&mut self, x: TensorRef, diagonal: i32) -> Result<TensorRef> {
        let shape = self.shape_of(x)?.clone();
        let rank = shape.ndim();
        if rank < 2 {
            return Err(Error::invalid_argument(
                "x",
                format!("triangle mask needs rank >= 2, got shape {shape:?}"),
            ));
        }
        let row = self.iota(shape.clone(), rank - 2)?;
        let col = self.iota(shape.clone(), rank - 1)?;
        // row >= col - diagonal, rearranged to keep the arithmetic in i32
        let d = self.splat(DType::I32, diagonal as f64, shape)?;
        let shifted = self.add(row, d)?;
        self.ge(shifted, col)
    }

    /// Zero everything strictly below the main diagonal of `x`.
    pub fn upper_triangle(&mut self, x: TensorRef) -> Result<TensorRef> {
        let mask = self.triangle_mask(x, -1)?;
        let zeros = self.zeros_like(x)?;
        self.select(mask, zeros, x)
    }

    /// Zero everything on and above the main diagonal of `x`.
    pub fn strict_lower_triangle(&mut self, x: TensorRef) -> Result<TensorRef> {
        let mask = self.triangle_mask(x, -1)?;
        let zeros = self.zeros_like(x)?;
        self.select(mask, x, zeros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Evaluator, Value};

    fn eval_single(g: &Graph) -> crate::tensor::Tensor {
        match Evaluator::new(g).run(&[]).unwrap().remove(0) {
            Value::Tensor(t) => t,
            Value::Tuple(_) => panic!("expected tensor output"),
        }
    }

    #[test]
    fn test_identity_matrix() {
        let mut g = Graph::new();
        let eye = g.identity_matrix(DType::F32, 2, 3).unwrap();
        g.set_outputs(&[eye]);
        let t = eval_single(&g);
        assert_eq!(t.to_vec::<f32>(), vec![1., 0., 0., 0., 1., 0.]);
    }

    #[test]
    fn test_upper_triangle() {
        let mut g = Graph::new();
        let x = g.splat(DType::F64, 7.0, [3, 3]).unwrap();
        let up = g.upper_triangle(x).unwrap();
        g.set_outputs(&[up]);
        let t = eval_single(&g);
        assert_eq!(
            t.to_vec::<f64>(),
            vec![7., 7., 7., 0., 7., 7., 0., 0., 7.]
        );
    }

    #[test]
    fn test_strict_lower_triangle() {
        let mut g = Graph::new();
        let x = g.splat(DType::F32, 1.0, [2, 2]).unwrap();
        let masked = g.strict_lower_triangle(x).unwrap();
        g.set_outputs(&[masked]);
        let t = eval_single(&g);
        assert_eq!(t.to_vec::<f32>(), vec![0., 0., 1., 0.]);
    }

    #[test]
    fn test_scalar_like() {
        let mut g = Graph::new();
        let x = g.splat(DType::F64, 0.0, [2, 3]).unwrap();
        let filled = g.scalar_like(x, -2.5).unwrap();
        g.set_outputs(&[filled]);
        let t = eval_single(&g);
        assert_eq!(t.to_vec::<f64>(), vec![-2.5; 6]);
    }
}
