//! Typed kernels for the reference backend
//!
//! Correctness and determinism over throughput: elementwise and movement
//! kernels walk indices in row-major order; matmul is the only kernel that
//! parallelizes (over the batch axis, with the `rayon` feature).

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::graph::{BinaryOp, CompareOp, ConstValue, Precision, UnaryOp};
use crate::tensor::{contiguous_strides, Shape, Tensor};

/// Visit every multi-index of `shape` in row-major order.
fn visit_indices(shape: &[usize], mut f: impl FnMut(&[usize])) {
    if shape.iter().any(|&d| d == 0) {
        return;
    }
    let mut idx = vec![0usize; shape.len()];
    loop {
        f(&idx);
        let mut dim = shape.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            idx[dim] += 1;
            if idx[dim] < shape[dim] {
                break;
            }
            idx[dim] = 0;
        }
    }
}

pub(crate) fn constant(value: ConstValue) -> Tensor {
    match value {
        ConstValue::F64(bits) => Tensor::scalar(f64::from_bits(bits)),
        ConstValue::F32(bits) => Tensor::scalar(f32::from_bits(bits)),
        ConstValue::I32(v) => Tensor::scalar(v),
        ConstValue::Bool(v) => Tensor::scalar(v as u8),
    }
}

pub(crate) fn iota(shape: &Shape, axis: usize) -> Tensor {
    let mut data = Vec::with_capacity(shape.elem_count());
    visit_indices(shape, |idx| data.push(idx[axis] as i32));
    Tensor::from_vec(data, shape.clone())
}

trait MathElement:
    Element
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::Neg<Output = Self>
{
    fn sqrt_val(self) -> Self;
}

impl MathElement for f32 {
    #[inline]
    fn sqrt_val(self) -> Self {
        self.sqrt()
    }
}

impl MathElement for f64 {
    #[inline]
    fn sqrt_val(self) -> Self {
        self.sqrt()
    }
}

fn unary_float<T: MathElement>(op: UnaryOp, x: &Tensor) -> Tensor {
    let data: Vec<T> = x
        .as_slice::<T>()
        .iter()
        .map(|&v| match op {
            UnaryOp::Neg => -v,
            UnaryOp::Sqrt => v.sqrt_val(),
        })
        .collect();
    Tensor::from_vec(data, x.shape().clone())
}

pub(crate) fn unary(op: UnaryOp, x: &Tensor) -> Result<Tensor> {
    match x.dtype() {
        DType::F32 => Ok(unary_float::<f32>(op, x)),
        DType::F64 => Ok(unary_float::<f64>(op, x)),
        DType::I32 => match op {
            UnaryOp::Neg => Ok(Tensor::from_vec(
                x.as_slice::<i32>().iter().map(|&v| -v).collect(),
                x.shape().clone(),
            )),
            UnaryOp::Sqrt => Err(Error::unsupported_dtype(DType::I32, "sqrt")),
        },
        dtype => Err(Error::unsupported_dtype(dtype, "unary")),
    }
}

fn binary_float<T: MathElement>(op: BinaryOp, a: &Tensor, b: &Tensor) -> Tensor {
    let data: Vec<T> = a
        .as_slice::<T>()
        .iter()
        .zip(b.as_slice::<T>())
        .map(|(&x, &y)| match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
        })
        .collect();
    Tensor::from_vec(data, a.shape().clone())
}

pub(crate) fn binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    match a.dtype() {
        DType::F32 => Ok(binary_float::<f32>(op, a, b)),
        DType::F64 => Ok(binary_float::<f64>(op, a, b)),
        DType::I32 => {
            let data: Vec<i32> = a
                .as_slice::<i32>()
                .iter()
                .zip(b.as_slice::<i32>())
                .map(|(&x, &y)| match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => x / y,
                })
                .collect();
            Ok(Tensor::from_vec(data, a.shape().clone()))
        }
        dtype => Err(Error::unsupported_dtype(dtype, "binary")),
    }
}

fn compare_typed<T: Element + PartialOrd>(op: CompareOp, a: &Tensor, b: &Tensor) -> Tensor {
    let data: Vec<u8> = a
        .as_slice::<T>()
        .iter()
        .zip(b.as_slice::<T>())
        .map(|(x, y)| {
            let r = match op {
                CompareOp::Eq => x == y,
                CompareOp::Lt => x < y,
                CompareOp::Gt => x > y,
                CompareOp::Ge => x >= y,
            };
            r as u8
        })
        .collect();
    Tensor::from_vec(data, a.shape().clone())
}

pub(crate) fn compare(op: CompareOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(match a.dtype() {
        DType::F32 => compare_typed::<f32>(op, a, b),
        DType::F64 => compare_typed::<f64>(op, a, b),
        DType::I32 => compare_typed::<i32>(op, a, b),
        DType::Bool => compare_typed::<u8>(op, a, b),
    })
}

fn select_typed<T: Element>(cond: &[u8], x: &Tensor, y: &Tensor) -> Tensor {
    let data: Vec<T> = cond
        .iter()
        .zip(x.as_slice::<T>().iter().zip(y.as_slice::<T>()))
        .map(|(&c, (&t, &f))| if c != 0 { t } else { f })
        .collect();
    Tensor::from_vec(data, x.shape().clone())
}

pub(crate) fn select(cond: &Tensor, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let c = cond.as_slice::<u8>();
    Ok(match x.dtype() {
        DType::F32 => select_typed::<f32>(c, x, y),
        DType::F64 => select_typed::<f64>(c, x, y),
        DType::I32 => select_typed::<i32>(c, x, y),
        DType::Bool => select_typed::<u8>(c, x, y),
    })
}

pub(crate) fn cast(x: &Tensor, to: DType) -> Tensor {
    if x.dtype() == to {
        return x.clone();
    }
    let vals = x.to_f64_vec();
    let shape = x.shape().clone();
    match to {
        DType::F64 => Tensor::from_vec(vals, shape),
        DType::F32 => Tensor::from_vec(vals.iter().map(|&v| v as f32).collect(), shape),
        DType::I32 => Tensor::from_vec(vals.iter().map(|&v| v as i32).collect(), shape),
        DType::Bool => Tensor::from_vec(
            vals.iter().map(|&v| (v != 0.0) as u8).collect(),
            shape,
        ),
    }
}

pub(crate) fn broadcast_in_dim(x: &Tensor, out_shape: &Shape, broadcast_dims: &[usize]) -> Tensor {
    let esize = x.dtype().size_in_bytes();
    let in_shape = x.shape();
    let in_strides = contiguous_strides(in_shape);
    let src = x.as_bytes();
    let mut out = vec![0u8; out_shape.elem_count() * esize];
    let mut flat = 0usize;
    visit_indices(out_shape, |oidx| {
        let mut iflat = 0usize;
        for (i, &od) in broadcast_dims.iter().enumerate() {
            let pos = if in_shape[i] == 1 { 0 } else { oidx[od] };
            iflat += pos * in_strides[i];
        }
        out[flat * esize..(flat + 1) * esize]
            .copy_from_slice(&src[iflat * esize..(iflat + 1) * esize]);
        flat += 1;
    });
    Tensor::from_raw_bytes(out, x.dtype(), out_shape.clone())
}

pub(crate) fn reshape(x: &Tensor, shape: &Shape) -> Tensor {
    Tensor::from_raw_bytes(x.as_bytes().to_vec(), x.dtype(), shape.clone())
}

fn reduce_sum_typed<T: Element + std::ops::Add<Output = T>>(x: &Tensor, axis: usize) -> Tensor {
    let in_shape = x.shape();
    let out_shape: Shape = in_shape
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != axis)
        .map(|(_, &d)| d)
        .collect();
    let out_strides = contiguous_strides(&out_shape);
    let data = x.as_slice::<T>();
    let mut out = vec![T::zero(); out_shape.elem_count()];
    let mut flat = 0usize;
    visit_indices(in_shape, |idx| {
        let mut oflat = 0usize;
        let mut o = 0usize;
        for (d, &i) in idx.iter().enumerate() {
            if d != axis {
                oflat += i * out_strides[o];
                o += 1;
            }
        }
        out[oflat] = out[oflat] + data[flat];
        flat += 1;
    });
    Tensor::from_vec(out, out_shape)
}

pub(crate) fn reduce_sum(x: &Tensor, axis: usize) -> Result<Tensor> {
    match x.dtype() {
        DType::F32 => Ok(reduce_sum_typed::<f32>(x, axis)),
        DType::F64 => Ok(reduce_sum_typed::<f64>(x, axis)),
        DType::I32 => Ok(reduce_sum_typed::<i32>(x, axis)),
        dtype => Err(Error::unsupported_dtype(dtype, "reduce_sum")),
    }
}

pub(crate) fn slice(x: &Tensor, starts: &[usize], limits: &[usize]) -> Tensor {
    let esize = x.dtype().size_in_bytes();
    let in_strides = contiguous_strides(x.shape());
    let out_shape: Shape = starts.iter().zip(limits).map(|(&s, &l)| l - s).collect();
    let src = x.as_bytes();
    let mut out = vec![0u8; out_shape.elem_count() * esize];
    let mut flat = 0usize;
    visit_indices(&out_shape, |oidx| {
        let iflat: usize = oidx
            .iter()
            .zip(starts)
            .zip(&in_strides)
            .map(|((&i, &s), &st)| (i + s) * st)
            .sum();
        out[flat * esize..(flat + 1) * esize]
            .copy_from_slice(&src[iflat * esize..(iflat + 1) * esize]);
        flat += 1;
    });
    Tensor::from_raw_bytes(out, x.dtype(), out_shape)
}

pub(crate) fn update_slice(x: &Tensor, update: &Tensor, starts: &[usize]) -> Tensor {
    let esize = x.dtype().size_in_bytes();
    let in_strides = contiguous_strides(x.shape());
    let mut out = x.as_bytes().to_vec();
    let src = update.as_bytes();
    let mut flat = 0usize;
    visit_indices(update.shape(), |uidx| {
        let oflat: usize = uidx
            .iter()
            .zip(starts)
            .zip(&in_strides)
            .map(|((&i, &s), &st)| (i + s) * st)
            .sum();
        out[oflat * esize..(oflat + 1) * esize]
            .copy_from_slice(&src[flat * esize..(flat + 1) * esize]);
        flat += 1;
    });
    Tensor::from_raw_bytes(out, x.dtype(), x.shape().clone())
}

fn clamp_starts(starts: &[i64], window: &[usize], dims: &[usize], rank: usize) -> Vec<usize> {
    // Trailing-dim starts, clamped so the window stays in bounds.
    let lead = rank - starts.len();
    let mut full = vec![0usize; rank];
    for (i, &s) in starts.iter().enumerate() {
        let dim = dims[lead + i];
        let max_start = dim - window[lead + i];
        full[lead + i] = s.clamp(0, max_start as i64) as usize;
    }
    full
}

pub(crate) fn dynamic_slice(x: &Tensor, starts: &[i64], sizes: &[usize]) -> Tensor {
    let rank = x.ndim();
    let lead = rank - sizes.len();
    let mut window: Vec<usize> = x.shape()[..lead].to_vec();
    window.extend_from_slice(sizes);
    let full_starts = clamp_starts(starts, &window, x.shape(), rank);
    let limits: Vec<usize> = full_starts
        .iter()
        .zip(&window)
        .map(|(&s, &w)| s + w)
        .collect();
    slice(x, &full_starts, &limits)
}

pub(crate) fn dynamic_update_slice(x: &Tensor, update: &Tensor, starts: &[i64]) -> Tensor {
    let full_starts = clamp_starts(starts, update.shape(), x.shape(), x.ndim());
    update_slice(x, update, &full_starts)
}

fn gemm_block<T: MathElement>(
    out: &mut [T],
    a: &[T],
    b: &[T],
    m: usize,
    k: usize,
    n: usize,
    transpose_a: bool,
    transpose_b: bool,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::zero();
            for l in 0..k {
                let av = if transpose_a { a[l * m + i] } else { a[i * k + l] };
                let bv = if transpose_b { b[j * k + l] } else { b[l * n + j] };
                acc = acc + av * bv;
            }
            out[i * n + j] = acc;
        }
    }
}

fn gemm_block_f32_widened(
    out: &mut [f32],
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    transpose_a: bool,
    transpose_b: bool,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f64;
            for l in 0..k {
                let av = if transpose_a { a[l * m + i] } else { a[i * k + l] };
                let bv = if transpose_b { b[j * k + l] } else { b[l * n + j] };
                acc += av as f64 * bv as f64;
            }
            out[i * n + j] = acc as f32;
        }
    }
}

struct MatmulDims {
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    out_shape: Shape,
}

fn matmul_dims(a: &Tensor, transpose_a: bool, b: &Tensor, transpose_b: bool) -> MatmulDims {
    let rank = a.ndim();
    let batch: usize = a.shape()[..rank - 2].iter().product();
    let (m, k) = {
        let (r0, r1) = (a.shape()[rank - 2], a.shape()[rank - 1]);
        if transpose_a { (r1, r0) } else { (r0, r1) }
    };
    let n = {
        let (r0, r1) = (b.shape()[rank - 2], b.shape()[rank - 1]);
        if transpose_b { r0 } else { r1 }
    };
    let out_shape = Shape::concat(&a.shape()[..rank - 2], &[m, n]);
    MatmulDims {
        batch,
        m,
        k,
        n,
        out_shape,
    }
}

fn matmul_typed<T: MathElement>(
    a: &Tensor,
    transpose_a: bool,
    b: &Tensor,
    transpose_b: bool,
    dims: &MatmulDims,
) -> Tensor {
    let (batch, m, k, n) = (dims.batch, dims.m, dims.k, dims.n);
    let a_data = a.as_slice::<T>();
    let b_data = b.as_slice::<T>();
    let mn = m * n;
    let mut out = vec![T::zero(); batch * mn];
    if mn > 0 && batch > 0 {
        let run = |(bi, chunk): (usize, &mut [T])| {
            gemm_block(
                chunk,
                &a_data[bi * m * k..(bi + 1) * m * k],
                &b_data[bi * k * n..(bi + 1) * k * n],
                m,
                k,
                n,
                transpose_a,
                transpose_b,
            );
        };
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            out.par_chunks_mut(mn).enumerate().for_each(run);
        }
        #[cfg(not(feature = "rayon"))]
        out.chunks_mut(mn).enumerate().for_each(run);
    }
    Tensor::from_vec(out, dims.out_shape.clone())
}

fn matmul_f32_widened(
    a: &Tensor,
    transpose_a: bool,
    b: &Tensor,
    transpose_b: bool,
    dims: &MatmulDims,
) -> Tensor {
    let (batch, m, k, n) = (dims.batch, dims.m, dims.k, dims.n);
    let a_data = a.as_slice::<f32>();
    let b_data = b.as_slice::<f32>();
    let mn = m * n;
    let mut out = vec![0.0f32; batch * mn];
    if mn > 0 && batch > 0 {
        let run = |(bi, chunk): (usize, &mut [f32])| {
            gemm_block_f32_widened(
                chunk,
                &a_data[bi * m * k..(bi + 1) * m * k],
                &b_data[bi * k * n..(bi + 1) * k * n],
                m,
                k,
                n,
                transpose_a,
                transpose_b,
            );
        };
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            out.par_chunks_mut(mn).enumerate().for_each(run);
        }
        #[cfg(not(feature = "rayon"))]
        out.chunks_mut(mn).enumerate().for_each(run);
    }
    Tensor::from_vec(out, dims.out_shape.clone())
}

pub(crate) fn matmul(
    a: &Tensor,
    transpose_a: bool,
    b: &Tensor,
    transpose_b: bool,
    precision: Precision,
) -> Result<Tensor> {
    let dims = matmul_dims(a, transpose_a, b, transpose_b);
    match a.dtype() {
        DType::F64 => Ok(matmul_typed::<f64>(a, transpose_a, b, transpose_b, &dims)),
        DType::F32 => {
            if matches!(precision, Precision::Highest) {
                Ok(matmul_f32_widened(a, transpose_a, b, transpose_b, &dims))
            } else {
                Ok(matmul_typed::<f32>(a, transpose_a, b, transpose_b, &dims))
            }
        }
        dtype => Err(Error::unsupported_dtype(dtype, "matmul")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_indices_row_major() {
        let mut seen = Vec::new();
        visit_indices(&[2, 3], |idx| seen.push((idx[0], idx[1])));
        assert_eq!(
            seen,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
        visit_indices(&[0, 3], |_| panic!("empty shape visited"));
    }

    #[test]
    fn test_matmul_transpose_flags() {
        // a = [[1, 2], [3, 4]], b = [[5, 6], [7, 8]]
        let a = Tensor::from_slice(&[1.0f64, 2.0, 3.0, 4.0], [2, 2]);
        let b = Tensor::from_slice(&[5.0f64, 6.0, 7.0, 8.0], [2, 2]);
        let ab = matmul(&a, false, &b, false, Precision::Default).unwrap();
        assert_eq!(ab.to_vec::<f64>(), vec![19.0, 22.0, 43.0, 50.0]);
        let atb = matmul(&a, true, &b, false, Precision::Default).unwrap();
        assert_eq!(atb.to_vec::<f64>(), vec![26.0, 30.0, 38.0, 44.0]);
        let abt = matmul(&a, false, &b, true, Precision::Default).unwrap();
        assert_eq!(abt.to_vec::<f64>(), vec![17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_matmul_zero_width() {
        let a = Tensor::from_slice(&[1.0f32, 2.0], [2, 1]);
        let b = Tensor::zeros([1, 0], DType::F32);
        let ab = matmul(&a, false, &b, false, Precision::Default).unwrap();
        assert_eq!(ab.shape().as_slice(), &[2, 0]);
        assert_eq!(ab.elem_count(), 0);
    }

    #[test]
    fn test_dynamic_slice_clamps() {
        let x = Tensor::from_slice(&[0.0f32, 1.0, 2.0, 3.0], [4]);
        let s = dynamic_slice(&x, &[9], &[2]);
        assert_eq!(s.to_vec::<f32>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_reduce_sum_axis() {
        let x = Tensor::from_slice(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let s0 = reduce_sum(&x, 0).unwrap();
        assert_eq!(s0.to_vec::<f64>(), vec![5.0, 7.0, 9.0]);
        let s1 = reduce_sum(&x, 1).unwrap();
        assert_eq!(s1.to_vec::<f64>(), vec![6.0, 15.0]);
    }
}
