//! Host tensor type
//!
//! The reference backend evaluates expansion graphs over these tensors:
//! contiguous row-major host data plus a shape. Every kernel produces a
//! fresh contiguous tensor; there are no strided views.

mod shape;
mod storage;

pub use shape::{contiguous_strides, Shape};
pub use storage::Storage;

use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use std::fmt;

/// N-dimensional array stored contiguously on the host
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    /// Create a tensor from a slice of data
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not equal the product of the `shape`
    /// dimensions. For a fallible alternative, use [`Self::try_from_slice`].
    pub fn from_slice<T: Element>(data: &[T], shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        assert_eq!(
            data.len(),
            shape.elem_count(),
            "Data length {} doesn't match shape {:?}",
            data.len(),
            shape
        );
        Self {
            storage: Storage::from_slice(data),
            shape,
        }
    }

    /// Create a tensor from a slice of data (fallible version)
    pub fn try_from_slice<T: Element>(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self {
            storage: Storage::from_slice(data),
            shape,
        })
    }

    /// Create a tensor from an owned buffer.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        assert_eq!(data.len(), shape.elem_count());
        Self {
            storage: Storage::from_vec(data),
            shape,
        }
    }

    /// Create a zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape = shape.into();
        Self {
            storage: Storage::zeros(shape.elem_count(), dtype),
            shape,
        }
    }

    /// Create a scalar tensor.
    pub fn scalar<T: Element>(value: T) -> Self {
        Self::from_slice(&[value], Shape::new())
    }

    /// Create a tensor from raw bytes with explicit dtype.
    pub(crate) fn from_raw_bytes(bytes: Vec<u8>, dtype: DType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let storage = Storage::from_bytes(bytes, dtype);
        assert_eq!(storage.len(), shape.elem_count());
        Self { storage, shape }
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Typed view of the data.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        self.storage.as_slice::<T>()
    }

    /// Raw bytes of the data.
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    /// Copy the data out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.storage.as_slice::<T>().to_vec()
    }

    /// Copy the data out converted to f64 regardless of dtype.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype() {
            DType::F64 => self.to_vec::<f64>(),
            DType::F32 => self.as_slice::<f32>().iter().map(|&v| v as f64).collect(),
            DType::I32 => self.as_slice::<i32>().iter().map(|&v| v as f64).collect(),
            DType::Bool => self.as_slice::<u8>().iter().map(|&v| v as f64).collect(),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {{ shape: {:?}, dtype: {} }}",
            self.shape,
            self.dtype()
        )
    }
}
