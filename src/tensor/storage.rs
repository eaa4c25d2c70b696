//! Storage: host memory with Arc-based sharing

use crate::dtype::{DType, Element};
use std::sync::Arc;

/// Typed backing buffer, tagged by dtype.
///
/// Keeping the buffers typed (rather than raw bytes) guarantees element
/// alignment for the `bytemuck` slice casts below.
#[derive(Debug)]
enum Data {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<u8>),
}

/// Storage for tensor data on the host
///
/// Wraps a contiguous buffer with reference counting so cheap clones of a
/// tensor share the underlying allocation. Element access goes through
/// `bytemuck` casts keyed by the runtime dtype.
#[derive(Clone)]
pub struct Storage {
    data: Arc<Data>,
}

impl Storage {
    /// Create storage from typed data; the dtype is inferred from the
    /// Element type.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let data = match T::DTYPE {
            DType::F64 => Data::F64(bytemuck::cast_slice(data).to_vec()),
            DType::F32 => Data::F32(bytemuck::cast_slice(data).to_vec()),
            DType::I32 => Data::I32(bytemuck::cast_slice(data).to_vec()),
            DType::Bool => Data::Bool(bytemuck::cast_slice(data).to_vec()),
        };
        Self {
            data: Arc::new(data),
        }
    }

    /// Create storage from an owned typed buffer.
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        Self::from_slice(&data)
    }

    /// Create zero-filled storage for `len` elements of `dtype`.
    pub fn zeros(len: usize, dtype: DType) -> Self {
        let data = match dtype {
            DType::F64 => Data::F64(vec![0.0; len]),
            DType::F32 => Data::F32(vec![0.0; len]),
            DType::I32 => Data::I32(vec![0; len]),
            DType::Bool => Data::Bool(vec![0; len]),
        };
        Self {
            data: Arc::new(data),
        }
    }

    /// Create storage from native-endian bytes with explicit dtype.
    ///
    /// # Panics
    ///
    /// Panics if the byte length is not a multiple of the element size.
    pub fn from_bytes(bytes: Vec<u8>, dtype: DType) -> Self {
        assert_eq!(bytes.len() % dtype.size_in_bytes(), 0);
        let data = match dtype {
            DType::F64 => Data::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
                    .collect(),
            ),
            DType::F32 => Data::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
                    .collect(),
            ),
            DType::I32 => Data::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
                    .collect(),
            ),
            DType::Bool => Data::Bool(bytes),
        };
        Self {
            data: Arc::new(data),
        }
    }

    /// Element type of this storage.
    #[inline]
    pub fn dtype(&self) -> DType {
        match &*self.data {
            Data::F64(_) => DType::F64,
            Data::F32(_) => DType::F32,
            Data::I32(_) => DType::I32,
            Data::Bool(_) => DType::Bool,
        }
    }

    /// Number of elements (not bytes).
    #[inline]
    pub fn len(&self) -> usize {
        match &*self.data {
            Data::F64(v) => v.len(),
            Data::F32(v) => v.len(),
            Data::I32(v) => v.len(),
            Data::Bool(v) => v.len(),
        }
    }

    /// Whether the storage holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the storage as a typed slice.
    ///
    /// # Panics
    ///
    /// Panics if `T::DTYPE` does not match the storage dtype.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        assert_eq!(
            T::DTYPE,
            self.dtype(),
            "typed access with {:?} into {:?} storage",
            T::DTYPE,
            self.dtype()
        );
        match &*self.data {
            Data::F64(v) => bytemuck::cast_slice(v),
            Data::F32(v) => bytemuck::cast_slice(v),
            Data::I32(v) => bytemuck::cast_slice(v),
            Data::Bool(v) => bytemuck::cast_slice(v),
        }
    }

    /// Native-endian bytes of the storage.
    pub fn as_bytes(&self) -> &[u8] {
        match &*self.data {
            Data::F64(v) => bytemuck::cast_slice(v),
            Data::F32(v) => bytemuck::cast_slice(v),
            Data::I32(v) => bytemuck::cast_slice(v),
            Data::Bool(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let s = Storage::from_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.len(), 3);
        assert_eq!(s.as_slice::<f32>(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(4, DType::F64);
        assert_eq!(s.as_slice::<f64>(), &[0.0; 4]);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let s = Storage::from_slice(&[1.5f64, -2.5]);
        let round = Storage::from_bytes(s.as_bytes().to_vec(), DType::F64);
        assert_eq!(round.as_slice::<f64>(), &[1.5, -2.5]);
    }

    #[test]
    #[should_panic]
    fn test_dtype_checked_access() {
        let s = Storage::from_slice(&[1.0f32]);
        let _ = s.as_slice::<f64>();
    }
}
