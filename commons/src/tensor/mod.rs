use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};

/// Element type of a [`Tensor`]. The wire and file formats carry the dtype
/// explicitly so buffers reconstruct exactly on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    I32,
    I64,
    F32,
    F64,
}

impl Default for DType {
    fn default() -> Self {
        DType::I64
    }
}

impl DType {
    pub fn size_of(self) -> usize {
        match self {
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// Statically-typed view over tensor elements. Buffers are little-endian on
/// the wire regardless of host order.
pub trait Element: Copy + Default + 'static {
    const DTYPE: DType;
    fn write_le(values: &[Self], out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Vec<Self>;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(values: &[Self], out: &mut Vec<u8>) {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }

            fn read_le(bytes: &[u8]) -> Vec<Self> {
                bytes
                    .chunks_exact(std::mem::size_of::<$ty>())
                    .map(|c| <$ty>::from_le_bytes(c.try_into().unwrap()))
                    .collect()
            }
        }
    };
}

impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

/// An owned dense numeric buffer: dtype + shape + contiguous row-major data.
/// This is the raw payload lane of the RPC layer and the storage unit of
/// feature frames; it never passes through the metadata encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn zeros(dtype: DType, shape: &[usize]) -> Tensor {
        let len: usize = shape.iter().product::<usize>() * dtype.size_of();
        Tensor {
            dtype,
            shape: shape.to_vec(),
            data: vec![0; len],
        }
    }

    /// 1-D tensor from a slice.
    pub fn from_slice<T: Element>(values: &[T]) -> Tensor {
        let mut data = Vec::with_capacity(values.len() * std::mem::size_of::<T>());
        T::write_le(values, &mut data);
        Tensor {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data,
        }
    }

    pub fn from_array<T: Element>(array: &ArrayD<T>) -> Tensor {
        let shape = array.shape().to_vec();
        let mut data = Vec::with_capacity(array.len() * std::mem::size_of::<T>());
        // iter() walks in row-major (logical) order even for views.
        let values: Vec<T> = array.iter().copied().collect();
        T::write_le(&values, &mut data);
        Tensor { dtype: T::DTYPE, shape, data }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Rows along the leading axis; 1 for a 0-d tensor.
    pub fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype != T::DTYPE {
            return Err(GraphFlowError::Deserialization(format!(
                "dtype mismatch: buffer is {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }

    fn check_sizes(&self) -> Result<()> {
        let expected = self.num_elements() * self.dtype.size_of();
        if self.data.len() != expected {
            return Err(GraphFlowError::Deserialization(format!(
                "buffer of {} bytes does not match shape {:?} ({} bytes)",
                self.data.len(),
                self.shape,
                expected
            )));
        }
        Ok(())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        self.check_sizes()?;
        Ok(T::read_le(&self.data))
    }

    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        let values = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), values)
            .map_err(|e| GraphFlowError::Deserialization(e.to_string()))
    }

    fn row_bytes(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>() * self.dtype.size_of()
    }

    /// Gather rows along the leading axis into a new tensor.
    pub fn rows(&self, row_ids: &[u64]) -> Result<Tensor> {
        self.check_sizes()?;
        let num_rows = self.num_rows() as u64;
        let row_bytes = self.row_bytes();
        let mut data = Vec::with_capacity(row_ids.len() * row_bytes);
        for &id in row_ids {
            if id >= num_rows {
                return Err(GraphFlowError::OutOfRange { id, count: num_rows });
            }
            let start = id as usize * row_bytes;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        let mut shape = self.shape.clone();
        if shape.is_empty() {
            shape.push(1);
        }
        shape[0] = row_ids.len();
        Ok(Tensor { dtype: self.dtype, shape, data })
    }

    /// Scatter `values` into rows along the leading axis.
    pub fn scatter_rows(&mut self, row_ids: &[u64], values: &Tensor) -> Result<()> {
        if values.dtype != self.dtype || values.shape.get(1..) != self.shape.get(1..) {
            return Err(GraphFlowError::Deserialization(format!(
                "scatter value shape {:?}/{:?} does not match column {:?}/{:?}",
                values.shape, values.dtype, self.shape, self.dtype
            )));
        }
        if values.num_rows() != row_ids.len() {
            return Err(GraphFlowError::Deserialization(format!(
                "scatter of {} rows given {} row ids",
                values.num_rows(),
                row_ids.len()
            )));
        }
        let num_rows = self.num_rows() as u64;
        let row_bytes = self.row_bytes();
        for (i, &id) in row_ids.iter().enumerate() {
            if id >= num_rows {
                return Err(GraphFlowError::OutOfRange { id, count: num_rows });
            }
            let dst = id as usize * row_bytes;
            let src = i * row_bytes;
            self.data[dst..dst + row_bytes].copy_from_slice(&values.data[src..src + row_bytes]);
        }
        Ok(())
    }
}
