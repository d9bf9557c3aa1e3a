//! Internal tensor representation.
//!
//! Tensors are byte buffers tagged with a precision and a shape. Buffers are
//! reference counted so that demultiplexing can hand out per-branch views
//! without copying the parent allocation.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Map of tensor name to tensor, the unit of data exchanged between nodes.
pub type TensorMap = HashMap<String, Tensor>;

/// Map of tensor name to its declared metadata.
pub type TensorInfoMap = HashMap<String, TensorInfo>;

/// Element precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 32-bit IEEE float.
    Fp32,
    /// 64-bit IEEE float.
    Fp64,
    /// 16-bit IEEE float.
    Fp16,
    /// Signed 64-bit integer.
    I64,
    /// Signed 32-bit integer.
    I32,
    /// Signed 16-bit integer.
    I16,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 8-bit integer.
    U8,
}

impl Precision {
    /// Size of a single element in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        match self {
            Self::Fp64 | Self::I64 => 8,
            Self::Fp32 | Self::I32 => 4,
            Self::Fp16 | Self::I16 | Self::U16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp64 => write!(f, "fp64"),
            Self::Fp16 => write!(f, "fp16"),
            Self::I64 => write!(f, "i64"),
            Self::I32 => write!(f, "i32"),
            Self::I16 => write!(f, "i16"),
            Self::I8 => write!(f, "i8"),
            Self::U16 => write!(f, "u16"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// One dimension of a declared tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// Any size is accepted.
    Any,
    /// A fixed size.
    Fixed(usize),
}

impl Dim {
    /// Whether this dimension accepts the other in a connection check.
    #[must_use]
    pub fn compatible(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "?"),
            Self::Fixed(size) => write!(f, "{size}"),
        }
    }
}

/// Declared metadata of a model or plugin tensor, used to validate
/// producer/consumer connections at definition time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Tensor name.
    pub name: String,
    /// Element precision.
    pub precision: Precision,
    /// Declared shape; dimensions may be dynamic.
    pub shape: Vec<Dim>,
}

impl TensorInfo {
    /// Creates a fully static tensor info.
    #[must_use]
    pub fn new(name: impl Into<String>, precision: Precision, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            precision,
            shape: shape.iter().map(|&d| Dim::Fixed(d)).collect(),
        }
    }

    /// Creates a tensor info with explicit (possibly dynamic) dimensions.
    #[must_use]
    pub fn with_dims(name: impl Into<String>, precision: Precision, shape: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            precision,
            shape,
        }
    }

    /// Renders the declared shape as `[a,b,?]`.
    #[must_use]
    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(ToString::to_string).collect();
        format!("[{}]", dims.join(","))
    }
}

/// A tensor: precision, shape, and a view into a shared byte buffer.
///
/// Cloning a tensor clones the view, not the bytes.
#[derive(Debug, Clone)]
pub struct Tensor {
    precision: Precision,
    shape: Vec<usize>,
    data: Arc<Vec<u8>>,
    offset: usize,
    len: usize,
}

impl Tensor {
    /// Creates a tensor owning `data`.
    ///
    /// Fails if the buffer length does not match the shape-implied length.
    pub fn new(
        precision: Precision,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        let expected = shape.iter().product::<usize>() * precision.element_size();
        if data.len() != expected {
            return Err(PipelineError::TensorSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let len = data.len();
        Ok(Self {
            precision,
            shape,
            data: Arc::new(data),
            offset: 0,
            len,
        })
    }

    /// Element precision.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Tensor shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total byte length of the tensor contents.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.len
    }

    /// Raw tensor bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Returns a zero-copy view of slice `index` along the leading dimension,
    /// with the leading dimension removed from the shape.
    pub fn slice_outer(&self, index: usize) -> Result<Self, PipelineError> {
        let Some((&outer, rest)) = self.shape.split_first() else {
            return Err(PipelineError::internal("cannot slice a rank-0 tensor"));
        };
        if index >= outer {
            return Err(PipelineError::internal(format!(
                "slice index {index} out of bounds for leading dimension {outer}"
            )));
        }
        let step = self.len / outer;
        Ok(Self {
            precision: self.precision,
            shape: rest.to_vec(),
            data: Arc::clone(&self.data),
            offset: self.offset + index * step,
            len: step,
        })
    }

    /// Stacks `parts` into one tensor with a new leading dimension equal to
    /// `parts.len()`. All parts must agree on shape and precision.
    ///
    /// Used by gather recombination; callers pass parts in ascending branch
    /// order so downstream results are deterministic.
    pub fn stack_outer(parts: &[Self]) -> Result<Self, PipelineError> {
        let Some(first) = parts.first() else {
            return Err(PipelineError::internal("cannot stack zero tensors"));
        };
        for part in parts {
            if part.shape != first.shape || part.precision != first.precision {
                return Err(PipelineError::internal(
                    "cannot stack tensors with differing shapes or precisions",
                ));
            }
        }
        let mut data = Vec::with_capacity(first.byte_size() * parts.len());
        for part in parts {
            data.extend_from_slice(part.data());
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&first.shape);
        Self::new(first.precision, shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(shape: &[usize], values: &[f32]) -> Tensor {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tensor::new(Precision::Fp32, shape.to_vec(), data).unwrap()
    }

    fn to_f32(tensor: &Tensor) -> Vec<f32> {
        tensor
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_new_rejects_wrong_byte_length() {
        let err = Tensor::new(Precision::Fp32, vec![2, 2], vec![0u8; 15]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TensorSizeMismatch {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn test_slice_outer_shares_buffer() {
        let tensor = f32_tensor(&[2, 1, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let first = tensor.slice_outer(0).unwrap();
        let second = tensor.slice_outer(1).unwrap();
        assert_eq!(first.shape(), &[1, 3]);
        assert_eq!(to_f32(&first), vec![1.0, 2.0, 3.0]);
        assert_eq!(to_f32(&second), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let tensor = f32_tensor(&[2, 1, 1], &[1.0, 2.0]);
        assert!(tensor.slice_outer(2).is_err());
    }

    #[test]
    fn test_stack_restores_sliced_tensor() {
        let tensor = f32_tensor(&[3, 1, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let parts: Vec<Tensor> = (0..3).map(|i| tensor.slice_outer(i).unwrap()).collect();
        let stacked = Tensor::stack_outer(&parts).unwrap();
        assert_eq!(stacked.shape(), tensor.shape());
        assert_eq!(stacked.data(), tensor.data());
    }

    #[test]
    fn test_stack_rejects_mixed_shapes() {
        let a = f32_tensor(&[1, 2], &[1.0, 2.0]);
        let b = f32_tensor(&[2, 1], &[1.0, 2.0]);
        assert!(Tensor::stack_outer(&[a, b]).is_err());
    }

    #[test]
    fn test_dim_compatibility() {
        assert!(Dim::Any.compatible(&Dim::Fixed(5)));
        assert!(Dim::Fixed(5).compatible(&Dim::Fixed(5)));
        assert!(!Dim::Fixed(5).compatible(&Dim::Fixed(6)));
    }

    #[test]
    fn test_precision_element_sizes() {
        assert_eq!(Precision::Fp32.element_size(), 4);
        assert_eq!(Precision::Fp16.element_size(), 2);
        assert_eq!(Precision::U8.element_size(), 1);
        assert_eq!(Precision::I64.element_size(), 8);
    }

    #[test]
    fn test_precision_serde_round_trip() {
        let json = serde_json::to_string(&Precision::Fp32).unwrap();
        assert_eq!(json, r#""fp32""#);
        let back: Precision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Precision::Fp32);
    }
}
