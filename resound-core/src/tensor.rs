//! Owned multi-dtype tensors and their specs.
//!
//! Replay payloads are dense tensors whose first axis is the step axis.
//! [`Tensor`] wraps an [`ndarray::ArrayD`] of one of the supported dtypes
//! so that chunks, wire messages and checkpoints can carry values of
//! mixed dtype without generics spreading through the storage layer.
//! [`TensorSpec`] is the partial-shape contract used by table signatures.

use crate::error::{ResoundError, Result};
use ndarray::{concatenate, stack, ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a [`Tensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
}

impl Dtype {
    /// Whether delta encoding applies to this dtype.
    pub fn is_integer(&self) -> bool {
        matches!(self, Dtype::I32 | Dtype::I64 | Dtype::U8)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
        };
        write!(f, "{}", name)
    }
}

macro_rules! delta_encode_rows {
    ($arr:expr) => {{
        let mut a = $arr;
        let n = a.shape().first().copied().unwrap_or(0);
        for i in (1..n).rev() {
            let prev = a.index_axis(Axis(0), i - 1).to_owned();
            let mut row = a.index_axis_mut(Axis(0), i);
            row.zip_mut_with(&prev, |x, p| *x = x.wrapping_sub(*p));
        }
        a
    }};
}

macro_rules! delta_decode_rows {
    ($arr:expr) => {{
        let mut a = $arr;
        let n = a.shape().first().copied().unwrap_or(0);
        for i in 1..n {
            let prev = a.index_axis(Axis(0), i - 1).to_owned();
            let mut row = a.index_axis_mut(Axis(0), i);
            row.zip_mut_with(&prev, |x, p| *x = x.wrapping_add(*p));
        }
        a
    }};
}

/// An owned dense tensor of one of the supported dtypes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    /// 32-bit float data.
    F32(ArrayD<f32>),
    /// 64-bit float data.
    F64(ArrayD<f64>),
    /// 32-bit signed integer data.
    I32(ArrayD<i32>),
    /// 64-bit signed integer data.
    I64(ArrayD<i64>),
    /// 8-bit unsigned integer data.
    U8(ArrayD<u8>),
}

impl Tensor {
    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match self {
            Tensor::F32(_) => Dtype::F32,
            Tensor::F64(_) => Dtype::F64,
            Tensor::I32(_) => Dtype::I32,
            Tensor::I64(_) => Dtype::I64,
            Tensor::U8(_) => Dtype::U8,
        }
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::F64(a) => a.shape(),
            Tensor::I32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
            Tensor::U8(a) => a.shape(),
        }
    }

    /// Length of the step axis. A rank-0 tensor counts as a single row.
    pub fn num_rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Spec describing this tensor exactly.
    pub fn spec(&self) -> TensorSpec {
        TensorSpec {
            dtype: self.dtype(),
            shape: self.shape().iter().map(|&d| Some(d)).collect(),
        }
    }

    /// Stacks step values along a new leading axis.
    ///
    /// All values must share dtype and shape; the result has shape
    /// `[values.len(), ..shape]`.
    pub fn stack_rows(values: &[Tensor]) -> Result<Tensor> {
        let first = values.first().ok_or_else(|| {
            ResoundError::InvalidArgument("cannot stack zero tensors".to_string())
        })?;
        for (i, v) in values.iter().enumerate() {
            if v.dtype() != first.dtype() || v.shape() != first.shape() {
                return Err(ResoundError::InvalidArgument(format!(
                    "tensor {} has dtype/shape {}/{:?}, expected {}/{:?}",
                    i,
                    v.dtype(),
                    v.shape(),
                    first.dtype(),
                    first.shape()
                )));
            }
        }

        macro_rules! stack_as {
            ($variant:ident) => {{
                let views: Vec<_> = values
                    .iter()
                    .map(|v| match v {
                        Tensor::$variant(a) => a.view(),
                        _ => unreachable!(),
                    })
                    .collect();
                stack(Axis(0), &views)
                    .map(|a| Tensor::$variant(a))
                    .map_err(|e| ResoundError::InvalidArgument(format!("stack failed: {}", e)))
            }};
        }

        match first {
            Tensor::F32(_) => stack_as!(F32),
            Tensor::F64(_) => stack_as!(F64),
            Tensor::I32(_) => stack_as!(I32),
            Tensor::I64(_) => stack_as!(I64),
            Tensor::U8(_) => stack_as!(U8),
        }
    }

    /// Concatenates row blocks along the step axis.
    pub fn concat_rows(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| {
            ResoundError::InvalidArgument("cannot concatenate zero tensors".to_string())
        })?;
        for (i, p) in parts.iter().enumerate() {
            if p.dtype() != first.dtype() || p.shape()[1..] != first.shape()[1..] {
                return Err(ResoundError::InvalidArgument(format!(
                    "row block {} has dtype/shape {}/{:?}, expected {} rows of {:?}",
                    i,
                    p.dtype(),
                    p.shape(),
                    first.dtype(),
                    &first.shape()[1..]
                )));
            }
        }

        macro_rules! concat_as {
            ($variant:ident) => {{
                let views: Vec<_> = parts
                    .iter()
                    .map(|p| match p {
                        Tensor::$variant(a) => a.view(),
                        _ => unreachable!(),
                    })
                    .collect();
                concatenate(Axis(0), &views)
                    .map(|a| Tensor::$variant(a))
                    .map_err(|e| {
                        ResoundError::InvalidArgument(format!("concatenate failed: {}", e))
                    })
            }};
        }

        match first {
            Tensor::F32(_) => concat_as!(F32),
            Tensor::F64(_) => concat_as!(F64),
            Tensor::I32(_) => concat_as!(I32),
            Tensor::I64(_) => concat_as!(I64),
            Tensor::U8(_) => concat_as!(U8),
        }
    }

    /// Returns rows `offset..offset + length` as an owned tensor.
    pub fn slice_rows(&self, offset: usize, length: usize) -> Result<Tensor> {
        if offset + length > self.num_rows() {
            return Err(ResoundError::InvalidArgument(format!(
                "row slice {}..{} out of bounds for {} rows",
                offset,
                offset + length,
                self.num_rows()
            )));
        }
        let slice = Slice::from(offset..offset + length);
        let out = match self {
            Tensor::F32(a) => Tensor::F32(a.slice_axis(Axis(0), slice).to_owned()),
            Tensor::F64(a) => Tensor::F64(a.slice_axis(Axis(0), slice).to_owned()),
            Tensor::I32(a) => Tensor::I32(a.slice_axis(Axis(0), slice).to_owned()),
            Tensor::I64(a) => Tensor::I64(a.slice_axis(Axis(0), slice).to_owned()),
            Tensor::U8(a) => Tensor::U8(a.slice_axis(Axis(0), slice).to_owned()),
        };
        Ok(out)
    }

    /// Removes a length-1 leading axis.
    pub fn squeeze_leading(&self) -> Result<Tensor> {
        if self.shape().first() != Some(&1) {
            return Err(ResoundError::InvalidArgument(format!(
                "cannot squeeze leading axis of shape {:?}",
                self.shape()
            )));
        }
        let out = match self {
            Tensor::F32(a) => Tensor::F32(a.index_axis(Axis(0), 0).to_owned()),
            Tensor::F64(a) => Tensor::F64(a.index_axis(Axis(0), 0).to_owned()),
            Tensor::I32(a) => Tensor::I32(a.index_axis(Axis(0), 0).to_owned()),
            Tensor::I64(a) => Tensor::I64(a.index_axis(Axis(0), 0).to_owned()),
            Tensor::U8(a) => Tensor::U8(a.index_axis(Axis(0), 0).to_owned()),
        };
        Ok(out)
    }

    /// Replaces every row past the first with its wrapping difference
    /// against the previous row. Float tensors are returned unchanged.
    /// The inverse of [`Tensor::delta_decode`]; lossless for all inputs.
    pub fn delta_encode(self) -> Tensor {
        match self {
            Tensor::I32(a) => Tensor::I32(delta_encode_rows!(a)),
            Tensor::I64(a) => Tensor::I64(delta_encode_rows!(a)),
            Tensor::U8(a) => Tensor::U8(delta_encode_rows!(a)),
            other => other,
        }
    }

    /// Undoes [`Tensor::delta_encode`].
    pub fn delta_decode(self) -> Tensor {
        match self {
            Tensor::I32(a) => Tensor::I32(delta_decode_rows!(a)),
            Tensor::I64(a) => Tensor::I64(delta_decode_rows!(a)),
            Tensor::U8(a) => Tensor::U8(delta_decode_rows!(a)),
            other => other,
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::F32(a)
    }
}

impl From<ArrayD<f64>> for Tensor {
    fn from(a: ArrayD<f64>) -> Self {
        Tensor::F64(a)
    }
}

impl From<ArrayD<i32>> for Tensor {
    fn from(a: ArrayD<i32>) -> Self {
        Tensor::I32(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::I64(a)
    }
}

impl From<ArrayD<u8>> for Tensor {
    fn from(a: ArrayD<u8>) -> Self {
        Tensor::U8(a)
    }
}

/// A dtype and partial shape constraint. `None` axes match any length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Required element type.
    pub dtype: Dtype,
    /// Required shape; `None` entries are unconstrained.
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    /// Whether `tensor` satisfies this spec.
    pub fn is_compatible(&self, tensor: &Tensor) -> bool {
        self.is_compatible_with(tensor.dtype(), tensor.shape())
    }

    /// Whether a tensor of the given dtype and shape satisfies this spec.
    pub fn is_compatible_with(&self, dtype: Dtype, shape: &[usize]) -> bool {
        dtype == self.dtype
            && shape.len() == self.shape.len()
            && self
                .shape
                .iter()
                .zip(shape.iter())
                .all(|(spec, dim)| spec.map_or(true, |d| d == *dim))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .shape
            .iter()
            .map(|d| match d {
                Some(d) => d.to_string(),
                None => "?".to_string(),
            })
            .collect();
        write!(f, "{}[{}]", self.dtype, dims.join(", "))
    }
}

/// Per-column spec of the items a table accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, for error messages.
    pub name: String,
    /// Constraint on each cell of the column.
    pub spec: TensorSpec,
}

/// The dtype/shape contract a table advertises for its items, one
/// [`ColumnSpec`] per trajectory column.
pub type Signature = Vec<ColumnSpec>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn t_i64(v: Vec<i64>) -> Tensor {
        let n = v.len();
        Tensor::I64(ArrayD::from_shape_vec(IxDyn(&[n]), v).unwrap())
    }

    #[test]
    fn stack_and_slice() {
        let rows = vec![
            Tensor::F32(ArrayD::from_elem(IxDyn(&[2]), 0.0)),
            Tensor::F32(ArrayD::from_elem(IxDyn(&[2]), 1.0)),
            Tensor::F32(ArrayD::from_elem(IxDyn(&[2]), 2.0)),
        ];
        let stacked = Tensor::stack_rows(&rows).unwrap();
        assert_eq!(stacked.shape(), &[3, 2]);
        let mid = stacked.slice_rows(1, 1).unwrap();
        assert_eq!(mid, Tensor::F32(ArrayD::from_elem(IxDyn(&[1, 2]), 1.0)));
        assert_eq!(
            mid.squeeze_leading().unwrap(),
            Tensor::F32(ArrayD::from_elem(IxDyn(&[2]), 1.0))
        );
    }

    #[test]
    fn stack_rejects_mixed_shapes() {
        let rows = vec![
            Tensor::F32(ArrayD::from_elem(IxDyn(&[2]), 0.0)),
            Tensor::F32(ArrayD::from_elem(IxDyn(&[3]), 1.0)),
        ];
        assert!(matches!(
            Tensor::stack_rows(&rows),
            Err(ResoundError::InvalidArgument(_))
        ));
    }

    #[test]
    fn delta_round_trip() {
        let t = t_i64(vec![5, 7, 12, 11, i64::MIN, i64::MAX]);
        let encoded = t.clone().delta_encode();
        assert_ne!(encoded, t);
        assert_eq!(encoded.clone().delta_decode(), t);
    }

    #[test]
    fn delta_leaves_floats_untouched() {
        let t = Tensor::F32(ArrayD::from_elem(IxDyn(&[4, 2]), 1.5));
        assert_eq!(t.clone().delta_encode(), t);
    }

    #[test]
    fn spec_compatibility() {
        let spec = TensorSpec {
            dtype: Dtype::F32,
            shape: vec![None, Some(3)],
        };
        let ok = Tensor::F32(ArrayD::from_elem(IxDyn(&[7, 3]), 0.0));
        let bad_dim = Tensor::F32(ArrayD::from_elem(IxDyn(&[7, 4]), 0.0));
        let bad_rank = Tensor::F32(ArrayD::from_elem(IxDyn(&[3]), 0.0));
        assert!(spec.is_compatible(&ok));
        assert!(!spec.is_compatible(&bad_dim));
        assert!(!spec.is_compatible(&bad_rank));
        assert_eq!(format!("{}", spec), "f32[?, 3]");
    }
}
