//! Dense `f32` tensors with lifecycle accounting
//!
//! Every tensor is created through a [`TensorRegistry`] which tracks how many
//! tensors and bytes are alive. Dropping a tensor releases it, so all
//! intermediates of a decode step are gone once the step's scope ends, on the
//! error path as well as on success. The registry counters make that
//! observable.
//!
//! Element storage is an [`ndarray::ArrayD`] kept in standard (row-major)
//! layout, so [`Tensor::data`] is always one contiguous slice.

use crate::error::{NvcError, Result};
use ndarray::{ArrayD, Axis, IxDyn, ShapeError, Slice};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one element in bytes
pub const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// Snapshot of live tensor memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Number of live tensors
    pub num_tensors: usize,
    /// Bytes held by live tensors
    pub num_bytes: usize,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    live_tensors: AtomicUsize,
    live_bytes: AtomicUsize,
    total_created: AtomicU64,
}

/// Factory and accountant for tensors
///
/// Cloning a registry yields a handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct TensorRegistry {
    counters: Arc<RegistryCounters>,
}

impl TensorRegistry {
    /// Create a new registry with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tensor, validating that `data` fills `shape` exactly
    pub fn tensor(&self, shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Tensor> {
        let shape = shape.into();
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| {
            NvcError::InvalidData {
                reason: format!(
                    "tensor of shape {:?} needs {} values, got {}: {}",
                    shape,
                    shape.iter().product::<usize>(),
                    len,
                    e
                ),
            }
        })?;
        Ok(self.track(array))
    }

    /// Create a zero-filled tensor
    pub fn zeros(&self, shape: impl Into<Vec<usize>>) -> Tensor {
        let shape = shape.into();
        self.track(ArrayD::zeros(IxDyn(&shape)))
    }

    /// Wrap an existing array
    pub fn from_array(&self, array: ArrayD<f32>) -> Tensor {
        self.track(array)
    }

    /// Create the `[1, len]` model input for a frame token
    pub fn from_token(&self, token: &[f32]) -> Result<Tensor> {
        if token.is_empty() {
            return Err(NvcError::InvalidData {
                reason: "empty token".to_string(),
            });
        }
        self.tensor(vec![1, token.len()], token.to_vec())
    }

    /// Current live tensor memory
    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.counters.live_tensors.load(Ordering::Acquire),
            num_bytes: self.counters.live_bytes.load(Ordering::Acquire),
        }
    }

    /// Total number of tensors created through this registry
    pub fn total_created(&self) -> u64 {
        self.counters.total_created.load(Ordering::Relaxed)
    }

    fn track(&self, array: ArrayD<f32>) -> Tensor {
        let data = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        let bytes = data.len() * ELEMENT_BYTES;
        self.counters.live_tensors.fetch_add(1, Ordering::AcqRel);
        self.counters.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.counters.total_created.fetch_add(1, Ordering::Relaxed);
        Tensor {
            data,
            registry: self.clone(),
        }
    }

    fn release(&self, bytes: usize) {
        self.counters.live_tensors.fetch_sub(1, Ordering::AcqRel);
        self.counters.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

fn shape_error(context: &str, err: ShapeError) -> NvcError {
    NvcError::InvalidData {
        reason: format!("{}: {}", context, err),
    }
}

/// A dense row-major `f32` tensor
pub struct Tensor {
    data: ArrayD<f32>,
    registry: TensorRegistry,
}

impl Tensor {
    /// Tensor shape
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    /// Flat element data in row-major order
    pub fn data(&self) -> &[f32] {
        self.data.as_slice().unwrap_or(&[])
    }

    /// Underlying array
    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the element data in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() * ELEMENT_BYTES
    }

    /// Registry the tensor is accounted in
    pub fn registry(&self) -> &TensorRegistry {
        &self.registry
    }

    /// Release the tensor now
    pub fn dispose(self) {
        drop(self);
    }

    /// Copy into a new tensor with a different shape of equal element count
    pub fn reshape(&self, shape: impl Into<Vec<usize>>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.iter().product::<usize>() != self.len() {
            return Err(NvcError::ShapeMismatch {
                context: "reshape".to_string(),
                expected: self.shape().to_vec(),
                actual: shape,
            });
        }
        let array = self
            .data
            .clone()
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| shape_error("reshape", e))?;
        Ok(self.registry.track(array))
    }

    /// Copy rows `start..end` of the leading dimension
    pub fn slice_dim0(&self, start: usize, end: usize) -> Result<Tensor> {
        let dim0 = self.leading_dim("slice_dim0")?;
        if start >= end || end > dim0 {
            return Err(NvcError::InvalidData {
                reason: format!("slice {}..{} out of range for dim0 {}", start, end, dim0),
            });
        }
        let rows = self
            .data
            .slice_axis(Axis(0), Slice::from(start..end))
            .to_owned();
        Ok(self.registry.track(rows))
    }

    /// Concatenate tensors along the leading dimension
    pub fn concat_dim0(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| NvcError::InvalidData {
            reason: "concat_dim0 of zero tensors".to_string(),
        })?;
        first.leading_dim("concat_dim0")?;

        for part in parts {
            if part.rank() != first.rank() || part.shape()[1..] != first.shape()[1..] {
                return Err(NvcError::ShapeMismatch {
                    context: "concat_dim0".to_string(),
                    expected: first.shape().to_vec(),
                    actual: part.shape().to_vec(),
                });
            }
        }

        let views: Vec<_> = parts.iter().map(|part| part.data.view()).collect();
        let joined =
            ndarray::concatenate(Axis(0), &views).map_err(|e| shape_error("concat_dim0", e))?;
        Ok(first.registry.track(joined))
    }

    /// Element-wise sum of two tensors of identical shape
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape() != other.shape() {
            return Err(NvcError::ShapeMismatch {
                context: "add".to_string(),
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }
        Ok(self.registry.track(&self.data + &other.data))
    }

    /// Permute a rank-4 tensor from `[N, C, H, W]` to `[N, H, W, C]`
    pub fn transpose_nchw_to_nhwc(&self) -> Result<Tensor> {
        if self.rank() != 4 {
            return Err(NvcError::ShapeMismatch {
                context: "transpose_nchw_to_nhwc".to_string(),
                expected: vec![0, 0, 0, 0],
                actual: self.shape().to_vec(),
            });
        }
        let permuted = self.data.view().permuted_axes(IxDyn(&[0, 2, 3, 1]));
        Ok(self.registry.track(permuted.as_standard_layout().into_owned()))
    }

    /// Drop a leading dimension of size one
    pub fn squeeze0(&self) -> Result<Tensor> {
        match self.shape().first() {
            Some(1) if self.rank() > 1 => Ok(self
                .registry
                .track(self.data.index_axis(Axis(0), 0).to_owned())),
            _ => Err(NvcError::ShapeMismatch {
                context: "squeeze0".to_string(),
                expected: vec![1],
                actual: self.shape().to_vec(),
            }),
        }
    }

    /// Clamp every element into `[min, max]`
    pub fn clip(&self, min: f32, max: f32) -> Tensor {
        self.registry.track(self.data.mapv(|v| v.clamp(min, max)))
    }

    fn leading_dim(&self, context: &str) -> Result<usize> {
        self.shape()
            .first()
            .copied()
            .ok_or_else(|| NvcError::ShapeMismatch {
                context: context.to_string(),
                expected: vec![1],
                actual: Vec::new(),
            })
    }
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        self.registry.track(self.data.clone())
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.registry.release(self.data.len() * ELEMENT_BYTES);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Split a tensor along dim 0 so that no part exceeds `max_bytes`
///
/// The split count is `max(1, floor(bytes / max_bytes))` and each part holds
/// `ceil(dim0 / count)` rows, the last one possibly fewer. A tensor whose
/// leading dimension cannot be divided further is returned as a single part.
pub fn split_dim0(tensor: &Tensor, max_bytes: usize) -> Result<Vec<Tensor>> {
    let dim0 = tensor.leading_dim("split_dim0")?;
    let count = if max_bytes == 0 {
        dim0
    } else {
        (tensor.size_bytes() / max_bytes).max(1)
    };
    let split_size = dim0.div_ceil(count.max(1)).max(1);

    let mut parts = Vec::with_capacity(count);
    let mut start = 0;
    while start < dim0 {
        let end = (start + split_size).min(dim0);
        parts.push(tensor.slice_dim0(start, end)?);
        start = end;
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_lifecycle() {
        let registry = TensorRegistry::new();
        assert_eq!(registry.memory(), MemoryInfo::default());

        let a = registry.zeros(vec![2, 3]);
        let b = registry.tensor(vec![2, 3], vec![1.0; 6]).unwrap();
        assert_eq!(registry.memory().num_tensors, 2);
        assert_eq!(registry.memory().num_bytes, 48);

        let sum = a.add(&b).unwrap();
        assert_eq!(sum.data(), &[1.0; 6]);
        assert_eq!(registry.memory().num_tensors, 3);

        drop(a);
        b.dispose();
        drop(sum);
        assert_eq!(registry.memory(), MemoryInfo::default());
        assert_eq!(registry.total_created(), 3);
    }

    #[test]
    fn test_shape_validation() {
        let registry = TensorRegistry::new();
        assert!(registry.tensor(vec![2, 2], vec![0.0; 3]).is_err());
        assert!(registry.from_token(&[]).is_err());

        let token = registry.from_token(&[0.5; 32]).unwrap();
        assert_eq!(token.shape(), &[1, 32]);
        drop(token);
        assert_eq!(registry.memory().num_tensors, 0);
    }

    #[test]
    fn test_slice_and_concat() {
        let registry = TensorRegistry::new();
        let t = registry
            .tensor(vec![4, 2], (0..8).map(|v| v as f32).collect())
            .unwrap();

        let head = t.slice_dim0(0, 3).unwrap();
        let tail = t.slice_dim0(3, 4).unwrap();
        assert_eq!(head.shape(), &[3, 2]);
        assert_eq!(tail.data(), &[6.0, 7.0]);

        let joined = Tensor::concat_dim0(&[head, tail]).unwrap();
        assert_eq!(joined.shape(), t.shape());
        assert_eq!(joined.data(), t.data());

        assert!(t.slice_dim0(3, 3).is_err());
        assert!(t.slice_dim0(2, 5).is_err());

        let other = registry.zeros(vec![1, 3]);
        assert!(matches!(
            Tensor::concat_dim0(&[t.clone(), other]),
            Err(NvcError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transpose_squeeze_clip() {
        let registry = TensorRegistry::new();
        // [1, 3, 1, 2]: channel planes r=[0,1] g=[2,3] b=[4,5]
        let nchw = registry
            .tensor(vec![1, 3, 1, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap();
        let nhwc = nchw.transpose_nchw_to_nhwc().unwrap();
        assert_eq!(nhwc.shape(), &[1, 1, 2, 3]);
        assert_eq!(nhwc.data(), &[0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);

        let hwc = nhwc.squeeze0().unwrap();
        assert_eq!(hwc.shape(), &[1, 2, 3]);
        assert!(hwc.squeeze0().is_ok());
        assert!(registry.zeros(vec![2, 2]).squeeze0().is_err());

        let clipped = hwc.clip(0.0, 1.0);
        assert!(clipped.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_split_dim0() {
        let registry = TensorRegistry::new();
        let t = registry.zeros(vec![8, 4]); // 128 bytes

        let whole = split_dim0(&t, 1024).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].shape(), &[8, 4]);

        // floor(128 / 40) = 3 parts of ceil(8 / 3) = 3 rows
        let parts = split_dim0(&t, 40).unwrap();
        let rows: Vec<usize> = parts.iter().map(|p| p.shape()[0]).collect();
        assert_eq!(rows, vec![3, 3, 2]);

        let single_row = registry.zeros(vec![1, 1024]);
        assert_eq!(split_dim0(&single_row, 16).unwrap().len(), 1);

        drop(parts);
        drop(whole);
        drop(single_row);
        drop(t);
        assert_eq!(registry.memory().num_tensors, 0);
    }
}
