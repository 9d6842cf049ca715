//! Per-video reference data
//!
//! Each video ships four multi-scale feature maps and a reference token. The
//! feature maps are kept as tensors for the lifetime of the video and split
//! along dim 0 when they exceed the per-tensor memory limit.

use crate::error::MediaError;
use crate::token::flatten_values;
use nvc_core::{split_dim0, MemoryLimits, NvcError, Result, Tensor, TensorRegistry, FEATURE_INPUT_COUNT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Shapes of the four reference feature maps
pub const REFERENCE_FEATURE_SHAPES: [[usize; 4]; FEATURE_INPUT_COUNT] = [
    [1, 128, 64, 64],
    [1, 256, 32, 32],
    [1, 512, 16, 16],
    [1, 512, 8, 8],
];

/// Reference shapes as owned vectors, the form configuration carries
pub fn default_reference_shapes() -> Vec<Vec<usize>> {
    REFERENCE_FEATURE_SHAPES.iter().map(|s| s.to_vec()).collect()
}

/// Body of `GET /videos/:id/reference`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencePayload {
    /// Feature maps as (possibly nested) number arrays
    pub reference_features: Vec<Value>,
    /// Reference token
    pub reference_token: Value,
}

/// One feature map, possibly split into parts along dim 0
#[derive(Debug)]
pub struct ReferenceFeature {
    /// Full shape of the feature map
    pub shape: Vec<usize>,
    /// Parts in dim 0 order
    pub parts: Vec<Tensor>,
}

impl ReferenceFeature {
    /// Bytes held by all parts
    pub fn size_bytes(&self) -> usize {
        self.parts.iter().map(Tensor::size_bytes).sum()
    }
}

/// Reference tensors for one video
#[derive(Debug)]
pub struct ReferenceData {
    /// Video the data belongs to
    pub video_id: u64,
    /// Feature maps in model input order
    pub features: Vec<ReferenceFeature>,
    /// Reference token values
    pub token: Vec<f32>,
}

impl ReferenceData {
    /// Build tensors from the HTTP payload
    pub fn from_payload(
        video_id: u64,
        payload: &ReferencePayload,
        shapes: &[Vec<usize>],
        registry: &TensorRegistry,
        limits: &MemoryLimits,
    ) -> Result<Self> {
        if payload.reference_features.len() != shapes.len() {
            return Err(MediaError::InvalidFeatureCount {
                expected: shapes.len(),
                actual: payload.reference_features.len(),
            }
            .into());
        }

        let mut features = Vec::with_capacity(shapes.len());
        for (index, (value, shape)) in payload.reference_features.iter().zip(shapes).enumerate() {
            let values = flatten_values(value)?;
            let expected: usize = shape.iter().product();
            if values.len() != expected {
                return Err(NvcError::ShapeMismatch {
                    context: format!("reference feature {}", index),
                    expected: shape.clone(),
                    actual: vec![values.len()],
                });
            }

            let tensor = registry.tensor(shape.clone(), values)?;
            let name = format!("reference feature {}", index);
            let report = limits.check_tensor_size(&name, &tensor);
            tracing::debug!(
                video_id = video_id,
                feature = index,
                shape = ?report.shape,
                size_mb = report.size_mb,
                exceeds_limit = report.exceeds_limit,
                "Loaded reference feature"
            );
            if let Some(warning) = limits.tensor_warning(&report) {
                tracing::warn!(video_id = video_id, "{:?}", warning);
            }

            let parts = if report.exceeds_limit {
                split_dim0(&tensor, limits.max_tensor_bytes)?
            } else {
                vec![tensor]
            };
            features.push(ReferenceFeature {
                shape: shape.clone(),
                parts,
            });
        }

        let token = flatten_values(&payload.reference_token)?;
        let data = Self {
            video_id,
            features,
            token,
        };
        data.validate()?;
        tracing::info!(
            video_id = video_id,
            tensors = data.tensor_count(),
            size_bytes = data.size_bytes(),
            "Reference data ready"
        );
        Ok(data)
    }

    /// Check that all four features are present with at least one part each
    pub fn validate(&self) -> Result<()> {
        if self.features.len() != FEATURE_INPUT_COUNT {
            return Err(MediaError::InvalidFeatureCount {
                expected: FEATURE_INPUT_COUNT,
                actual: self.features.len(),
            }
            .into());
        }
        for (index, feature) in self.features.iter().enumerate() {
            if feature.parts.is_empty() || feature.parts.iter().any(Tensor::is_empty) {
                return Err(NvcError::TensorDisposed {
                    context: format!("reference feature {}", index),
                });
            }
        }
        Ok(())
    }

    /// Whether every feature is a single unsplit tensor
    pub fn is_unsplit(&self) -> bool {
        self.features.iter().all(|f| f.parts.len() == 1)
    }

    /// Number of tensors held
    pub fn tensor_count(&self) -> usize {
        self.features.iter().map(|f| f.parts.len()).sum()
    }

    /// Bytes held by all feature tensors
    pub fn size_bytes(&self) -> usize {
        self.features.iter().map(ReferenceFeature::size_bytes).sum()
    }
}

/// Reference data keyed by video
///
/// Entries are shared so a decode can hold one while the cache changes.
/// Removing an entry releases its tensors once the last holder drops it.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entries: HashMap<u64, Arc<ReferenceData>>,
}

impl ReferenceCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store data for its video, replacing older data
    pub fn insert(&mut self, data: ReferenceData) -> Arc<ReferenceData> {
        let data = Arc::new(data);
        self.entries.insert(data.video_id, data.clone());
        data
    }

    /// Data for `video_id`
    pub fn get(&self, video_id: u64) -> Option<Arc<ReferenceData>> {
        self.entries.get(&video_id).cloned()
    }

    /// Whether data for `video_id` is cached
    pub fn contains(&self, video_id: u64) -> bool {
        self.entries.contains_key(&video_id)
    }

    /// Drop data for `video_id`
    pub fn remove(&mut self, video_id: u64) -> bool {
        self.entries.remove(&video_id).is_some()
    }

    /// Drop every video except `video_id`
    pub fn retain_only(&mut self, video_id: u64) {
        self.entries.retain(|id, _| *id == video_id);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached videos
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_shapes() -> Vec<Vec<usize>> {
        vec![vec![2, 1, 2, 2], vec![1, 2, 1, 1], vec![1, 1, 1, 2], vec![1, 1, 1, 1]]
    }

    fn payload(shapes: &[Vec<usize>]) -> ReferencePayload {
        ReferencePayload {
            reference_features: shapes
                .iter()
                .map(|s| json!(vec![0.5f32; s.iter().product::<usize>()]))
                .collect(),
            reference_token: json!([([0.1f32; 32])]),
        }
    }

    #[test]
    fn test_default_shapes() {
        let shapes = default_reference_shapes();
        assert_eq!(shapes.len(), 4);
        assert_eq!(shapes[0], vec![1, 128, 64, 64]);
        assert_eq!(shapes[3], vec![1, 512, 8, 8]);
    }

    #[test]
    fn test_from_payload() {
        let registry = TensorRegistry::new();
        let shapes = small_shapes();
        let data = ReferenceData::from_payload(
            7,
            &payload(&shapes),
            &shapes,
            &registry,
            &MemoryLimits::unlimited(),
        )
        .unwrap();

        assert_eq!(data.video_id, 7);
        assert!(data.is_unsplit());
        assert_eq!(data.tensor_count(), 4);
        assert_eq!(data.token.len(), 32);
        assert_eq!(registry.memory().num_tensors, 4);

        drop(data);
        assert_eq!(registry.memory().num_tensors, 0);
    }

    #[test]
    fn test_large_features_are_split() {
        let registry = TensorRegistry::new();
        let shapes = small_shapes();
        let limits = MemoryLimits {
            max_tensor_bytes: 16,
            ..MemoryLimits::unlimited()
        };
        let data =
            ReferenceData::from_payload(1, &payload(&shapes), &shapes, &registry, &limits).unwrap();

        // 8 floats = 32 bytes against a 16 byte limit
        assert_eq!(data.features[0].parts.len(), 2);
        assert_eq!(data.features[0].parts[0].shape(), &[1, 1, 2, 2]);
        assert!(!data.is_unsplit());
        assert_eq!(registry.memory().num_tensors, data.tensor_count());
    }

    #[test]
    fn test_rejects_bad_payloads() {
        let registry = TensorRegistry::new();
        let shapes = small_shapes();
        let limits = MemoryLimits::unlimited();

        let mut short = payload(&shapes);
        short.reference_features.pop();
        assert!(ReferenceData::from_payload(1, &short, &shapes, &registry, &limits).is_err());

        let mut wrong_size = payload(&shapes);
        wrong_size.reference_features[1] = json!([1.0, 2.0, 3.0]);
        assert!(matches!(
            ReferenceData::from_payload(1, &wrong_size, &shapes, &registry, &limits),
            Err(NvcError::ShapeMismatch { .. })
        ));
        assert_eq!(registry.memory().num_tensors, 0);
    }

    #[test]
    fn test_cache_switch_releases_tensors() {
        let registry = TensorRegistry::new();
        let shapes = small_shapes();
        let limits = MemoryLimits::unlimited();
        let mut cache = ReferenceCache::new();

        for id in [1, 2] {
            let data =
                ReferenceData::from_payload(id, &payload(&shapes), &shapes, &registry, &limits)
                    .unwrap();
            cache.insert(data);
        }
        assert_eq!(registry.memory().num_tensors, 8);

        let held = cache.get(1).unwrap();
        cache.retain_only(2);
        assert!(!cache.contains(1));
        assert_eq!(registry.memory().num_tensors, 8);

        drop(held);
        assert_eq!(registry.memory().num_tensors, 4);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(registry.memory().num_tensors, 0);
    }
}
