//! Integration tests for the frame decoding pipeline
//!
//! These run the decoder against the synthetic model and check tensor
//! lifecycle accounting, both decode paths and buffering of the results.

use nvc_core::{GraphModel, MemoryLimits, ModelInputs, NvcError, Result, Tensor, TensorRegistry};
use nvc_media::*;
use serde_json::json;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};

fn small_shapes() -> Vec<Vec<usize>> {
    vec![
        vec![1, 2, 2, 4],
        vec![1, 4, 2, 2],
        vec![1, 8, 1, 1],
        vec![1, 2, 2, 1],
    ]
}

fn reference(registry: &TensorRegistry, limits: &MemoryLimits) -> ReferenceData {
    reference_with(&small_shapes(), registry, limits)
}

fn reference_with(
    shapes: &[Vec<usize>],
    registry: &TensorRegistry,
    limits: &MemoryLimits,
) -> ReferenceData {
    let payload = ReferencePayload {
        reference_features: shapes
            .iter()
            .map(|s| json!([vec![0.2f32; s.iter().product::<usize>()]]))
            .collect(),
        reference_token: json!([([0.0f32; 32])]),
    };
    ReferenceData::from_payload(3, &payload, shapes, registry, limits).unwrap()
}

/// Synthetic model that records the threads it executes on
#[derive(Debug, Default)]
struct ThreadRecordingModel {
    inner: SyntheticModel,
    threads: Mutex<Vec<ThreadId>>,
}

impl GraphModel for ThreadRecordingModel {
    fn input_names(&self) -> Vec<String> {
        self.inner.input_names()
    }

    fn execute(&self, inputs: &ModelInputs<'_>, registry: &TensorRegistry) -> Result<Tensor> {
        self.threads.lock().push(thread::current().id());
        self.inner.execute(inputs, registry)
    }
}

fn token(index: u64, value: f32) -> FrameToken {
    FrameToken::from_json(index, &json!([[vec![value; TOKEN_LEN]]])).unwrap()
}

// ============================================================================
// TENSOR LIFECYCLE TESTS
// ============================================================================

#[tokio::test]
async fn test_process_frame_releases_intermediates() {
    let registry = TensorRegistry::new();
    let reference = reference(&registry, &MemoryLimits::unlimited());
    let decoder = FrameDecoder::new(registry.clone());
    let model = SyntheticModel::new(4, 6);

    let baseline = registry.memory().num_tensors;
    let frame = decoder
        .process_frame(&model, &reference, &token(0, 0.4))
        .unwrap();

    assert_eq!(registry.memory().num_tensors, baseline);
    assert_eq!((frame.width(), frame.height()), (6, 4));
    assert!(registry.total_created() > baseline as u64);
}

#[tokio::test]
async fn test_failed_decode_releases_intermediates() {
    let registry = TensorRegistry::new();
    let reference = reference(&registry, &MemoryLimits::unlimited());
    let decoder = FrameDecoder::new(registry.clone());
    let model = SyntheticModel::default();

    let baseline = registry.memory().num_tensors;
    let result = decoder.process_frame(&model, &reference, &token(1, -1.0));

    assert!(matches!(result, Err(NvcError::InferenceFailed { .. })));
    assert_eq!(registry.memory().num_tensors, baseline);
}

#[tokio::test]
async fn test_split_features_are_concatenated() {
    let registry = TensorRegistry::new();
    // Feature 0 holds 64 bytes and is split into two parts of one row each
    let limits = MemoryLimits {
        max_tensor_bytes: 32,
        ..MemoryLimits::unlimited()
    };
    let mut shapes = small_shapes();
    shapes[0] = vec![2, 2, 2, 2];
    let reference = reference_with(&shapes, &registry, &limits);
    assert_eq!(reference.features[0].parts.len(), 2);

    let decoder = FrameDecoder::new(registry.clone());
    let baseline = registry.memory().num_tensors;
    // Two rows after concat cannot be added to the single-row outputs
    let result = decoder.process_frame(&SyntheticModel::default(), &reference, &token(0, 0.1));
    assert!(matches!(result, Err(NvcError::ShapeMismatch { .. })));
    assert_eq!(registry.memory().num_tensors, baseline);
}

// ============================================================================
// DECODE PATH TESTS
// ============================================================================

#[tokio::test]
async fn test_batch_and_per_feature_paths_agree() {
    let registry = TensorRegistry::new();
    let reference = Arc::new(reference(&registry, &MemoryLimits::unlimited()));
    let decoder = Arc::new(FrameDecoder::new(registry.clone()));
    let model: Arc<dyn GraphModel> = Arc::new(SyntheticModel::new(2, 2));

    let single = decoder
        .process_frame(model.as_ref(), &reference, &token(5, 0.4))
        .unwrap();

    let mut frames = Vec::new();
    let summary = decoder
        .process_batch(model, reference, vec![token(5, 0.4)], 10, |index, result| {
            frames.push((index, result))
        })
        .await;

    assert_eq!(summary, BatchSummary { decoded: 1, failed: 0 });
    let (index, batched) = frames.pop().unwrap();
    assert_eq!(index, 5);
    assert_eq!(batched.unwrap(), single);
}

#[tokio::test]
async fn test_batch_counts_failures() {
    let registry = TensorRegistry::new();
    let reference = Arc::new(reference(&registry, &MemoryLimits::unlimited()));
    let decoder = Arc::new(FrameDecoder::new(registry.clone()));
    let model: Arc<dyn GraphModel> = Arc::new(SyntheticModel::default());

    let tokens: Vec<FrameToken> = (0..25)
        .map(|i| token(i, if i % 5 == 4 { -0.5 } else { 0.5 }))
        .collect();
    let baseline = registry.memory().num_tensors;

    let mut order = Vec::new();
    let summary = decoder
        .process_batch(
            model,
            Arc::clone(&reference),
            tokens,
            DEFAULT_CHUNK_SIZE,
            |index, _| order.push(index),
        )
        .await;

    assert_eq!(summary.decoded, 20);
    assert_eq!(summary.failed, 5);
    assert_eq!(order, (0..25).collect::<Vec<_>>());
    assert_eq!(registry.memory().num_tensors, baseline);
}

#[tokio::test]
async fn test_released_reference_is_rejected() {
    let registry = TensorRegistry::new();
    let mut reference = reference(&registry, &MemoryLimits::unlimited());
    reference.features[2].parts.clear();

    let decoder = FrameDecoder::new(registry.clone());
    let result = decoder.process_frame(&SyntheticModel::default(), &reference, &token(0, 0.5));
    assert!(matches!(result, Err(NvcError::TensorDisposed { .. })));
}

#[tokio::test]
async fn test_batch_decodes_off_the_runtime_thread() {
    let registry = TensorRegistry::new();
    let reference = Arc::new(reference(&registry, &MemoryLimits::unlimited()));
    let decoder = Arc::new(FrameDecoder::new(registry.clone()));
    let model = Arc::new(ThreadRecordingModel::default());

    let ticks = Arc::new(Mutex::new(0u32));
    let ticker = {
        let ticks = ticks.clone();
        tokio::spawn(async move {
            loop {
                *ticks.lock() += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    let tokens: Vec<FrameToken> = (0..12).map(|i| token(i, 0.5)).collect();
    let summary = decoder
        .process_batch(model.clone(), reference, tokens, 3, |_, _| {})
        .await;
    ticker.abort();

    assert_eq!(summary.decoded, 12);
    let runtime_thread = thread::current().id();
    let threads = model.threads.lock();
    assert_eq!(threads.len(), 12);
    assert!(threads.iter().all(|id| *id != runtime_thread));
    assert!(*ticks.lock() > 0);
}

// ============================================================================
// BUFFERING TESTS
// ============================================================================

#[tokio::test]
async fn test_decoded_frames_fill_buffer_within_capacity() {
    let registry = TensorRegistry::new();
    let reference = Arc::new(reference(&registry, &MemoryLimits::unlimited()));
    let decoder = Arc::new(FrameDecoder::new(registry.clone()));
    let model: Arc<dyn GraphModel> = Arc::new(SyntheticModel::new(2, 2));
    let mut buffer = FrameBuffer::new(8);

    let tokens: Vec<FrameToken> = (0..20).map(|i| token(i, 0.25)).collect();
    decoder
        .process_batch(model, reference, tokens, 4, |index, result| {
            if let Ok(frame) = result {
                buffer.insert(index, frame, 0);
            }
            assert!(buffer.len() <= buffer.capacity());
        })
        .await;

    assert_eq!(buffer.len(), 8);
    assert_eq!(buffer.indices().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());

    let url = buffer.get(0).unwrap().frame.to_data_url().unwrap();
    assert!(url.starts_with("data:image/png;base64,"));
}
