//! Token to frame decoding
//!
//! A frame is reconstructed by running the graph model against the reference
//! features of its video. Every tensor created while decoding is owned by the
//! call and released when it returns, so the live tensor count of the
//! registry is the same before and after, on success and on failure.

use crate::frame::DecodedFrame;
use crate::reference::ReferenceData;
use crate::token::FrameToken;
use nvc_core::{
    feature_input_name, validate_inputs, GraphModel, ModelInputs, NvcError, Result, Tensor,
    TensorRegistry, TOKEN_INPUT, TOKEN_INPUT_ALT,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of tokens per batch chunk
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Result of a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Frames decoded
    pub decoded: usize,
    /// Tokens that failed to decode
    pub failed: usize,
}

/// Decodes frame tokens with a graph model
///
/// Decodes are serialized; concurrent callers wait for each other.
#[derive(Debug)]
pub struct FrameDecoder {
    registry: TensorRegistry,
    decode_lock: Mutex<()>,
}

impl FrameDecoder {
    /// Decoder allocating in `registry`
    pub fn new(registry: TensorRegistry) -> Self {
        Self {
            registry,
            decode_lock: Mutex::new(()),
        }
    }

    /// Registry intermediates are accounted in
    pub fn registry(&self) -> &TensorRegistry {
        &self.registry
    }

    /// Decode one token, running the model once per feature part
    ///
    /// Parts of a feature are concatenated along dim 0 and the per-feature
    /// outputs summed before conversion to an image.
    pub fn process_frame(
        &self,
        model: &dyn GraphModel,
        reference: &ReferenceData,
        token: &FrameToken,
    ) -> Result<DecodedFrame> {
        self.scoped(token.frame_index, || {
            reference.validate()?;
            let input = self.registry.from_token(&token.values)?;

            let mut total: Option<Tensor> = None;
            for (index, feature) in reference.features.iter().enumerate() {
                let name = feature_input_name(index);
                let mut outputs = Vec::with_capacity(feature.parts.len());
                for part in &feature.parts {
                    let mut inputs = ModelInputs::new();
                    inputs.insert(TOKEN_INPUT, &input);
                    inputs.insert(TOKEN_INPUT_ALT, &input);
                    inputs.insert(name.clone(), part);
                    outputs.push(model.execute(&inputs, &self.registry)?);
                }

                let combined = match outputs.len() {
                    1 => outputs.pop().ok_or_else(|| empty_output(index))?,
                    _ => Tensor::concat_dim0(&outputs)?,
                };
                drop(outputs);

                total = Some(match total {
                    Some(sum) => sum.add(&combined)?,
                    None => combined,
                });
            }

            let output = total.ok_or_else(|| empty_output(0))?;
            decode_output(&output)
        })
    }

    /// Decode tokens with all four features bound in one execute call each
    ///
    /// References with split features fall back to [`Self::process_frame`].
    /// Each chunk of `chunk_size` tokens is decoded on the blocking pool and
    /// the runtime is yielded to between chunks. `on_frame` receives every
    /// outcome in token order.
    pub async fn process_batch<F>(
        self: &Arc<Self>,
        model: Arc<dyn GraphModel>,
        reference: Arc<ReferenceData>,
        tokens: Vec<FrameToken>,
        chunk_size: usize,
        mut on_frame: F,
    ) -> BatchSummary
    where
        F: FnMut(u64, Result<DecodedFrame>) + Send,
    {
        let mut summary = BatchSummary::default();
        if !reference.is_unsplit() {
            tracing::debug!(
                video_id = reference.video_id,
                "Reference features are split, decoding per feature"
            );
        }

        let mut remaining = tokens.into_iter();
        loop {
            let chunk: Vec<FrameToken> = remaining.by_ref().take(chunk_size.max(1)).collect();
            if chunk.is_empty() {
                break;
            }
            let indices: Vec<u64> = chunk.iter().map(|token| token.frame_index).collect();

            let decoder = Arc::clone(self);
            let model = Arc::clone(&model);
            let reference = Arc::clone(&reference);
            let outcomes = tokio::task::spawn_blocking(move || {
                decoder.decode_chunk(model.as_ref(), &reference, &chunk)
            })
            .await
            .unwrap_or_else(|e| {
                let reason = format!("batch decode task failed: {}", e);
                indices
                    .iter()
                    .map(|index| {
                        (
                            *index,
                            Err(NvcError::InferenceFailed {
                                reason: reason.clone(),
                            }),
                        )
                    })
                    .collect()
            });

            for (index, outcome) in outcomes {
                match &outcome {
                    Ok(_) => summary.decoded += 1,
                    Err(e) => {
                        summary.failed += 1;
                        tracing::warn!(
                            frame = index,
                            error = %e,
                            "Failed to decode frame in batch"
                        );
                    }
                }
                on_frame(index, outcome);
            }
            tokio::task::yield_now().await;
        }

        tracing::debug!(
            decoded = summary.decoded,
            failed = summary.failed,
            "Batch complete"
        );
        summary
    }

    /// Decode a chunk of tokens on the calling thread
    ///
    /// Uses the bound path when the reference is unsplit.
    pub fn decode_chunk(
        &self,
        model: &dyn GraphModel,
        reference: &ReferenceData,
        tokens: &[FrameToken],
    ) -> Vec<(u64, Result<DecodedFrame>)> {
        let bound = reference.is_unsplit();
        tokens
            .iter()
            .map(|token| {
                let outcome = if bound {
                    self.decode_bound(model, reference, token)
                } else {
                    self.process_frame(model, reference, token)
                };
                (token.frame_index, outcome)
            })
            .collect()
    }

    fn decode_bound(
        &self,
        model: &dyn GraphModel,
        reference: &ReferenceData,
        token: &FrameToken,
    ) -> Result<DecodedFrame> {
        self.scoped(token.frame_index, || {
            reference.validate()?;
            let input = self.registry.from_token(&token.values)?;

            let mut inputs = ModelInputs::new();
            inputs.insert(TOKEN_INPUT, &input);
            inputs.insert(TOKEN_INPUT_ALT, &input);
            for (index, feature) in reference.features.iter().enumerate() {
                if let Some(part) = feature.parts.first() {
                    inputs.insert(feature_input_name(index), part);
                }
            }
            validate_inputs(model, &inputs)?;

            let output = model.execute(&inputs, &self.registry)?;
            decode_output(&output)
        })
    }

    fn scoped<T>(&self, frame_index: u64, decode: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.decode_lock.lock();
        let baseline = self.registry.memory().num_tensors;
        let started = Instant::now();

        let result = decode();

        let live = self.registry.memory().num_tensors;
        if live > baseline {
            tracing::warn!(
                frame = frame_index,
                baseline = baseline,
                live = live,
                "Tensors outlived frame decode"
            );
        }
        let elapsed: Duration = started.elapsed();
        tracing::trace!(
            frame = frame_index,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            ok = result.is_ok(),
            "Frame decode finished"
        );
        result
    }
}

/// Turn a raw model output into an RGB frame
///
/// Channel-first outputs (`shape[1] == 3`) are permuted to channel-last, the
/// batch dimension is squeezed and values are clipped to `[0, 1]`.
pub fn decode_output(output: &Tensor) -> Result<DecodedFrame> {
    if output.is_empty() {
        return Err(NvcError::InferenceFailed {
            reason: "model returned an empty tensor".to_string(),
        });
    }
    if output.data().iter().any(|v| !v.is_finite()) {
        return Err(NvcError::InferenceFailed {
            reason: "model output contains non-finite values".to_string(),
        });
    }

    let channel_last = if output.rank() == 4 && output.shape()[1] == 3 {
        Some(output.transpose_nchw_to_nhwc()?)
    } else {
        None
    };
    let squeezed = channel_last.as_ref().unwrap_or(output).squeeze0()?;
    let clipped = squeezed.clip(0.0, 1.0);
    Ok(DecodedFrame::from_hwc(&clipped)?)
}

fn empty_output(feature: usize) -> NvcError {
    NvcError::InferenceFailed {
        reason: format!("no output for reference feature {}", feature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_output_channel_first() {
        let registry = TensorRegistry::new();
        // [1, 3, 1, 2]: red channel 1.0, green 0.0, blue 2.0 (clipped)
        let output = registry
            .tensor(vec![1, 3, 1, 2], vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0])
            .unwrap();
        let frame = decode_output(&output).unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 1));
        assert_eq!(frame.pixel(1, 0), Some([255, 0, 255]));
        assert_eq!(registry.memory().num_tensors, 1);
    }

    #[test]
    fn test_decode_output_channel_last() {
        let registry = TensorRegistry::new();
        let output = registry
            .tensor(vec![1, 1, 1, 3], vec![-1.0, 0.5, 1.0])
            .unwrap();
        let frame = decode_output(&output).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([0, 128, 255]));
    }

    #[test]
    fn test_decode_output_rejects_nan() {
        let registry = TensorRegistry::new();
        let output = registry
            .tensor(vec![1, 1, 1, 3], vec![f32::NAN, 0.5, 1.0])
            .unwrap();
        assert!(matches!(
            decode_output(&output),
            Err(NvcError::InferenceFailed { .. })
        ));
        assert!(decode_output(&registry.zeros(vec![2, 1, 1, 3])).is_err());
    }
}
