//! Deterministic stand-in decoder model
//!
//! Produces a flat-coloured `[rows, 3, height, width]` image from the mean of
//! the token and of each bound reference feature. Per-feature and
//! all-features-bound calls agree, which makes it usable for the demo server
//! and for exercising both decode paths.

use nvc_core::{
    decoder_input_names, feature_input_name, GraphModel, ModelInputs, NvcError, Result, Tensor,
    TensorRegistry, FEATURE_INPUT_COUNT, TOKEN_INPUT,
};

/// Synthetic graph model
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    height: usize,
    width: usize,
}

impl SyntheticModel {
    /// Model producing `height` x `width` frames
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height: height.max(1),
            width: width.max(1),
        }
    }
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self::new(16, 16)
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

impl GraphModel for SyntheticModel {
    fn input_names(&self) -> Vec<String> {
        decoder_input_names()
    }

    /// Tokens with a negative mean fail, to simulate inference errors
    fn execute(&self, inputs: &ModelInputs<'_>, registry: &TensorRegistry) -> Result<Tensor> {
        let token = inputs.get(TOKEN_INPUT).ok_or_else(|| NvcError::InferenceFailed {
            reason: format!("missing input {}", TOKEN_INPUT),
        })?;
        let token_mean = mean(token.data());
        if token_mean < 0.0 {
            return Err(NvcError::InferenceFailed {
                reason: "negative token".to_string(),
            });
        }

        let features: Vec<&Tensor> = (0..FEATURE_INPUT_COUNT)
            .filter_map(|i| inputs.get(&feature_input_name(i)))
            .collect();
        let first = features.first().ok_or_else(|| NvcError::InferenceFailed {
            reason: "no reference feature bound".to_string(),
        })?;
        let rows = first.shape().first().copied().unwrap_or(1);

        let share = 1.0 / FEATURE_INPUT_COUNT as f32;
        let base: f32 = features
            .iter()
            .map(|f| (token_mean + mean(f.data())) * share)
            .sum();

        let plane = self.height * self.width;
        let mut data = Vec::with_capacity(rows * 3 * plane);
        for _ in 0..rows {
            for channel in 0..3 {
                let value = base * (channel + 1) as f32 / 3.0;
                data.extend(std::iter::repeat(value).take(plane));
            }
        }
        registry.tensor(vec![rows, 3, self.height, self.width], data)
    }
}
