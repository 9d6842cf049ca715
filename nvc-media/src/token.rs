//! Frame tokens
//!
//! Servers send tokens as JSON arrays that may be wrapped in one or two extra
//! levels (`[[...]]`, `[[[...]]]`). They are flattened before use; a valid
//! token has exactly [`TOKEN_LEN`] values.

use crate::error::MediaError;
use serde_json::Value;

/// Number of values in a frame token
pub const TOKEN_LEN: usize = 32;

/// A validated token for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameToken {
    /// Frame index
    pub frame_index: u64,
    /// Token values
    pub values: Vec<f32>,
}

impl FrameToken {
    /// Validate a flat token
    pub fn new(frame_index: u64, values: Vec<f32>) -> Result<Self, MediaError> {
        if values.len() != TOKEN_LEN {
            return Err(MediaError::InvalidTokenLength {
                expected: TOKEN_LEN,
                actual: values.len(),
            });
        }
        Ok(Self {
            frame_index,
            values,
        })
    }

    /// Flatten and validate a token received as JSON
    pub fn from_json(frame_index: u64, value: &Value) -> Result<Self, MediaError> {
        Self::new(frame_index, flatten_values(value)?)
    }
}

/// Flatten arbitrarily nested JSON number arrays into one vector
pub fn flatten_values(value: &Value) -> Result<Vec<f32>, MediaError> {
    let mut out = Vec::new();
    flatten_into(value, &mut out)?;
    Ok(out)
}

fn flatten_into(value: &Value, out: &mut Vec<f32>) -> Result<(), MediaError> {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out)?;
            }
            Ok(())
        }
        Value::Number(number) => {
            let v = number.as_f64().ok_or_else(|| MediaError::InvalidTokenValue {
                reason: format!("{} is not representable", number),
            })?;
            out.push(v as f32);
            Ok(())
        }
        other => Err(MediaError::InvalidTokenValue {
            reason: format!("expected a number or array, got {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ramp() -> Vec<f64> {
        (0..TOKEN_LEN).map(|i| i as f64 / 32.0).collect()
    }

    #[test]
    fn test_flat_token() {
        let token = FrameToken::from_json(4, &json!(ramp())).unwrap();
        assert_eq!(token.frame_index, 4);
        assert_eq!(token.values.len(), TOKEN_LEN);
        assert_eq!(token.values[16], 0.5);
    }

    #[test]
    fn test_nested_tokens_flatten() {
        let once = FrameToken::from_json(0, &json!([ramp()])).unwrap();
        let twice = FrameToken::from_json(0, &json!([[ramp()]])).unwrap();
        assert_eq!(once.values, twice.values);
        assert_eq!(once.values.len(), TOKEN_LEN);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert_eq!(
            FrameToken::from_json(0, &json!([[1.0, 2.0, 3.0]])),
            Err(MediaError::InvalidTokenLength {
                expected: TOKEN_LEN,
                actual: 3
            })
        );
        assert!(FrameToken::new(0, vec![0.0; 33]).is_err());
        assert!(FrameToken::new(0, Vec::new()).is_err());
    }

    #[test]
    fn test_non_numeric_rejected() {
        assert!(matches!(
            flatten_values(&json!([1.0, "x"])),
            Err(MediaError::InvalidTokenValue { .. })
        ));
        assert!(matches!(
            flatten_values(&json!({"a": 1})),
            Err(MediaError::InvalidTokenValue { .. })
        ));
    }
}
