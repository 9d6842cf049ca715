//! Media pipeline errors

use nvc_core::NvcError;
use thiserror::Error;

/// Errors raised while turning tokens into frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Token has the wrong number of values
    #[error("Invalid token length: expected {expected}, got {actual}")]
    InvalidTokenLength {
        /// Required length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Token JSON holds something other than numbers
    #[error("Invalid token value: {reason}")]
    InvalidTokenValue {
        /// What was wrong
        reason: String,
    },

    /// Reference payload has the wrong number of feature maps
    #[error("Invalid reference feature count: expected {expected}, got {actual}")]
    InvalidFeatureCount {
        /// Required count
        expected: usize,
        /// Received count
        actual: usize,
    },

    /// Decoder output does not describe an image
    #[error("Invalid frame data: expected {expected}, got shape {actual:?}")]
    InvalidFrameData {
        /// Expected layout
        expected: String,
        /// Received shape
        actual: Vec<usize>,
    },

    /// Channel count the image conversion cannot handle
    #[error("Unsupported channel count: {channels}")]
    UnsupportedChannels {
        /// Channel count
        channels: usize,
    },

    /// PNG encoding or decoding failed
    #[error("Image encoding failed: {reason}")]
    ImageEncoding {
        /// Reason for failure
        reason: String,
    },
}

impl MediaError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            MediaError::InvalidTokenLength { .. } => "INVALID_TOKEN_LENGTH".to_string(),
            MediaError::InvalidTokenValue { .. } => "INVALID_TOKEN_VALUE".to_string(),
            MediaError::InvalidFeatureCount { .. } => "INVALID_FEATURE_COUNT".to_string(),
            MediaError::InvalidFrameData { .. } => "INVALID_FRAME_DATA".to_string(),
            MediaError::UnsupportedChannels { .. } => "UNSUPPORTED_CHANNELS".to_string(),
            MediaError::ImageEncoding { .. } => "IMAGE_ENCODING_FAILED".to_string(),
        }
    }
}

impl From<MediaError> for NvcError {
    fn from(error: MediaError) -> Self {
        NvcError::InvalidData {
            reason: error.to_string(),
        }
    }
}
