//! # NVC Media
//!
//! Media pipeline for the neural video codec client: frame tokens,
//! per-video reference features, token to frame decoding and the frame buffer.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod reference;
pub mod synthetic;
pub mod token;

// Re-export main types
pub use buffer::{BufferedFrame, FrameBuffer, InsertOutcome, TokenCache, SWEEP_WINDOW};
pub use decoder::{decode_output, BatchSummary, FrameDecoder, DEFAULT_CHUNK_SIZE};
pub use error::MediaError;
pub use frame::DecodedFrame;
pub use reference::{
    default_reference_shapes, ReferenceCache, ReferenceData, ReferenceFeature, ReferencePayload,
    REFERENCE_FEATURE_SHAPES,
};
pub use synthetic::SyntheticModel;
pub use token::{flatten_values, FrameToken, TOKEN_LEN};
