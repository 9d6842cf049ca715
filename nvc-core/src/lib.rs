//! # NVC Core
//!
//! Foundational types for the neural video codec client: the workspace error
//! type, accounted tensors, the graph model contract and memory limits.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod duration_ms;
pub mod error;
pub mod model;
pub mod resource;
pub mod tensor;

// Re-export main types
pub use error::{NvcError, Result};
pub use model::{
    decoder_input_names, feature_input_name, validate_inputs, GraphModel, ModelHandle,
    ModelInputs, ModelLoader, ProgressFn, StaticModelLoader, FEATURE_INPUT_COUNT, TOKEN_INPUT,
    TOKEN_INPUT_ALT,
};
pub use resource::{MemoryLimits, MemoryWarning, TensorSizeReport, WarningSeverity};
pub use tensor::{split_dim0, MemoryInfo, Tensor, TensorRegistry, ELEMENT_BYTES};
