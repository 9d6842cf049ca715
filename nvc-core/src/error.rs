//! Error types for the neural video codec client

use std::time::Duration;
use thiserror::Error;

/// Main error type for codec client operations
#[derive(Error, Debug)]
pub enum NvcError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Connection error
    #[error("Connection to {url} failed: {reason}")]
    Connection {
        /// URL the connection was made to
        url: String,
        /// Reason for connection failure
        reason: String,
        /// Suggested retry delay
        retry_in: Option<Duration>,
    },

    /// Transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Operation timed out error
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Protocol error
    #[error("Protocol error: {message}")]
    ProtocolError {
        /// Error message
        message: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error reported by the signaling server
    #[error("Signaling error{}: {message}", code_suffix(.code))]
    Signaling {
        /// Server supplied message
        message: String,
        /// Optional numeric code
        code: Option<u16>,
    },

    /// Retries exhausted
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Model has not been loaded yet
    #[error("Model not loaded")]
    ModelNotLoaded,

    /// Model loading failed
    #[error("Failed to load model from {path}: {reason}")]
    ModelLoadFailed {
        /// Model location
        path: String,
        /// Reason for failure
        reason: String,
    },

    /// Inputs bound for execution do not match the model signature
    #[error("Model input mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    ModelInputMismatch {
        /// Inputs the model expects but were not bound
        missing: Vec<String>,
        /// Inputs bound but unknown to the model
        unexpected: Vec<String>,
    },

    /// Model execution failed
    #[error("Inference failed: {reason}")]
    InferenceFailed {
        /// Reason for failure
        reason: String,
    },

    /// Tensor shape mismatch
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Operation that detected the mismatch
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Tensor used after release
    #[error("Tensor already released: {context}")]
    TensorDisposed {
        /// Where the released tensor was encountered
        context: String,
    },

    /// Reference data for the video has not been loaded
    #[error("Reference data missing for video {video_id}")]
    ReferenceDataMissing {
        /// Video identifier
        video_id: u64,
    },

    /// No video is selected
    #[error("No video selected")]
    NoVideoSelected,

    /// Invalid data error
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Reason for invalid data
        reason: String,
    },

    /// Resource limit exceeded
    #[error("Resource limit exceeded: {resource}")]
    ResourceLimit {
        /// Resource that exceeded limit
        resource: String,
    },

    /// HTTP request failed
    #[error("HTTP request to {url} failed{}: {reason}", status_suffix(.status))]
    Http {
        /// Requested URL
        url: String,
        /// Response status if one was received
        status: Option<u16>,
        /// Reason for failure
        reason: String,
    },

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: String,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NvcError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            NvcError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            NvcError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            NvcError::Connection { .. } => "CONNECTION_FAILED".to_string(),
            NvcError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            NvcError::Timeout { .. } => "TIMEOUT".to_string(),
            NvcError::ProtocolError { .. } => "PROTOCOL_ERROR".to_string(),
            NvcError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            NvcError::Signaling { .. } => "SIGNALING_ERROR".to_string(),
            NvcError::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED".to_string(),
            NvcError::InvalidState { .. } => "INVALID_STATE".to_string(),
            NvcError::ModelNotLoaded => "MODEL_NOT_LOADED".to_string(),
            NvcError::ModelLoadFailed { .. } => "MODEL_LOAD_FAILED".to_string(),
            NvcError::ModelInputMismatch { .. } => "MODEL_INPUT_MISMATCH".to_string(),
            NvcError::InferenceFailed { .. } => "INFERENCE_FAILED".to_string(),
            NvcError::ShapeMismatch { .. } => "SHAPE_MISMATCH".to_string(),
            NvcError::TensorDisposed { .. } => "TENSOR_DISPOSED".to_string(),
            NvcError::ReferenceDataMissing { .. } => "REFERENCE_DATA_MISSING".to_string(),
            NvcError::NoVideoSelected => "NO_VIDEO_SELECTED".to_string(),
            NvcError::InvalidData { .. } => "INVALID_DATA".to_string(),
            NvcError::ResourceLimit { .. } => "RESOURCE_LIMIT_EXCEEDED".to_string(),
            NvcError::Http { .. } => "HTTP_ERROR".to_string(),
            NvcError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
            NvcError::Io(_) => "IO_ERROR".to_string(),
        }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Network level failures are recoverable. Protocol, state and model
    /// failures are not and are surfaced immediately.
    pub fn is_recoverable(&self) -> bool {
        match self {
            NvcError::Connection { .. }
            | NvcError::Transport { .. }
            | NvcError::Timeout { .. }
            | NvcError::Io(_) => true,
            NvcError::Signaling { code, .. } => matches!(code, Some(1001) | Some(1006)),
            NvcError::Http { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 429,
            },
            _ => false,
        }
    }

    /// Suggested retry delay, if the error carries one
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            NvcError::Connection { retry_in, .. } => *retry_in,
            _ => None,
        }
    }

    /// Build an [`NvcError::InvalidMessage`] from a raw message and parse error
    pub fn invalid_message(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        NvcError::InvalidMessage {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

fn code_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, NvcError>;
