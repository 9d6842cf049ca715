//! # NVC Diagnostics
//!
//! Debugging and diagnostic tools for the neural video codec client.
//! Provides logging setup, connection state analysis and tensor memory
//! profiling.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection_analyzer;
pub mod debug_logger;
pub mod memory_profiler;

// Re-export main types
pub use connection_analyzer::{ConnectionAnalyzer, ConnectionInfo, ConnectionState, StateTransition};
pub use debug_logger::DebugLogger;
pub use memory_profiler::{MemoryProfiler, MemoryScope};
