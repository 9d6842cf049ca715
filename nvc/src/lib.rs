//! # NVC - Neural Video Codec Streaming Client
//!
//! NVC plays video that a server has compressed into per-frame latent tokens.
//! Tokens arrive over a peer data channel or through an HTTP API and are
//! decoded locally by a graph model against per-video reference features.
//!
//! ## Key Features
//!
//! - **Peer sessions**: WebSocket signaling with offer/answer, ICE and
//!   automatic reconnects with exponential backoff
//! - **Local decoding**: reference features bound once per video, chunked
//!   batch decoding and memory-checked tensors
//! - **Paced playback**: bounded frame buffer, background prefetch and
//!   clock-synchronised presentation
//! - **Observability**: typed events, rolling metrics and connection diagnostics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nvc::{CodecConfig, NeuralCodecClient, SyntheticModel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CodecConfig::builder()
//!         .server_url("ws://127.0.0.1:8000/ws")
//!         .api_base_url("http://127.0.0.1:8000")
//!         .fps(30)
//!         .build()?;
//!
//!     let client = NeuralCodecClient::builder()
//!         .config(config.clone())
//!         .model(Arc::new(SyntheticModel::new(256, 256)))
//!         .build()?;
//!
//!     let mut events = client.subscribe();
//!     client.connect(&config.server_url).await?;
//!     client.start_playback(1).await?;
//!
//!     while let Some(event) = events.next().await {
//!         println!("Codec event: {}", event.event_type());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use nvc_core::{
    GraphModel, MemoryInfo, MemoryLimits, MemoryWarning, ModelHandle, ModelInputs, ModelLoader,
    NvcError, Result, StaticModelLoader, Tensor, TensorRegistry, WarningSeverity,
};

pub use nvc_media::{
    BatchSummary, DecodedFrame, FrameBuffer, FrameDecoder, FrameToken, InsertOutcome,
    ReferenceData, ReferencePayload, SyntheticModel, TokenCache,
};

pub use nvc_signaling::{
    IceServer, PeerSession, PeerTransport, PlaybackAction, RelayPeerTransport, RetryPolicy,
    SessionConfig, SignalingMessage, SignalingServer,
};

pub use nvc_diagnostics::{ConnectionAnalyzer, ConnectionInfo, ConnectionState, DebugLogger};

// Public API modules
pub mod api;
pub mod client;
pub mod config;
pub mod event;
pub mod metrics;
pub mod playback;
pub mod prefetch;

// Re-export main API types
pub use api::{TokenBatch, TokenBatchMetadata, VideoApi, VideoInfo, VideoMetadata};
pub use client::{NeuralCodecClient, NeuralCodecClientBuilder, TransportFactory};
pub use config::{CodecConfig, CodecConfigBuilder, PrefetchConfig, SyncConfig};
pub use event::{BufferKind, CodecEvent, EventBus, EventFilter, EventStream, FilteredEventStream};
pub use metrics::{CodecMetrics, MetricsTracker};
pub use playback::{
    MediaClock, PlaybackController, PlaybackState, SyncAction, VideoState, WallClock,
};
pub use prefetch::{Prefetcher, TokenSink};
