//! # NVC Signaling
//!
//! Session signaling for the neural video codec client: the JSON message
//! protocol, a WebSocket signaling client, peer session negotiation with ICE
//! candidate queueing, reconnect backoff and a reference server.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod peer;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod session;

// Re-export main types
pub use client::{SignalingClient, SignalingEvent};
pub use peer::{
    DataChannelOptions, DataChannelState, PeerTransport, RelayPeerTransport, DATA_CHANNEL_LABEL,
};
pub use protocol::{
    CloseInfo, ErrorPayload, FrameTokenMessage, IceCandidate, IceServer, InitPayload,
    InitResponsePayload, PlaybackAction, PlaybackControl, ProcessFramesPayload, RtcConfiguration,
    SdpType, ServerConfig, SessionDescription, SignalingMessage, CLOSE_ABNORMAL, CLOSE_GOING_AWAY,
    CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use server::{ServerSettings, SignalingServer};
pub use session::{PeerSession, SessionConfig, SessionEvent, DEFAULT_CONNECT_TIMEOUT};
