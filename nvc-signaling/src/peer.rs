//! Peer connection abstraction
//!
//! The peer connection that carries the frame data channel sits behind the
//! [`PeerTransport`] trait. [`RelayPeerTransport`] is the built-in
//! implementation: it performs the offer/answer exchange but relays the data
//! channel through the signaling socket, which every server speaking the
//! protocol supports.

use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use nvc_core::{NvcError, Result};
use parking_lot::Mutex;
use std::fmt::Debug;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Label of the frame data channel
pub const DATA_CHANNEL_LABEL: &str = "frames";

/// Data channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Negotiation in progress
    Connecting,
    /// Ready to carry frames
    Open,
    /// Closing down
    Closing,
    /// Closed
    Closed,
}

/// Data channel delivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOptions {
    /// Channel label
    pub label: String,
    /// In-order delivery
    pub ordered: bool,
    /// Retransmission budget per message
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            label: DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: Some(1),
        }
    }
}

/// The opaque peer connection of a session
#[async_trait]
pub trait PeerTransport: Send + Sync + Debug {
    /// Create the local offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply the remote answer to our offer
    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Apply a remote offer and produce the local answer
    async fn set_remote_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Whether a remote description has been applied
    fn has_remote_description(&self) -> bool;

    /// Apply a remote ICE candidate; requires a remote description
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Local candidates to trickle to the server after the offer
    async fn local_candidates(&self) -> Vec<IceCandidate>;

    /// Restart ICE after a server requested restart
    async fn restart_ice(&self) -> Result<()>;

    /// Watch the data channel state
    fn data_channel(&self) -> watch::Receiver<DataChannelState>;

    /// Close the connection and its data channel
    async fn close(&self);
}

#[derive(Debug, Default)]
struct RelayState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
}

/// Peer transport relaying the data channel over the signaling socket
#[derive(Debug)]
pub struct RelayPeerTransport {
    session_id: String,
    options: DataChannelOptions,
    state: Mutex<RelayState>,
    channel: watch::Sender<DataChannelState>,
}

impl RelayPeerTransport {
    /// Create a transport with default data channel options
    pub fn new() -> Self {
        Self::with_options(DataChannelOptions::default())
    }

    /// Create a transport with explicit data channel options
    pub fn with_options(options: DataChannelOptions) -> Self {
        let (channel, _) = watch::channel(DataChannelState::Connecting);
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            options,
            state: Mutex::new(RelayState::default()),
            channel,
        }
    }

    /// Data channel options
    pub fn options(&self) -> &DataChannelOptions {
        &self.options
    }

    /// Remote candidates applied so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    fn session_sdp(&self, kind: SdpType) -> String {
        let direction = match kind {
            SdpType::Offer => "recvonly",
            _ => "sendonly",
        };
        format!(
            "v=0\r\n\
             o=- {id} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             a=group:BUNDLE 0 1\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=mid:0\r\n\
             a=sctp-port:5000\r\n\
             a=label:{label}\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=mid:1\r\n\
             a={direction}\r\n\
             a=rtpmap:111 opus/48000/2\r\n",
            id = self.session_id,
            label = self.options.label,
            direction = direction,
        )
    }

    fn open_channel(&self) {
        self.channel.send_replace(DataChannelState::Open);
        info!(
            label = %self.options.label,
            ordered = self.options.ordered,
            "Data channel open"
        );
    }
}

impl Default for RelayPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for RelayPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(self.session_sdp(SdpType::Offer));
        self.state.lock().local = Some(offer.clone());
        debug!("Created local offer");
        Ok(offer)
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpType::Answer {
            return Err(NvcError::InvalidState {
                expected: "answer".to_string(),
                actual: format!("{:?}", answer.kind).to_lowercase(),
            });
        }
        {
            let mut state = self.state.lock();
            if state.local.is_none() {
                return Err(NvcError::InvalidState {
                    expected: "local offer".to_string(),
                    actual: "no local description".to_string(),
                });
            }
            state.remote = Some(answer);
        }
        debug!("Remote answer applied");
        self.open_channel();
        Ok(())
    }

    async fn set_remote_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpType::Offer {
            return Err(NvcError::InvalidState {
                expected: "offer".to_string(),
                actual: format!("{:?}", offer.kind).to_lowercase(),
            });
        }
        let answer = SessionDescription::answer(self.session_sdp(SdpType::Answer));
        {
            let mut state = self.state.lock();
            state.remote = Some(offer);
            state.local = Some(answer.clone());
        }
        debug!("Remote offer applied, answer created");
        self.open_channel();
        Ok(answer)
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(NvcError::InvalidState {
                expected: "remote description".to_string(),
                actual: "none".to_string(),
            });
        }
        debug!("Adding ICE candidate: {}", candidate.candidate);
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn local_candidates(&self) -> Vec<IceCandidate> {
        vec![IceCandidate {
            candidate: format!(
                "candidate:{} 1 tcp 1518280447 127.0.0.1 9 typ host tcptype active",
                &self.session_id[..8]
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }]
    }

    async fn restart_ice(&self) -> Result<()> {
        let had_remote = {
            let mut state = self.state.lock();
            state.remote_candidates.clear();
            state.remote.is_some()
        };
        info!("Restarting ICE");
        if had_remote {
            self.open_channel();
        }
        Ok(())
    }

    fn data_channel(&self) -> watch::Receiver<DataChannelState> {
        self.channel.subscribe()
    }

    async fn close(&self) {
        let previous = self.channel.send_replace(DataChannelState::Closed);
        if previous != DataChannelState::Closed {
            debug!("Peer transport closed");
        }
    }
}
