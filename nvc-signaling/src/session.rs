//! Peer session negotiation
//!
//! A session is one signaling socket plus one peer transport. Establishing it
//! runs `init` → `init_response` → `offer` → `answer`, trickling ICE
//! candidates in both directions. Remote candidates that arrive before the
//! remote description are queued and applied once it is set. After the data
//! channel opens, a pump task keeps handling signaling traffic (renegotiation
//! on `restart`, late candidates) and forwards frame traffic as
//! [`SessionEvent`]s.

use crate::client::{SignalingClient, SignalingEvent};
use crate::peer::{DataChannelState, PeerTransport};
use crate::protocol::{
    CloseInfo, ErrorPayload, FrameTokenMessage, IceCandidate, IceServer, InitPayload,
    PlaybackControl, RtcConfiguration, ServerConfig, SignalingMessage, CLOSE_NORMAL,
};
use nvc_core::{NvcError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session negotiation settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Frame rate announced in `init`
    pub fps: u32,
    /// ICE servers announced in `init`
    pub ice_servers: Vec<IceServer>,
    /// Deadline for the whole handshake
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Traffic surfaced by an established session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Frame token from the data channel
    FrameToken(FrameTokenMessage),
    /// Playback control from the data channel
    PlaybackControl(PlaybackControl),
    /// Server requested a restart; renegotiation has begun
    Restarting,
    /// Renegotiation after a restart completed
    Renegotiated,
    /// Server reported an error
    ServerError(ErrorPayload),
    /// Handling a signaling message failed
    NegotiationFailed(String),
    /// Signaling socket closed; the session is over
    Closed(CloseInfo),
}

struct Negotiator {
    signaling: SignalingClient,
    peer: Arc<dyn PeerTransport>,
    config: SessionConfig,
    pending_candidates: Vec<IceCandidate>,
    server_config: Option<ServerConfig>,
    server_session_id: Option<String>,
    renegotiating: bool,
}

impl Negotiator {
    fn new(signaling: SignalingClient, peer: Arc<dyn PeerTransport>, config: SessionConfig) -> Self {
        Self {
            signaling,
            peer,
            config,
            pending_candidates: Vec::new(),
            server_config: None,
            server_session_id: None,
            renegotiating: false,
        }
    }

    fn send_init(&self) -> Result<()> {
        self.signaling.send(&SignalingMessage::Init(InitPayload {
            fps: self.config.fps,
            rtc_config: RtcConfiguration {
                ice_servers: self.config.ice_servers.clone(),
            },
        }))
    }

    async fn handle(&mut self, message: SignalingMessage) -> Result<Option<SessionEvent>> {
        match message {
            SignalingMessage::InitResponse(response) => {
                debug!(session = ?response.session_id, "Received init_response");
                self.server_session_id = response.session_id;
                self.server_config = response.config;

                let offer = self.peer.create_offer().await?;
                self.signaling.send(&SignalingMessage::Offer(offer))?;
                for candidate in self.peer.local_candidates().await {
                    self.signaling
                        .send(&SignalingMessage::IceCandidate(candidate))?;
                }
                Ok(None)
            }
            SignalingMessage::Offer(offer) => {
                debug!("Received server offer");
                let answer = self.peer.set_remote_offer(offer).await?;
                self.signaling.send(&SignalingMessage::Answer(answer))?;
                self.flush_candidates().await;
                Ok(self.finish_renegotiation())
            }
            SignalingMessage::Answer(answer) => {
                debug!("Received answer");
                self.peer.set_remote_answer(answer).await?;
                self.flush_candidates().await;
                Ok(self.finish_renegotiation())
            }
            SignalingMessage::IceCandidate(candidate) => {
                if self.peer.has_remote_description() {
                    if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                        warn!("Failed to add ICE candidate: {}", e);
                    }
                } else {
                    debug!(
                        queued = self.pending_candidates.len() + 1,
                        "Queueing ICE candidate until remote description is set"
                    );
                    self.pending_candidates.push(candidate);
                }
                Ok(None)
            }
            SignalingMessage::Error(payload) => {
                warn!(code = ?payload.code, "Server error: {}", payload.message);
                Ok(Some(SessionEvent::ServerError(payload)))
            }
            SignalingMessage::Restart => {
                info!("Server requested session restart");
                self.renegotiating = true;
                self.pending_candidates.clear();
                self.peer.restart_ice().await?;
                self.send_init()?;
                Ok(Some(SessionEvent::Restarting))
            }
            SignalingMessage::FrameToken(token) => Ok(Some(SessionEvent::FrameToken(token))),
            SignalingMessage::PlaybackControl(control) => {
                Ok(Some(SessionEvent::PlaybackControl(control)))
            }
            SignalingMessage::Init(_) | SignalingMessage::ProcessFrames(_) => {
                warn!("Ignoring client-bound {} message", message.message_type());
                Ok(None)
            }
            SignalingMessage::Unknown { .. } => Ok(None),
        }
    }

    async fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            count = self.pending_candidates.len(),
            "Applying queued ICE candidates"
        );
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate: {}", e);
            }
        }
    }

    fn finish_renegotiation(&mut self) -> Option<SessionEvent> {
        if self.renegotiating {
            self.renegotiating = false;
            info!("Session renegotiated");
            Some(SessionEvent::Renegotiated)
        } else {
            None
        }
    }
}

/// An established peer session
#[derive(Debug)]
pub struct PeerSession {
    id: String,
    signaling: SignalingClient,
    peer: Arc<dyn PeerTransport>,
    channel: watch::Receiver<DataChannelState>,
    server_config: Option<ServerConfig>,
    server_session_id: Option<String>,
}

impl PeerSession {
    /// Connect to `url` and negotiate a session over `peer`
    ///
    /// Resolves once the data channel is open. The whole handshake is bounded
    /// by `config.connect_timeout`.
    pub async fn establish(
        url: &str,
        config: SessionConfig,
        peer: Arc<dyn PeerTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let deadline = config.connect_timeout;
        match timeout(deadline, Self::handshake(url, config, peer.clone())).await {
            Ok(Ok(established)) => Ok(established),
            Ok(Err(e)) => {
                peer.close().await;
                Err(e)
            }
            Err(_) => {
                peer.close().await;
                Err(NvcError::Timeout {
                    operation: format!("session handshake with {}", url),
                    duration: deadline,
                })
            }
        }
    }

    async fn handshake(
        url: &str,
        config: SessionConfig,
        peer: Arc<dyn PeerTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let (signaling, mut inbound) = SignalingClient::connect(url, config.connect_timeout).await?;
        let mut channel = peer.data_channel();
        let mut negotiator = Negotiator::new(signaling.clone(), peer.clone(), config);
        let mut early_events = Vec::new();

        negotiator.send_init()?;

        while *channel.borrow() != DataChannelState::Open {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(SignalingEvent::Message(message)) => match negotiator.handle(message).await {
                        Ok(Some(SessionEvent::ServerError(payload))) => {
                            signaling.close(CLOSE_NORMAL, "Handshake failed");
                            return Err(NvcError::Signaling {
                                message: payload.message,
                                code: payload.code,
                            });
                        }
                        Ok(Some(event)) => early_events.push(event),
                        Ok(None) => {}
                        Err(e) => {
                            signaling.close(CLOSE_NORMAL, "Handshake failed");
                            return Err(e);
                        }
                    },
                    Some(SignalingEvent::Closed(close)) => {
                        return Err(NvcError::Connection {
                            url: url.to_string(),
                            reason: format!(
                                "closed during handshake (code {}): {}",
                                close.code, close.reason
                            ),
                            retry_in: None,
                        });
                    }
                    None => {
                        return Err(NvcError::Connection {
                            url: url.to_string(),
                            reason: "signaling reader stopped during handshake".to_string(),
                            retry_in: None,
                        });
                    }
                },
                changed = channel.changed() => {
                    if changed.is_err() {
                        return Err(NvcError::Transport {
                            reason: "peer transport dropped during handshake".to_string(),
                        });
                    }
                }
            }
        }

        let session = Self {
            id: Uuid::new_v4().to_string(),
            signaling,
            peer,
            channel,
            server_config: negotiator.server_config.clone(),
            server_session_id: negotiator.server_session_id.clone(),
        };
        info!(session = %session.id, "Peer session established with {}", url);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        for event in early_events {
            let _ = events_tx.send(event);
        }
        tokio::spawn(pump(negotiator, inbound, events_tx));

        Ok((session, events_rx))
    }

    /// Local session identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session identifier assigned by the server
    pub fn server_session_id(&self) -> Option<&str> {
        self.server_session_id.as_deref()
    }

    /// Server URL
    pub fn url(&self) -> &str {
        self.signaling.url()
    }

    /// Limits announced by the server in `init_response`
    pub fn server_config(&self) -> Option<&ServerConfig> {
        self.server_config.as_ref()
    }

    /// Data channel state
    pub fn data_channel_state(&self) -> DataChannelState {
        *self.channel.borrow()
    }

    /// Whether signaling and the data channel are both up
    pub fn is_connected(&self) -> bool {
        self.signaling.is_open() && self.data_channel_state() == DataChannelState::Open
    }

    /// Send a signaling message
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        self.signaling.send(message)
    }

    /// Send a data channel message
    pub fn send_data(&self, message: &SignalingMessage) -> Result<()> {
        if !message.is_data_channel_message() {
            return Err(NvcError::InvalidState {
                expected: "data channel message".to_string(),
                actual: message.message_type().to_string(),
            });
        }
        match self.data_channel_state() {
            DataChannelState::Open => self.signaling.send(message),
            state => Err(NvcError::Transport {
                reason: format!("data channel is {:?}", state),
            }),
        }
    }

    /// Close the peer transport and the signaling socket
    pub async fn close(&self, code: u16, reason: &str) {
        debug!(session = %self.id, "Closing peer session: {}", reason);
        self.peer.close().await;
        self.signaling.close(code, reason);
    }
}

async fn pump(
    mut negotiator: Negotiator,
    mut inbound: mpsc::UnboundedReceiver<SignalingEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            SignalingEvent::Message(message) => {
                let kind = message.message_type().to_string();
                let outcome = match negotiator.handle(message).await {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Failed to handle {} message: {}", kind, e);
                        Some(SessionEvent::NegotiationFailed(e.to_string()))
                    }
                };
                if let Some(event) = outcome {
                    if events.send(event).is_err() {
                        debug!("Session dropped, stopping signaling pump");
                        return;
                    }
                }
            }
            SignalingEvent::Closed(close) => {
                negotiator.peer.close().await;
                let _ = events.send(SessionEvent::Closed(close));
                return;
            }
        }
    }

    negotiator.peer.close().await;
    let _ = events.send(SessionEvent::Closed(CloseInfo::abnormal(
        "signaling reader stopped",
    )));
}
