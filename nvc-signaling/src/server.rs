//! Reference signaling server
//!
//! Speaks the session protocol from the server side: answers `init` and
//! offers, collects trickled candidates and streams `frame_token` messages
//! for registered videos after `process_frames`. It backs the integration
//! tests and the demo; production deployments run their own server.

use crate::peer::{PeerTransport, RelayPeerTransport};
use crate::protocol::{
    FrameTokenMessage, InitResponsePayload, PlaybackAction, ProcessFramesPayload, ServerConfig,
    SignalingMessage,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use nvc_core::{NvcError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;
use uuid::Uuid;

/// Server behaviour settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Buffer size announced in `init_response`
    pub buffer_size: Option<usize>,
    /// Frame cap announced in `init_response`
    pub max_frames: Option<u64>,
    /// Delay between streamed frame tokens
    pub frame_interval: Duration,
    /// Trickle a candidate before the answer, as servers with fast ICE
    /// gathering do
    pub candidate_before_answer: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            buffer_size: Some(60),
            max_frames: None,
            frame_interval: Duration::from_millis(33),
            candidate_before_answer: true,
        }
    }
}

#[derive(Debug, Default)]
struct ServerStats {
    connections_accepted: AtomicUsize,
    offers_answered: AtomicUsize,
    candidates_received: AtomicUsize,
    process_requests: AtomicUsize,
}

#[derive(Debug)]
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    stream: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn send(&self, message: &SignalingMessage) {
        match message.to_json() {
            Ok(json) => {
                let _ = self.outbound.send(Message::Text(json));
            }
            Err(e) => tracing::error!("Failed to serialize {}: {}", message.message_type(), e),
        }
    }

    fn stop_stream(&self) {
        if let Some(task) = self.stream.lock().take() {
            task.abort();
        }
    }
}

/// Active connections mapped by connection ID
type Connections = Arc<DashMap<String, Arc<Connection>>>;

/// Reference signaling server
#[derive(Debug, Clone)]
pub struct SignalingServer {
    /// Address the server binds to
    pub bind_addr: SocketAddr,
    settings: ServerSettings,
    videos: Arc<DashMap<u64, Arc<Vec<Vec<f32>>>>>,
    connections: Connections,
    stats: Arc<ServerStats>,
}

impl SignalingServer {
    /// Create new signaling server
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_settings(bind_addr, ServerSettings::default())
    }

    /// Create a server with explicit settings
    pub fn with_settings(bind_addr: SocketAddr, settings: ServerSettings) -> Self {
        Self {
            bind_addr,
            settings,
            videos: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Register the token sequence streamed for `video_id`
    pub fn add_video(&self, video_id: u64, tokens: Vec<Vec<f32>>) {
        self.videos.insert(video_id, Arc::new(tokens));
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| NvcError::ServerStartFailed {
                address: self.bind_addr.to_string(),
                source: e.into(),
            })
    }

    /// Start the signaling server
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Bind and serve in a background task, returning the bound address
    pub async fn start_background(&self) -> Result<SocketAddr> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let server = self.clone();
        tokio::spawn(async move { server.serve(listener).await });
        Ok(addr)
    }

    /// Accept connections from `listener` until it fails
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Signaling server listening on {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Handle incoming WebSocket connection
    async fn handle_connection(&self, stream: TcpStream) {
        self.stats.connections_accepted.fetch_add(1, Ordering::SeqCst);
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let connection_id = Uuid::new_v4().to_string();
        tracing::debug!("WebSocket connection established: {}", connection_id);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let connection = Arc::new(Connection {
            outbound,
            stream: Mutex::new(None),
        });
        self.connections
            .insert(connection_id.clone(), connection.clone());

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalingMessage::parse(&text) {
                    Ok(message) => {
                        self.handle_signaling_message(&connection_id, &connection, message)
                            .await
                    }
                    Err(e) => {
                        tracing::warn!("Invalid message format: {}", e);
                        connection.send(&SignalingMessage::error(e.to_string(), None));
                    }
                },
                Ok(Message::Close(_)) => {
                    tracing::debug!("Connection {} closed", connection_id);
                    break;
                }
                Err(e) => {
                    tracing::debug!("WebSocket error on connection {}: {}", connection_id, e);
                    break;
                }
                Ok(_) => {}
            }
        }

        connection.stop_stream();
        self.connections.remove(&connection_id);
    }

    /// Handle a signaling message
    async fn handle_signaling_message(
        &self,
        connection_id: &str,
        connection: &Arc<Connection>,
        message: SignalingMessage,
    ) {
        match message {
            SignalingMessage::Init(init) => {
                tracing::debug!(fps = init.fps, "Init from {}", connection_id);
                connection.send(&SignalingMessage::InitResponse(InitResponsePayload {
                    session_id: Some(connection_id.to_string()),
                    config: Some(ServerConfig {
                        buffer_size: self.settings.buffer_size,
                        max_frames: self.settings.max_frames,
                        fps: Some(init.fps),
                    }),
                }));
            }
            SignalingMessage::Offer(offer) => {
                let transport = RelayPeerTransport::new();
                match transport.set_remote_offer(offer).await {
                    Ok(answer) => {
                        self.stats.offers_answered.fetch_add(1, Ordering::SeqCst);
                        let candidates = transport.local_candidates().await;
                        if self.settings.candidate_before_answer {
                            for candidate in candidates {
                                connection.send(&SignalingMessage::IceCandidate(candidate));
                            }
                            connection.send(&SignalingMessage::Answer(answer));
                        } else {
                            connection.send(&SignalingMessage::Answer(answer));
                            for candidate in candidates {
                                connection.send(&SignalingMessage::IceCandidate(candidate));
                            }
                        }
                    }
                    Err(e) => connection.send(&SignalingMessage::error(e.to_string(), None)),
                }
            }
            SignalingMessage::IceCandidate(_) => {
                self.stats.candidates_received.fetch_add(1, Ordering::SeqCst);
            }
            SignalingMessage::ProcessFrames(request) => {
                self.stats.process_requests.fetch_add(1, Ordering::SeqCst);
                self.start_stream(connection, request);
            }
            SignalingMessage::PlaybackControl(control) => match control.action {
                PlaybackAction::Pause | PlaybackAction::Stop => connection.stop_stream(),
                _ => {}
            },
            SignalingMessage::Unknown { kind, .. } => {
                connection.send(&SignalingMessage::error(
                    format!("Unknown message type: {}", kind),
                    None,
                ));
            }
            other => {
                tracing::debug!(
                    "Ignoring {} from {}",
                    other.message_type(),
                    connection_id
                );
            }
        }
    }

    fn start_stream(&self, connection: &Arc<Connection>, request: ProcessFramesPayload) {
        connection.stop_stream();

        let tokens = match self.videos.get(&request.video_id) {
            Some(tokens) => tokens.value().clone(),
            None => {
                connection.send(&SignalingMessage::error(
                    format!("Unknown video: {}", request.video_id),
                    None,
                ));
                return;
            }
        };

        let interval = self.settings.frame_interval;
        let limit = self.settings.max_frames;
        let target = connection.clone();
        let task = tokio::spawn(async move {
            let start = request.current_frame as usize;
            for (index, token) in tokens.iter().enumerate().skip(start) {
                if limit.is_some_and(|max| index as u64 >= max) {
                    break;
                }
                target.send(&SignalingMessage::FrameToken(FrameTokenMessage {
                    frame_index: index as u64,
                    token: serde_json::json!([token]),
                }));
                tokio::time::sleep(interval).await;
            }
        });
        *connection.stream.lock() = Some(task);
    }

    /// Ask every connected client to restart its session
    pub fn restart_all(&self) {
        for connection in self.connections.iter() {
            connection.value().send(&SignalingMessage::Restart);
        }
    }

    /// Close every connection with `code`
    pub fn disconnect_all(&self, code: u16, reason: &str) {
        for connection in self.connections.iter() {
            connection.value().stop_stream();
            let _ = connection.value().outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })));
        }
    }

    /// Stop the signaling server
    pub fn stop(&self) {
        self.disconnect_all(1001, "Server shutting down");
        self.connections.clear();
        tracing::info!("Signaling server stopped");
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections accepted since start, failed handshakes included
    pub fn connections_accepted(&self) -> usize {
        self.stats.connections_accepted.load(Ordering::SeqCst)
    }

    /// Offers answered since start
    pub fn offers_answered(&self) -> usize {
        self.stats.offers_answered.load(Ordering::SeqCst)
    }

    /// Candidates received from clients since start
    pub fn candidates_received(&self) -> usize {
        self.stats.candidates_received.load(Ordering::SeqCst)
    }

    /// `process_frames` requests received since start
    pub fn process_requests(&self) -> usize {
        self.stats.process_requests.load(Ordering::SeqCst)
    }
}
