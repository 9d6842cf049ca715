//! Neural codec streaming client
//!
//! [`NeuralCodecClient`] ties the pieces together: a peer session supervised
//! for reconnects, reference data and frame decoding, the frame buffer and
//! token cache, and per-video prefetch and pacing tasks. Background tasks are
//! cancelled through `watch` shutdown signals and hold only weak references
//! to the client.

use crate::api::{TokenBatch, VideoApi};
use crate::config::CodecConfig;
use crate::event::{BufferKind, CodecEvent, EventBus, EventFilter, EventStream, FilteredEventStream};
use crate::metrics::{CodecMetrics, MetricsTracker};
use crate::playback::{MediaClock, PlaybackController, PlaybackState, SyncAction, VideoState, WallClock};
use crate::prefetch::{Prefetcher, TokenSink};
use async_trait::async_trait;
use nvc_core::{
    GraphModel, MemoryInfo, ModelHandle, ModelLoader, NvcError, Result, StaticModelLoader,
    TensorRegistry,
};
use nvc_diagnostics::{ConnectionAnalyzer, ConnectionInfo, ConnectionState, MemoryProfiler};
use nvc_media::{
    DecodedFrame, FrameBuffer, FrameDecoder, FrameToken, InsertOutcome, ReferenceCache,
    ReferenceData, TokenCache,
};
use nvc_signaling::{
    CloseInfo, FrameTokenMessage, PeerSession, PeerTransport, PlaybackAction, PlaybackControl,
    ProcessFramesPayload, RelayPeerTransport, SessionEvent, SignalingMessage, CLOSE_ABNORMAL,
    CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Creates a fresh peer transport for every connection attempt
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn PeerTransport> + Send + Sync>;

const DEFAULT_MODEL_PATH: &str = "model.json";

/// Fluent builder for [`NeuralCodecClient`]
pub struct NeuralCodecClientBuilder {
    config: CodecConfig,
    model_loader: Option<Arc<dyn ModelLoader>>,
    transport_factory: Option<TransportFactory>,
    clock: Option<Arc<dyn MediaClock>>,
}

impl NeuralCodecClientBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: CodecConfig::default(),
            model_loader: None,
            transport_factory: None,
            clock: None,
        }
    }

    /// Use `config`
    pub fn config(mut self, config: CodecConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the model through `loader`
    pub fn model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loader = Some(loader);
        self
    }

    /// Use an already constructed model
    pub fn model(self, model: Arc<dyn GraphModel>) -> Self {
        self.model_loader(Arc::new(StaticModelLoader::new(model)))
    }

    /// Create peer transports with `factory` instead of the signaling relay
    pub fn peer_transport<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn PeerTransport> + Send + Sync + 'static,
    {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    /// Synchronise playback with `clock` instead of the wall clock
    pub fn media_clock(mut self, clock: Arc<dyn MediaClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and create the client
    pub fn build(self) -> Result<NeuralCodecClient> {
        self.config.validate()?;

        let config = self.config;
        let api = Arc::new(VideoApi::new(&config.api_base_url, config.request_timeout)?);
        let registry = TensorRegistry::new();
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(WallClock::new()) as Arc<dyn MediaClock>);
        let transport_factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(|| Arc::new(RelayPeerTransport::new()) as Arc<dyn PeerTransport>)
        });
        let model = self.model_loader.map(|loader| {
            let path = config
                .model_path
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string());
            ModelHandle::new(path, loader)
        });

        let inner = ClientInner {
            api,
            events: EventBus::new(),
            decoder: Arc::new(FrameDecoder::new(registry.clone())),
            profiler: MemoryProfiler::new(registry.clone(), config.memory.clone()),
            registry,
            model,
            transport_factory,
            references: Mutex::new(ReferenceCache::new()),
            buffer: Mutex::new(FrameBuffer::new(config.buffer_size)),
            tokens: Mutex::new(TokenCache::new(config.prefetch.token_cache_capacity)),
            playback: Mutex::new(PlaybackController::new(
                config.fps,
                config.buffer_size,
                config.sync.clone(),
                clock.clone(),
            )),
            metrics: Mutex::new(MetricsTracker::new(config.metrics_interval)),
            clock,
            connection: ConnectionAnalyzer::new(),
            session: Mutex::new(None),
            supervisor: Mutex::new(None),
            playback_tasks: Mutex::new(None),
            total_frames: AtomicU64::new(0),
            config,
        };
        info!(
            fps = inner.config.fps,
            buffer_size = inner.config.buffer_size,
            "Neural codec client created"
        );
        Ok(NeuralCodecClient {
            inner: Arc::new(inner),
        })
    }
}

impl Default for NeuralCodecClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NeuralCodecClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuralCodecClientBuilder")
            .field("config", &self.config)
            .field("model_loader", &self.model_loader)
            .field("custom_transport", &self.transport_factory.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

/// Streaming client for the neural video codec
#[derive(Clone)]
pub struct NeuralCodecClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for NeuralCodecClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuralCodecClient")
            .field("connection", &self.inner.connection.state())
            .field("playback", &self.playback_state())
            .field("video", &self.video_state())
            .finish_non_exhaustive()
    }
}

impl NeuralCodecClient {
    /// Start building a client
    pub fn builder() -> NeuralCodecClientBuilder {
        NeuralCodecClientBuilder::new()
    }

    /// Client with `config` and no model; frames cannot be decoded until a
    /// model loader is supplied through the builder
    pub fn new(config: CodecConfig) -> Result<Self> {
        NeuralCodecClientBuilder::new().config(config).build()
    }

    /// Active configuration
    pub fn config(&self) -> &CodecConfig {
        &self.inner.config
    }

    /// HTTP video API client
    pub fn api(&self) -> &VideoApi {
        &self.inner.api
    }

    /// Establish a peer session with `url`, retrying with backoff
    ///
    /// Exhausting the configured attempts emits a terminal
    /// [`CodecEvent::Error`] with code `MAX_RETRIES_EXCEEDED` and returns the
    /// error. Once connected, dropped sessions are re-established the same way
    /// and an active video resumes streaming.
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.inner.disconnect().await;
        self.inner.connection.set_url(url);
        let events = self.inner.establish(url, false).await?;
        self.inner.spawn_supervisor(url, events);
        Ok(())
    }

    /// Close the peer session and stop reconnecting
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Load the model, reporting progress as [`BufferKind::Model`] status events
    pub async fn init_model(&self) -> Result<()> {
        self.inner.emit_on_error(self.inner.init_model().await)
    }

    /// Load the model unless it is already loaded
    pub async fn ensure_model(&self) -> Result<()> {
        self.inner.emit_on_error(self.inner.ensure_model().await)
    }

    /// Start playing `video_id`, or resume it when it is paused
    ///
    /// Loads the video's reference data (releasing the previous video's),
    /// decodes the initial prefetch, starts the prefetch and pacing tasks and
    /// asks the server to stream tokens.
    pub async fn start_playback(&self, video_id: u64) -> Result<()> {
        let result = self.inner.start_playback(video_id).await;
        if let Err(e) = &result {
            warn!(video_id = video_id, "Failed to start playback: {}", e);
            self.inner.stop_playback();
            self.inner.events.emit(CodecEvent::from_error(e));
        }
        result
    }

    /// Decode `token` into the frame buffer
    ///
    /// Failures are counted as dropped frames and emitted as error events.
    pub async fn process_frame(&self, token: FrameToken) -> Result<InsertOutcome> {
        self.inner.process_frame(token).await
    }

    /// Pause playback, returning the frame at the playhead
    pub fn pause(&self) -> Result<u64> {
        let frame = self.inner.playback.lock().pause()?;
        self.inner.send_control(PlaybackAction::Pause, frame);
        self.inner.events.emit(CodecEvent::PlaybackChanged {
            state: PlaybackState::Paused,
            frame_index: frame,
        });
        let paused = self.inner.metrics.lock().paused();
        self.inner.events.emit(CodecEvent::MetricsUpdate(paused));
        Ok(frame)
    }

    /// Resume paused playback, returning the frame at the playhead
    pub fn resume(&self) -> Result<u64> {
        self.inner.resume()
    }

    /// Stop playback and drop buffered frames; reference data is kept
    pub fn stop(&self) {
        self.inner.stop_playback();
    }

    /// Move the playhead to `frame`
    pub async fn seek(&self, frame: u64) -> Result<()> {
        self.inner.seek(frame).await
    }

    /// Stop playback, disconnect and release reference data, unloading the
    /// model unless `preserve_model` is set
    pub async fn cleanup(&self, preserve_model: bool) {
        let inner = &self.inner;
        inner.stop_playback();
        inner.disconnect().await;
        inner.references.lock().clear();
        inner.metrics.lock().reset();
        if !preserve_model {
            if let Some(model) = &inner.model {
                model.unload().await;
            }
        }
        inner.profiler.log_memory_usage("cleanup");
        info!(preserve_model = preserve_model, "Client cleaned up");
    }

    /// Whether a peer session is up
    pub fn is_connected(&self) -> bool {
        self.inner
            .session()
            .map(|session| session.is_connected())
            .unwrap_or(false)
    }

    /// Latest metrics
    pub fn metrics(&self) -> CodecMetrics {
        self.inner.metrics.lock().snapshot()
    }

    /// Selected video, if any
    pub fn video_state(&self) -> Option<VideoState> {
        self.inner.playback.lock().video_state()
    }

    /// Playback state
    pub fn playback_state(&self) -> PlaybackState {
        self.inner.playback.lock().state()
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Subscribe to events matching `filter`
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventStream {
        FilteredEventStream::new(self.inner.events.subscribe(), filter)
    }

    /// Connection diagnostics
    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection.info()
    }

    /// Live tensor memory
    pub fn memory(&self) -> MemoryInfo {
        self.inner.registry.memory()
    }

    /// Indices of the buffered frames, ascending
    pub fn buffered_frames(&self) -> Vec<u64> {
        self.inner.buffer.lock().indices().collect()
    }

    /// Buffered frame at `index`
    pub fn frame(&self, index: u64) -> Option<DecodedFrame> {
        self.inner
            .buffer
            .lock()
            .get(index)
            .map(|buffered| buffered.frame.clone())
    }
}

struct ClientInner {
    config: CodecConfig,
    api: Arc<VideoApi>,
    events: EventBus,
    registry: TensorRegistry,
    decoder: Arc<FrameDecoder>,
    model: Option<ModelHandle>,
    transport_factory: TransportFactory,
    clock: Arc<dyn MediaClock>,
    references: Mutex<ReferenceCache>,
    buffer: Mutex<FrameBuffer>,
    tokens: Mutex<TokenCache>,
    playback: Mutex<PlaybackController>,
    metrics: Mutex<MetricsTracker>,
    connection: ConnectionAnalyzer,
    profiler: MemoryProfiler,
    session: Mutex<Option<Arc<PeerSession>>>,
    supervisor: Mutex<Option<watch::Sender<bool>>>,
    playback_tasks: Mutex<Option<watch::Sender<bool>>>,
    total_frames: AtomicU64,
}

impl ClientInner {
    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    fn set_connection_state(&self, state: ConnectionState) {
        if self.connection.transition(state) {
            self.events.emit(CodecEvent::ConnectionChanged { state });
        }
    }

    fn emit_on_error<T>(&self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.events.emit(CodecEvent::from_error(&e));
                Err(e)
            }
        }
    }

    fn session(&self) -> Option<Arc<PeerSession>> {
        self.session.lock().clone()
    }

    async fn establish(
        &self,
        url: &str,
        reconnecting: bool,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        self.set_connection_state(if reconnecting {
            ConnectionState::Reconnecting { attempt: 1 }
        } else {
            ConnectionState::Connecting
        });

        let result = nvc_signaling::retry_with_backoff(
            "connect",
            policy,
            |attempt| {
                let transport = (self.transport_factory)();
                let session_config = self.config.session_config();
                async move {
                    let started = Instant::now();
                    match PeerSession::establish(url, session_config, transport).await {
                        Ok(established) => {
                            self.connection.record_handshake(started.elapsed());
                            Ok(established)
                        }
                        Err(e) => {
                            debug!(attempt = attempt, url = url, "Connection attempt failed: {}", e);
                            self.connection.record_error(&e);
                            Err(e)
                        }
                    }
                }
            },
            |retry, delay| {
                let attempt = retry + 1;
                self.set_connection_state(ConnectionState::Reconnecting { attempt });
                self.events.emit(CodecEvent::Reconnecting {
                    attempt,
                    max_attempts,
                    delay,
                });
            },
        )
        .await;

        match result {
            Ok((session, events)) => {
                info!(session = session.id(), url = url, "Connected");
                if let Some(recommended) = session.server_config().and_then(|c| c.buffer_size) {
                    self.apply_server_buffer_size(recommended);
                }
                *self.session.lock() = Some(Arc::new(session));
                self.set_connection_state(ConnectionState::Connected);
                Ok(events)
            }
            Err(e) => {
                warn!(url = url, code = %e.error_code(), "Giving up connecting: {}", e);
                self.connection.record_error(&e);
                self.set_connection_state(ConnectionState::Failed);
                self.events.emit(CodecEvent::from_error(&e));
                Err(e)
            }
        }
    }

    fn spawn_supervisor(
        self: &Arc<Self>,
        url: &str,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (tx, rx) = watch::channel(false);
        if let Some(previous) = self.supervisor.lock().replace(tx) {
            let _ = previous.send(true);
        }
        tokio::spawn(supervise(
            Arc::downgrade(self),
            url.to_string(),
            events,
            rx,
        ));
    }

    async fn disconnect(&self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.send(true);
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close(CLOSE_NORMAL, "Client disconnect").await;
        }
        self.set_connection_state(ConnectionState::Disconnected);
    }

    /// Returns the close when the session has ended
    async fn handle_session_event(&self, event: SessionEvent) -> Option<CloseInfo> {
        match event {
            SessionEvent::FrameToken(message) => self.handle_data_token(message).await,
            SessionEvent::PlaybackControl(control) => {
                debug!(
                    action = ?control.action,
                    frame = control.frame_index,
                    "Server playback control"
                );
            }
            SessionEvent::Restarting => self.set_connection_state(ConnectionState::Connecting),
            SessionEvent::Renegotiated => {
                self.set_connection_state(ConnectionState::Connected);
                self.request_stream();
            }
            SessionEvent::ServerError(payload) => {
                let error = NvcError::Signaling {
                    message: payload.message,
                    code: payload.code,
                };
                self.connection.record_error(&error);
                self.events.emit(CodecEvent::from_error(&error));
            }
            SessionEvent::NegotiationFailed(reason) => {
                let error = NvcError::ProtocolError { message: reason };
                self.connection.record_error(&error);
                self.events.emit(CodecEvent::from_error(&error));
            }
            SessionEvent::Closed(close) => return Some(close),
        }
        None
    }

    async fn handle_data_token(&self, message: FrameTokenMessage) {
        let token = match FrameToken::from_json(message.frame_index, &message.token) {
            Ok(token) => token,
            Err(e) => {
                let error = NvcError::from(e);
                warn!(frame = message.frame_index, "Invalid frame token: {}", error);
                self.events.emit(CodecEvent::from_error(&error));
                return;
            }
        };

        let current = match self.current_frame() {
            Some(current) => current,
            None => {
                trace!(frame = token.frame_index, "No video selected, ignoring token");
                return;
            }
        };
        if token.frame_index < current {
            trace!(frame = token.frame_index, current = current, "Ignoring stale token");
            return;
        }
        if !self.tokens.lock().insert(token) {
            trace!("Token cache full, dropping far token");
        }
        self.fill_buffer().await;
    }

    // ------------------------------------------------------------------
    // Model and reference data
    // ------------------------------------------------------------------

    async fn init_model(&self) -> Result<Arc<dyn GraphModel>> {
        let handle = self
            .model
            .as_ref()
            .ok_or_else(|| NvcError::MissingConfiguration {
                field: "model loader".to_string(),
            })?;
        let events = &self.events;
        let progress = |percent: u8| {
            events.emit(CodecEvent::BufferStatus {
                kind: BufferKind::Model,
                frame_count: percent as usize,
                capacity: 100,
                health: percent as f64,
            })
        };
        handle.ensure(&progress).await
    }

    async fn ensure_model(&self) -> Result<Arc<dyn GraphModel>> {
        if let Some(handle) = &self.model {
            if let Some(model) = handle.current().await {
                return Ok(model);
            }
        }
        self.init_model().await
    }

    async fn loaded_model(&self) -> Result<Arc<dyn GraphModel>> {
        match &self.model {
            Some(handle) => handle.current().await.ok_or(NvcError::ModelNotLoaded),
            None => Err(NvcError::ModelNotLoaded),
        }
    }

    async fn load_reference(&self, video_id: u64) -> Result<Arc<ReferenceData>> {
        let existing = {
            let mut references = self.references.lock();
            references.retain_only(video_id);
            references.get(video_id)
        };
        if let Some(reference) = existing {
            debug!(video_id = video_id, "Reusing reference data");
            return Ok(reference);
        }

        let payload = self.api.reference(video_id).await?;
        self.record_latency();
        let data = ReferenceData::from_payload(
            video_id,
            &payload,
            &self.config.reference_shapes,
            &self.registry,
            &self.config.memory,
        )?;
        let reference = self.references.lock().insert(data);
        self.profiler.log_memory_usage("reference loaded");
        Ok(reference)
    }

    fn current_reference(&self) -> Result<Arc<ReferenceData>> {
        let video_id = self
            .playback
            .lock()
            .video_id()
            .ok_or(NvcError::NoVideoSelected)?;
        self.references
            .lock()
            .get(video_id)
            .ok_or(NvcError::ReferenceDataMissing { video_id })
    }

    // ------------------------------------------------------------------
    // Decoding and buffering
    // ------------------------------------------------------------------

    async fn process_frame(&self, token: FrameToken) -> Result<InsertOutcome> {
        let index = token.frame_index;
        let started = Instant::now();
        match self.decode(token).await {
            Ok(frame) => {
                self.metrics.lock().record_decode(started.elapsed());
                Ok(self.store_frame(index, frame))
            }
            Err(e) => {
                self.metrics.lock().record_drop();
                warn!(frame = index, code = %e.error_code(), "Frame decode failed: {}", e);
                self.events.emit(CodecEvent::from_error(&e));
                Err(e)
            }
        }
    }

    async fn decode(&self, token: FrameToken) -> Result<DecodedFrame> {
        let model = self.loaded_model().await?;
        let reference = self.current_reference()?;
        let decoder = self.decoder.clone();
        tokio::task::spawn_blocking(move || {
            decoder.process_frame(model.as_ref(), &reference, &token)
        })
        .await
        .map_err(|e| NvcError::InferenceFailed {
            reason: format!("decode task failed: {}", e),
        })?
    }

    fn store_frame(&self, index: u64, frame: DecodedFrame) -> InsertOutcome {
        let current = self.current_frame().unwrap_or(0);
        if index < current {
            trace!(frame = index, current = current, "Frame decoded behind the playhead");
            return InsertOutcome::Rejected;
        }
        let (outcome, health) = {
            let mut buffer = self.buffer.lock();
            let outcome = buffer.insert(index, frame.clone(), current);
            (outcome, buffer.health())
        };
        self.metrics.lock().set_buffer_health(health);

        match outcome {
            InsertOutcome::Rejected => {
                trace!(frame = index, "Buffer full, frame rejected");
            }
            InsertOutcome::Evicted(evicted) => {
                trace!(frame = index, evicted = evicted, "Buffer full, frame evicted");
            }
            _ => {}
        }
        if outcome.is_stored() {
            self.events.emit(CodecEvent::FrameReady {
                frame_index: index,
                frame,
            });
        }
        outcome
    }

    /// Decode cached tokens at or after the playhead while the buffer accepts them
    async fn fill_buffer(&self) {
        for _ in 0..self.config.buffer_size {
            let next = {
                let current = match self.current_frame() {
                    Some(current) => current,
                    None => return,
                };
                let buffer = self.buffer.lock();
                let mut tokens = self.tokens.lock();
                let index = tokens
                    .upcoming(current, buffer.capacity())
                    .iter()
                    .map(|token| token.frame_index)
                    .find(|index| !buffer.contains(*index));
                match index {
                    Some(index) if buffer.accepts(index, current) => tokens.take(index),
                    _ => None,
                }
            };
            match next {
                Some(token) => {
                    let _ = self.process_frame(token).await;
                }
                None => return,
            }
        }
    }

    /// Batch-decode cached tokens into the free buffer slots
    async fn decode_initial(&self, reference: Arc<ReferenceData>, from: u64) -> Result<()> {
        let model = self.loaded_model().await?;
        let batch: Vec<FrameToken> = {
            let buffer = self.buffer.lock();
            let free = buffer.capacity().saturating_sub(buffer.len());
            let mut tokens = self.tokens.lock();
            let indices: Vec<u64> = tokens
                .upcoming(from, free)
                .iter()
                .map(|token| token.frame_index)
                .collect();
            indices
                .into_iter()
                .filter_map(|index| tokens.take(index))
                .collect()
        };

        let mut last = Instant::now();
        let summary = self
            .decoder
            .process_batch(
                model,
                Arc::clone(&reference),
                batch,
                self.config.batch_chunk_size,
                |index, result| {
                    match result {
                        Ok(frame) => {
                            self.metrics.lock().record_decode(last.elapsed());
                            self.store_frame(index, frame);
                        }
                        Err(e) => {
                            self.metrics.lock().record_drop();
                            self.events.emit(CodecEvent::from_error(&e));
                        }
                    }
                    last = Instant::now();
                },
            )
            .await;
        info!(
            video_id = reference.video_id,
            decoded = summary.decoded,
            failed = summary.failed,
            "Initial frames decoded"
        );
        Ok(())
    }

    fn absorb(&self, batch: TokenBatch) {
        self.record_latency();
        self.set_total_frames(batch.metadata.total_frames);
        let current = self.current_frame().unwrap_or(0);
        let mut tokens = self.tokens.lock();
        for token in batch.frame_tokens() {
            if token.frame_index >= current {
                tokens.insert(token);
            }
        }
    }

    /// Fetch the initial prefetch window from `start`, returning where the
    /// prefetch loop continues
    /// Shrink the frame buffer to the size the server recommends
    fn apply_server_buffer_size(&self, recommended: usize) {
        let capacity = recommended.min(self.config.buffer_size).max(1);
        let current = self.current_frame().unwrap_or(0);
        let mut playback = self.playback.lock();
        let mut buffer = self.buffer.lock();
        if buffer.capacity() == capacity {
            return;
        }
        let evicted = buffer.set_capacity(capacity, current);
        playback.set_buffer_size(capacity);
        info!(
            capacity = capacity,
            evicted = evicted.len(),
            "Frame buffer sized to server recommendation"
        );
    }

    async fn fetch_window(&self, video_id: u64, start: u64) -> Result<u64> {
        let window = self.config.prefetch_size().max(1) as u64;
        let mut end = start + window - 1;
        if let Some(total) = self.total_frames() {
            if start >= total {
                return Ok(start);
            }
            end = end.min(total - 1);
        }
        let batch = self.api.tokens(video_id, start, end).await?;
        let next = batch.resume_from(start, end);
        self.absorb(batch);
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    fn current_frame(&self) -> Option<u64> {
        self.playback.lock().current_frame()
    }

    fn total_frames(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::Relaxed) {
            0 => None,
            total => Some(total),
        }
    }

    fn set_total_frames(&self, total: u64) {
        if total > 0 {
            self.total_frames.store(total, Ordering::Relaxed);
        }
    }

    fn record_latency(&self) {
        if let Some(latency) = self.api.last_latency() {
            self.metrics.lock().record_latency(latency);
        }
    }

    async fn start_playback(self: &Arc<Self>, video_id: u64) -> Result<()> {
        self.ensure_model().await?;
        if self.playback.lock().can_resume(video_id) {
            self.resume()?;
            return Ok(());
        }

        self.stop_playback();
        self.metrics.lock().reset();
        self.total_frames.store(0, Ordering::Relaxed);

        let reference = self.load_reference(video_id).await?;
        match self.api.metadata(video_id).await {
            Ok(metadata) => self.set_total_frames(metadata.frame_count),
            Err(e) => debug!(video_id = video_id, "Metadata unavailable: {}", e),
        }

        let next_start = self.fetch_window(video_id, 0).await?;
        self.decode_initial(reference, 0).await?;
        self.emit_buffer_status();

        self.playback.lock().start(video_id);
        self.spawn_playback_tasks(video_id, next_start);
        self.request_stream();
        self.events.emit(CodecEvent::PlaybackChanged {
            state: PlaybackState::Playing,
            frame_index: 0,
        });
        Ok(())
    }

    fn resume(&self) -> Result<u64> {
        let frame = self.playback.lock().resume()?;
        self.send_control(PlaybackAction::Resume, frame);
        self.events.emit(CodecEvent::PlaybackChanged {
            state: PlaybackState::Playing,
            frame_index: frame,
        });
        Ok(frame)
    }

    fn stop_playback(&self) {
        self.stop_tasks();
        let last = self.playback.lock().stop();
        self.buffer.lock().clear();
        self.tokens.lock().clear();
        if let Some(frame) = last {
            self.send_control(PlaybackAction::Stop, frame);
            self.events.emit(CodecEvent::PlaybackChanged {
                state: PlaybackState::Stopped,
                frame_index: frame,
            });
        }
    }

    async fn seek(self: &Arc<Self>, frame: u64) -> Result<()> {
        let video_id = self
            .playback
            .lock()
            .video_id()
            .ok_or(NvcError::NoVideoSelected)?;
        self.stop_tasks();
        let from = self.playback.lock().seek(frame)?;
        self.buffer.lock().sweep(frame);
        self.tokens.lock().sweep(frame);

        let cached = self.buffer.lock().contains(frame) || self.tokens.lock().contains(frame);
        let fetched = if cached {
            let highest = self.tokens.lock().highest_index();
            Ok(highest.map(|h| h + 1).unwrap_or(frame).max(frame))
        } else {
            self.fetch_window(video_id, frame).await
        };
        let next_start = match &fetched {
            Ok(next) => *next,
            Err(_) => frame,
        };

        self.fill_buffer().await;
        self.spawn_playback_tasks(video_id, next_start);
        self.send_control(PlaybackAction::Seek, frame);
        self.request_stream();
        let state = self.playback.lock().state();
        self.events.emit(CodecEvent::PlaybackChanged {
            state,
            frame_index: frame,
        });
        debug!(from = from, to = frame, "Seek complete");

        if let Err(e) = &fetched {
            self.events.emit(CodecEvent::from_error(e));
        }
        fetched.map(|_| ())
    }

    fn spawn_playback_tasks(self: &Arc<Self>, video_id: u64, prefetch_start: u64) {
        let (tx, rx) = watch::channel(false);
        if let Some(previous) = self.playback_tasks.lock().replace(tx) {
            let _ = previous.send(true);
        }

        let prefetcher = Prefetcher::new(
            self.api.clone(),
            video_id,
            prefetch_start,
            self.config.prefetch.clone(),
        )
        .with_total_frames(self.total_frames());
        let sink: Arc<dyn TokenSink> = Arc::new(PlaybackSink {
            inner: Arc::downgrade(self),
            video_id,
        });
        tokio::spawn(prefetcher.run(rx.clone(), sink));
        tokio::spawn(run_pacer(Arc::downgrade(self), rx));
    }

    fn stop_tasks(&self) {
        if let Some(tasks) = self.playback_tasks.lock().take() {
            let _ = tasks.send(true);
        }
    }

    /// Present the frame at the playhead; `false` ends the pacing task
    async fn step_playback(&self) -> bool {
        let current = {
            let playback = self.playback.lock();
            if !playback.is_playing() {
                return playback.video_id().is_some();
            }
            match playback.current_frame() {
                Some(current) => current,
                None => return false,
            }
        };

        if let Some(total) = self.total_frames() {
            if current >= total {
                self.finish_playback(current);
                return false;
            }
        }

        if !self.buffer.lock().contains(current) {
            let token = self.tokens.lock().take(current);
            if let Some(token) = token {
                let _ = self.process_frame(token).await;
            }
        }

        let available = self.buffer.lock().contains(current);
        if !available {
            let later = self.buffer.lock().has_after(current) || self.tokens.lock().has_after(current);
            if !later {
                trace!(frame = current, "Waiting for frames");
                return true;
            }
            self.metrics.lock().record_drop();
            debug!(frame = current, "Frame unavailable, skipping");
        }

        if let Some(next) = self.playback.lock().advance() {
            self.buffer.lock().sweep(next);
            self.tokens.lock().sweep(next);
        }
        self.fill_buffer().await;
        true
    }

    fn finish_playback(&self, last: u64) {
        info!(frame = last, "Reached the end of the video");
        self.stop_tasks();
        self.playback.lock().stop();
        self.send_control(PlaybackAction::Stop, last);
        self.events.emit(CodecEvent::PlaybackChanged {
            state: PlaybackState::Stopped,
            frame_index: last,
        });
    }

    fn check_sync(&self) {
        let action = self.playback.lock().check_sync();
        if let SyncAction::Seek { from, to } = action {
            self.metrics.lock().record_drops(to.saturating_sub(from));
            self.buffer.lock().sweep(to);
            self.tokens.lock().sweep(to);
        }
    }

    fn emit_buffer_status(&self) {
        let (frame_count, capacity, health) = {
            let buffer = self.buffer.lock();
            (buffer.len(), buffer.capacity(), buffer.health())
        };
        self.events.emit(CodecEvent::BufferStatus {
            kind: BufferKind::Buffer,
            frame_count,
            capacity,
            health,
        });
    }

    fn publish_metrics(&self) {
        let health = self.buffer.lock().health();
        let playing = self.playback.lock().is_playing();
        let latency = self.api.last_latency();
        let snapshot = {
            let mut metrics = self.metrics.lock();
            metrics.set_buffer_health(health);
            if let Some(latency) = latency {
                metrics.record_latency(latency);
            }
            if playing {
                metrics.tick()
            } else {
                Some(metrics.paused())
            }
        };
        if let Some(snapshot) = snapshot {
            self.events.emit(CodecEvent::MetricsUpdate(snapshot));
            self.emit_buffer_status();
            self.profiler.log_memory_usage("playback");
        }
    }

    // ------------------------------------------------------------------
    // Server messages
    // ------------------------------------------------------------------

    fn request_stream(&self) {
        let video = match self.playback.lock().video_state() {
            Some(video) => video,
            None => return,
        };
        let session = match self.session() {
            Some(session) => session,
            None => {
                debug!(video_id = video.video_id, "No session, tokens come over HTTP only");
                return;
            }
        };
        let message = SignalingMessage::ProcessFrames(ProcessFramesPayload {
            video_id: video.video_id,
            current_frame: video.current_frame,
            reference_frame: video.reference_frame,
        });
        if let Err(e) = session.send(&message) {
            warn!(video_id = video.video_id, "Failed to request frames: {}", e);
        }
    }

    fn send_control(&self, action: PlaybackAction, frame_index: u64) {
        let session = match self.session() {
            Some(session) => session,
            None => return,
        };
        let message = SignalingMessage::PlaybackControl(PlaybackControl {
            action,
            timestamp: self.clock.position().as_secs_f64(),
            frame_index,
        });
        if let Err(e) = session.send_data(&message) {
            debug!(action = ?action, "Playback control not sent: {}", e);
        }
    }
}

async fn supervise(
    client: Weak<ClientInner>,
    url: String,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(url = %url, "Session supervisor started");
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let inner = match client.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        let close = match event {
            Some(event) => match inner.handle_session_event(event).await {
                Some(close) => close,
                None => continue,
            },
            None => CloseInfo::abnormal("session events ended"),
        };

        inner.session.lock().take();
        if !close.should_reconnect() {
            info!(code = close.code, reason = %close.reason, "Session closed");
            inner.set_connection_state(ConnectionState::Disconnected);
            break;
        }

        warn!(code = close.code, reason = %close.reason, "Session lost, reconnecting");
        if !matches!(close.code, CLOSE_GOING_AWAY | CLOSE_ABNORMAL) {
            let error = NvcError::Signaling {
                message: format!("connection closed: {}", close.reason),
                code: Some(close.code),
            };
            inner.connection.record_error(&error);
            inner.events.emit(CodecEvent::from_error(&error));
        }
        let reconnected = tokio::select! {
            result = inner.establish(&url, true) => result,
            _ = shutdown.changed() => break,
        };
        match reconnected {
            Ok(new_events) => {
                events = new_events;
                inner.request_stream();
            }
            Err(_) => break,
        }
    }
    debug!(url = %url, "Session supervisor stopped");
}

async fn run_pacer(client: Weak<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    let (sync_every, metrics_every, first_interval) = match client.upgrade() {
        Some(inner) => (
            inner.config.sync.interval,
            inner.config.metrics_interval,
            inner.playback.lock().frame_interval(),
        ),
        None => return,
    };
    let mut sync = tokio::time::interval(sync_every);
    sync.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut metrics = tokio::time::interval(metrics_every);
    metrics.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next_frame = tokio::time::Instant::now() + first_interval;

    debug!("Playback pacer started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = sleep_until(next_frame) => {
                let inner = match client.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                if !inner.step_playback().await {
                    break;
                }
                let interval = inner.playback.lock().frame_interval();
                next_frame = tokio::time::Instant::now() + interval;
            }
            _ = sync.tick() => {
                match client.upgrade() {
                    Some(inner) => inner.check_sync(),
                    None => break,
                }
            }
            _ = metrics.tick() => {
                match client.upgrade() {
                    Some(inner) => inner.publish_metrics(),
                    None => break,
                }
            }
        }
    }
    debug!("Playback pacer stopped");
}

struct PlaybackSink {
    inner: Weak<ClientInner>,
    video_id: u64,
}

#[async_trait]
impl TokenSink for PlaybackSink {
    fn has_room(&self, tokens: usize) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                let cached = inner.tokens.lock().len();
                cached + tokens <= inner.config.prefetch.token_cache_capacity
            }
            None => false,
        }
    }

    fn is_active(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                let playback = inner.playback.lock();
                playback.is_playing() && playback.video_id() == Some(self.video_id)
            }
            None => false,
        }
    }

    async fn deliver(&self, batch: TokenBatch) {
        if let Some(inner) = self.inner.upgrade() {
            inner.absorb(batch);
            inner.fill_buffer().await;
        }
    }

    fn on_error(&self, error: &NvcError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.events.emit(CodecEvent::from_error(error));
        }
    }
}
