//! Event system for decoded frames, playback and connection changes

use crate::metrics::CodecMetrics;
use crate::playback::PlaybackState;
use nvc_core::NvcError;
use nvc_diagnostics::ConnectionState;
use nvc_media::DecodedFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// What a [`CodecEvent::BufferStatus`] reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    /// Decoded frame buffer fill
    Buffer,
    /// Model loading progress
    Model,
}

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// A decoded frame was stored in the buffer
    FrameReady {
        /// Frame index
        frame_index: u64,
        /// Decoded image
        frame: DecodedFrame,
    },
    /// Something went wrong
    Error {
        /// Human readable message
        message: String,
        /// Stable error code
        code: String,
        /// Whether the client will carry on or retry
        recoverable: bool,
    },
    /// Buffer fill or model loading progress
    BufferStatus {
        /// What is being reported
        kind: BufferKind,
        /// Frames buffered, or percent loaded for [`BufferKind::Model`]
        frame_count: usize,
        /// Buffer capacity, or 100 for [`BufferKind::Model`]
        capacity: usize,
        /// Fill in percent
        health: f64,
    },
    /// Periodic metrics
    MetricsUpdate(CodecMetrics),
    /// Connection state changed
    ConnectionChanged {
        /// New state
        state: ConnectionState,
    },
    /// A reconnect attempt was scheduled
    Reconnecting {
        /// Attempt about to be made, counting the first connect as one
        attempt: u32,
        /// Attempts allowed in total
        max_attempts: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Playback state changed
    PlaybackChanged {
        /// New state
        state: PlaybackState,
        /// Frame at the time of the change
        frame_index: u64,
    },
}

impl CodecEvent {
    /// Error event for `error`
    pub fn from_error(error: &NvcError) -> Self {
        CodecEvent::Error {
            message: error.to_string(),
            code: error.error_code().to_string(),
            recoverable: error.is_recoverable(),
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CodecEvent::FrameReady { .. } => "frame_ready",
            CodecEvent::Error { .. } => "error",
            CodecEvent::BufferStatus { .. } => "buffer_status",
            CodecEvent::MetricsUpdate(_) => "metrics_update",
            CodecEvent::ConnectionChanged { .. } => "connection_changed",
            CodecEvent::Reconnecting { .. } => "reconnecting",
            CodecEvent::PlaybackChanged { .. } => "playback_changed",
        }
    }

    /// Check if this is a frame event
    pub fn is_frame_event(&self) -> bool {
        matches!(self, CodecEvent::FrameReady { .. })
    }

    /// Check if this is a buffer, metrics or playback event
    pub fn is_status_event(&self) -> bool {
        matches!(
            self,
            CodecEvent::BufferStatus { .. }
                | CodecEvent::MetricsUpdate(_)
                | CodecEvent::PlaybackChanged { .. }
        )
    }

    /// Check if this is a connection event
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            CodecEvent::ConnectionChanged { .. } | CodecEvent::Reconnecting { .. }
        )
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, CodecEvent::Error { .. })
    }
}

/// Fans events out to every live subscriber
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CodecEvent>>>,
}

impl EventBus {
    /// Bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream::new(rx)
    }

    /// Deliver `event` to every subscriber, dropping closed ones
    pub fn emit(&self, event: CodecEvent) {
        trace!(event = event.event_type(), "Emitting event");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Stream of client events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<CodecEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<CodecEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<CodecEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<CodecEvent>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Check if the event stream is closed
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

/// Event filter for selective event processing
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// Whether to include frame events
    pub include_frame_events: bool,
    /// Whether to include buffer, metrics and playback events
    pub include_status_events: bool,
    /// Whether to include connection events
    pub include_connection_events: bool,
    /// Whether to include error events
    pub include_error_events: bool,
    /// Specific event types to include (if specified, overrides other filters)
    pub specific_event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a filter that includes all events
    pub fn all() -> Self {
        Self {
            include_frame_events: true,
            include_status_events: true,
            include_connection_events: true,
            include_error_events: true,
            specific_event_types: None,
        }
    }

    /// Create a filter that includes only frame events
    pub fn frames_only() -> Self {
        Self {
            include_frame_events: true,
            include_status_events: false,
            include_connection_events: false,
            include_error_events: false,
            specific_event_types: None,
        }
    }

    /// Everything except frames
    pub fn without_frames() -> Self {
        Self {
            include_frame_events: false,
            ..Self::all()
        }
    }

    /// Create a filter that includes only connection events
    pub fn connection_only() -> Self {
        Self {
            include_frame_events: false,
            include_status_events: false,
            include_connection_events: true,
            include_error_events: false,
            specific_event_types: None,
        }
    }

    /// Create a filter for specific event types
    pub fn specific(event_types: Vec<String>) -> Self {
        Self {
            include_frame_events: false,
            include_status_events: false,
            include_connection_events: false,
            include_error_events: false,
            specific_event_types: Some(event_types),
        }
    }

    /// Check if an event should be included based on this filter
    pub fn should_include(&self, event: &CodecEvent) -> bool {
        if let Some(ref specific_types) = self.specific_event_types {
            return specific_types.iter().any(|t| t == event.event_type());
        }

        (self.include_frame_events && event.is_frame_event())
            || (self.include_status_events && event.is_status_event())
            || (self.include_connection_events && event.is_connection_event())
            || (self.include_error_events && event.is_error_event())
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Filtered event stream that only yields events matching a filter
#[derive(Debug)]
pub struct FilteredEventStream {
    stream: EventStream,
    filter: EventFilter,
}

impl FilteredEventStream {
    /// Create a new filtered event stream
    pub fn new(stream: EventStream, filter: EventFilter) -> Self {
        Self { stream, filter }
    }

    /// Get the next event that matches the filter
    pub async fn next(&mut self) -> Option<CodecEvent> {
        while let Some(event) = self.stream.next().await {
            if self.filter.should_include(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Try to get the next filtered event without blocking
    pub fn try_next(&mut self) -> Result<Option<CodecEvent>, mpsc::error::TryRecvError> {
        while let Some(event) = self.stream.try_next()? {
            if self.filter.should_include(&event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Update the filter
    pub fn set_filter(&mut self, filter: EventFilter) {
        self.filter = filter;
    }

    /// Get the current filter
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_event(index: u64) -> CodecEvent {
        CodecEvent::FrameReady {
            frame_index: index,
            frame: DecodedFrame::from_rgb8(1, 1, vec![0u8, 0, 0]).unwrap(),
        }
    }

    // ============================================================================
    // EVENT CLASSIFICATION TESTS
    // ============================================================================

    #[test]
    fn test_event_types() {
        assert_eq!(frame_event(0).event_type(), "frame_ready");
        assert!(frame_event(0).is_frame_event());

        let reconnecting = CodecEvent::Reconnecting {
            attempt: 2,
            max_attempts: 5,
            delay: Duration::from_secs(1),
        };
        assert!(reconnecting.is_connection_event());
        assert!(!reconnecting.is_error_event());

        let status = CodecEvent::BufferStatus {
            kind: BufferKind::Buffer,
            frame_count: 30,
            capacity: 60,
            health: 50.0,
        };
        assert!(status.is_status_event());
        assert_eq!(status.event_type(), "buffer_status");
    }

    #[test]
    fn test_error_event_from_error() {
        let error = NvcError::MaxRetriesExceeded {
            operation: "connect".to_string(),
            attempts: 5,
            last_error: "refused".to_string(),
        };
        match CodecEvent::from_error(&error) {
            CodecEvent::Error {
                code, recoverable, ..
            } => {
                assert_eq!(code, "MAX_RETRIES_EXCEEDED");
                assert!(!recoverable);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // ============================================================================
    // EVENT BUS TESTS
    // ============================================================================

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(frame_event(7));

        for stream in [&mut first, &mut second] {
            match stream.next().await {
                Some(CodecEvent::FrameReady { frame_index, .. }) => assert_eq!(frame_index, 7),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_bus_drops_closed_subscribers() {
        let bus = EventBus::new();
        let mut closed = bus.subscribe();
        let _open = bus.subscribe();
        closed.close();

        bus.emit(frame_event(1));
        assert_eq!(bus.subscriber_count(), 1);
    }

    // ============================================================================
    // EVENT FILTER TESTS
    // ============================================================================

    #[test]
    fn test_filters() {
        let error = CodecEvent::Error {
            message: "decode failed".to_string(),
            code: "INFERENCE_FAILED".to_string(),
            recoverable: false,
        };

        assert!(EventFilter::all().should_include(&frame_event(0)));
        assert!(EventFilter::frames_only().should_include(&frame_event(0)));
        assert!(!EventFilter::frames_only().should_include(&error));
        assert!(!EventFilter::without_frames().should_include(&frame_event(0)));
        assert!(EventFilter::without_frames().should_include(&error));

        let specific = EventFilter::specific(vec!["error".to_string()]);
        assert!(specific.should_include(&error));
        assert!(!specific.should_include(&frame_event(0)));
    }

    #[tokio::test]
    async fn test_filtered_stream() {
        let bus = EventBus::new();
        let mut stream = FilteredEventStream::new(bus.subscribe(), EventFilter::connection_only());

        bus.emit(frame_event(0));
        bus.emit(CodecEvent::ConnectionChanged {
            state: ConnectionState::Connected,
        });

        match stream.try_next() {
            Ok(Some(CodecEvent::ConnectionChanged { state })) => {
                assert_eq!(state, ConnectionState::Connected)
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(stream.try_next(), Ok(None)));

        stream.set_filter(EventFilter::all());
        assert!(stream.filter().include_frame_events);
    }
}
