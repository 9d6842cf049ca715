//! Playback metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Metrics snapshot published once per metrics interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecMetrics {
    /// Frames decoded per second over the last window
    pub fps: f64,
    /// Buffer fill in percent
    pub buffer_health: f64,
    /// Mean decode time in milliseconds over the last window
    pub processing_time_ms: f64,
    /// Most recent HTTP round trip in milliseconds
    pub network_latency_ms: f64,
    /// Frames skipped since playback started
    pub dropped_frames: u64,
    /// Frames decoded since playback started
    pub frames_decoded: u64,
    /// When the snapshot was taken
    pub last_update: DateTime<Utc>,
}

impl Default for CodecMetrics {
    fn default() -> Self {
        Self {
            fps: 0.0,
            buffer_health: 0.0,
            processing_time_ms: 0.0,
            network_latency_ms: 0.0,
            dropped_frames: 0,
            frames_decoded: 0,
            last_update: Utc::now(),
        }
    }
}

/// Accumulates counters between metrics snapshots
#[derive(Debug)]
pub struct MetricsTracker {
    window: Duration,
    window_start: Instant,
    decode_time_in_window: Duration,
    decodes_in_window: u64,
    current: CodecMetrics,
}

impl MetricsTracker {
    /// Tracker publishing at most once per `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            window_start: Instant::now(),
            decode_time_in_window: Duration::ZERO,
            decodes_in_window: 0,
            current: CodecMetrics::default(),
        }
    }

    /// Count a decoded frame and its decode time
    pub fn record_decode(&mut self, elapsed: Duration) {
        self.decode_time_in_window += elapsed;
        self.decodes_in_window += 1;
        self.current.frames_decoded += 1;
    }

    /// Count a skipped frame
    pub fn record_drop(&mut self) {
        self.current.dropped_frames += 1;
    }

    /// Count `count` skipped frames
    pub fn record_drops(&mut self, count: u64) {
        self.current.dropped_frames += count;
    }

    /// Record an HTTP round trip
    pub fn record_latency(&mut self, latency: Duration) {
        self.current.network_latency_ms = latency.as_secs_f64() * 1000.0;
    }

    /// Record the buffer fill in percent
    pub fn set_buffer_health(&mut self, health: f64) {
        self.current.buffer_health = health;
    }

    /// Publish a snapshot if the window has elapsed
    pub fn tick(&mut self) -> Option<CodecMetrics> {
        self.tick_at(Instant::now())
    }

    /// Publish a snapshot if the window has elapsed at `now`
    pub fn tick_at(&mut self, now: Instant) -> Option<CodecMetrics> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        self.current.fps = self.decodes_in_window as f64 / secs;
        if self.decodes_in_window > 0 {
            self.current.processing_time_ms =
                self.decode_time_in_window.as_secs_f64() * 1000.0 / self.decodes_in_window as f64;
        }
        self.current.last_update = Utc::now();

        self.window_start = now;
        self.decode_time_in_window = Duration::ZERO;
        self.decodes_in_window = 0;

        Some(self.current.clone())
    }

    /// Snapshot with fps forced to zero, for when playback is paused
    pub fn paused(&mut self) -> CodecMetrics {
        self.window_start = Instant::now();
        self.decode_time_in_window = Duration::ZERO;
        self.decodes_in_window = 0;
        self.current.fps = 0.0;
        self.current.last_update = Utc::now();
        self.current.clone()
    }

    /// Last published values
    pub fn snapshot(&self) -> CodecMetrics {
        self.current.clone()
    }

    /// Start over with zeroed counters
    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window() {
        let mut tracker = MetricsTracker::new(Duration::from_secs(1));
        let start = Instant::now();

        for i in 0..30 {
            tracker.record_decode(Duration::from_millis(if i % 2 == 0 { 4 } else { 6 }));
        }
        tracker.record_drop();
        tracker.record_drops(0);
        tracker.set_buffer_health(50.0);

        assert!(tracker.tick_at(start).is_none());

        let metrics = tracker.tick_at(start + Duration::from_secs(2)).unwrap();
        assert!(metrics.fps > 14.0 && metrics.fps <= 15.0);
        assert!((metrics.processing_time_ms - 5.0).abs() < 1e-6);
        assert_eq!(metrics.dropped_frames, 1);
        assert_eq!(metrics.frames_decoded, 30);
        assert_eq!(metrics.buffer_health, 50.0);
    }

    #[test]
    fn test_paused_and_reset() {
        let mut tracker = MetricsTracker::default();
        tracker.record_decode(Duration::from_millis(3));
        tracker.record_drop();
        tracker.record_latency(Duration::from_millis(12));

        let paused = tracker.paused();
        assert_eq!(paused.fps, 0.0);
        assert_eq!(paused.dropped_frames, 1);
        assert!((paused.network_latency_ms - 12.0).abs() < 1e-6);

        tracker.reset();
        assert_eq!(tracker.snapshot().dropped_frames, 0);
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(CodecMetrics::default()).unwrap();
        assert!(json.get("bufferHealth").is_some());
        assert!(json.get("droppedFrames").is_some());
    }
}
