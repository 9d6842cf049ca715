//! Playback state, frame pacing and media clock synchronisation

use crate::config::SyncConfig;
use nvc_core::{NvcError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing is playing
    Stopped,
    /// Frames are being presented
    Playing,
    /// Playback is paused and can be resumed
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

/// State of the selected video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    /// Selected video
    pub video_id: u64,
    /// Frame at the playhead
    pub current_frame: u64,
    /// Frame the reference data was taken from
    pub reference_frame: u64,
    /// Whether frames are being presented
    pub is_playing: bool,
    /// Frame buffer capacity
    pub buffer_size: usize,
    /// Nominal frame rate
    pub fps: u32,
}

/// Clock the video is kept in step with, usually an audio track
pub trait MediaClock: Send + Sync + Debug {
    /// Current position
    fn position(&self) -> Duration;
    /// Start or continue advancing
    fn play(&self);
    /// Stop advancing
    fn pause(&self);
    /// Jump to `position`
    fn seek(&self, position: Duration);
    /// Whether the clock is advancing
    fn is_running(&self) -> bool;
}

#[derive(Debug)]
struct WallClockState {
    base: Duration,
    started: Option<Instant>,
}

/// [`MediaClock`] driven by the monotonic system clock
#[derive(Debug)]
pub struct WallClock {
    state: Mutex<WallClockState>,
}

impl WallClock {
    /// Stopped clock at zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WallClockState {
                base: Duration::ZERO,
                started: None,
            }),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock for WallClock {
    fn position(&self) -> Duration {
        let state = self.state.lock();
        state.base + state.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn play(&self) {
        let mut state = self.state.lock();
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.started.take() {
            state.base += started.elapsed();
        }
    }

    fn seek(&self, position: Duration) {
        let mut state = self.state.lock();
        state.base = position;
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().started.is_some()
    }
}

/// Outcome of a synchronisation check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAction {
    /// Drift within tolerance; nominal rate restored
    InSync,
    /// Presentation rate changed
    AdjustRate {
        /// New presentation rate
        target_fps: f64,
    },
    /// Playhead jumped forward to catch up with the clock
    Seek {
        /// Frame before the jump
        from: u64,
        /// Frame after the jump
        to: u64,
    },
}

/// Tracks the selected video and paces its frames
#[derive(Debug)]
pub struct PlaybackController {
    fps: u32,
    buffer_size: usize,
    sync: SyncConfig,
    clock: Arc<dyn MediaClock>,
    state: PlaybackState,
    video: Option<VideoState>,
    target_fps: f64,
}

impl PlaybackController {
    /// Stopped controller
    pub fn new(fps: u32, buffer_size: usize, sync: SyncConfig, clock: Arc<dyn MediaClock>) -> Self {
        let fps = fps.max(1);
        Self {
            fps,
            buffer_size,
            sync,
            clock,
            state: PlaybackState::Stopped,
            video: None,
            target_fps: fps as f64,
        }
    }

    /// Begin playing `video_id` from frame zero
    pub fn start(&mut self, video_id: u64) -> VideoState {
        let video = VideoState {
            video_id,
            current_frame: 0,
            reference_frame: 0,
            is_playing: true,
            buffer_size: self.buffer_size,
            fps: self.fps,
        };
        self.video = Some(video.clone());
        self.state = PlaybackState::Playing;
        self.target_fps = self.fps as f64;
        self.clock.seek(Duration::ZERO);
        self.clock.play();
        info!(video_id = video_id, fps = self.fps, "Playback started");
        video
    }

    /// Change the buffer size reported in [`VideoState`]
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
        if let Some(video) = self.video.as_mut() {
            video.buffer_size = buffer_size;
        }
    }

    /// Whether `video_id` is paused and can resume without refetching
    pub fn can_resume(&self, video_id: u64) -> bool {
        self.state == PlaybackState::Paused
            && self.video.as_ref().map(|v| v.video_id) == Some(video_id)
    }

    /// Pause, returning the frame at the playhead
    pub fn pause(&mut self) -> Result<u64> {
        if self.state != PlaybackState::Playing {
            return Err(self.invalid_state(PlaybackState::Playing));
        }
        let frame = self.set_playing(false)?;
        self.state = PlaybackState::Paused;
        self.clock.pause();
        debug!(frame = frame, "Playback paused");
        Ok(frame)
    }

    /// Resume a paused video, returning the frame at the playhead
    pub fn resume(&mut self) -> Result<u64> {
        if self.state != PlaybackState::Paused {
            return Err(self.invalid_state(PlaybackState::Paused));
        }
        let frame = self.set_playing(true)?;
        self.state = PlaybackState::Playing;
        self.target_fps = self.fps as f64;
        self.clock.play();
        debug!(frame = frame, "Playback resumed");
        Ok(frame)
    }

    /// Stop and forget the video, returning the last frame if one was selected
    pub fn stop(&mut self) -> Option<u64> {
        let last = self.video.take().map(|v| v.current_frame);
        self.state = PlaybackState::Stopped;
        self.target_fps = self.fps as f64;
        self.clock.pause();
        self.clock.seek(Duration::ZERO);
        if let Some(frame) = last {
            debug!(frame = frame, "Playback stopped");
        }
        last
    }

    /// Time until the next frame at the current target rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(0.001))
    }

    /// Move the playhead one frame forward while playing
    pub fn advance(&mut self) -> Option<u64> {
        if self.state != PlaybackState::Playing {
            return None;
        }
        let video = self.video.as_mut()?;
        video.current_frame += 1;
        Some(video.current_frame)
    }

    /// Selected video
    pub fn video_id(&self) -> Option<u64> {
        self.video.as_ref().map(|v| v.video_id)
    }

    /// Frame at the playhead
    pub fn current_frame(&self) -> Option<u64> {
        self.video.as_ref().map(|v| v.current_frame)
    }

    /// Move the playhead to `frame` and the clock with it
    pub fn seek(&mut self, frame: u64) -> Result<u64> {
        let fps = self.fps;
        let video = self.video.as_mut().ok_or(NvcError::NoVideoSelected)?;
        let from = video.current_frame;
        video.current_frame = frame;
        self.clock
            .seek(Duration::from_secs_f64(frame as f64 / fps as f64));
        debug!(from = from, to = frame, "Seeked");
        Ok(from)
    }

    /// Compare the playhead with the media clock and correct drift
    ///
    /// A playhead lagging by more than the seek threshold jumps forward. The
    /// playhead never moves backward here; a playhead that runs ahead is only
    /// slowed down.
    pub fn check_sync(&mut self) -> SyncAction {
        if self.state != PlaybackState::Playing {
            return SyncAction::InSync;
        }
        let fps = self.fps as f64;
        let current = match self.current_frame() {
            Some(frame) => frame,
            None => return SyncAction::InSync,
        };

        let clock_secs = self.clock.position().as_secs_f64();
        let target_frame = (clock_secs * fps).floor() as u64;
        let frame_drift = target_frame as f64 - current as f64;
        let time_drift = frame_drift / fps;

        if time_drift.abs() <= self.sync.max_drift_secs {
            self.target_fps = fps;
            return SyncAction::InSync;
        }

        if frame_drift > self.sync.seek_threshold_frames as f64 {
            if let Some(video) = self.video.as_mut() {
                video.current_frame = target_frame;
            }
            self.target_fps = fps;
            debug!(
                from = current,
                to = target_frame,
                drift_secs = time_drift,
                "Playhead behind clock, seeking forward"
            );
            return SyncAction::Seek {
                from: current,
                to: target_frame,
            };
        }

        let factor = if time_drift > 0.0 {
            self.sync.speed_up
        } else {
            self.sync.slow_down
        };
        self.target_fps = fps * factor;
        debug!(
            drift_secs = time_drift,
            target_fps = self.target_fps,
            "Adjusting presentation rate"
        );
        SyncAction::AdjustRate {
            target_fps: self.target_fps,
        }
    }

    /// Current presentation rate
    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Playback state
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Snapshot of the selected video
    pub fn video_state(&self) -> Option<VideoState> {
        self.video.clone()
    }

    /// Whether frames are being presented
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    fn set_playing(&mut self, playing: bool) -> Result<u64> {
        let video = self.video.as_mut().ok_or(NvcError::NoVideoSelected)?;
        video.is_playing = playing;
        Ok(video.current_frame)
    }

    fn invalid_state(&self, expected: PlaybackState) -> NvcError {
        NvcError::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct ManualClock {
        position: Mutex<Duration>,
        running: Mutex<bool>,
    }

    impl ManualClock {
        fn set(&self, secs: f64) {
            *self.position.lock() = Duration::from_secs_f64(secs);
        }
    }

    impl MediaClock for ManualClock {
        fn position(&self) -> Duration {
            *self.position.lock()
        }
        fn play(&self) {
            *self.running.lock() = true;
        }
        fn pause(&self) {
            *self.running.lock() = false;
        }
        fn seek(&self, position: Duration) {
            *self.position.lock() = position;
        }
        fn is_running(&self) -> bool {
            *self.running.lock()
        }
    }

    fn controller() -> (PlaybackController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let controller = PlaybackController::new(10, 30, SyncConfig::default(), clock.clone());
        (controller, clock)
    }

    #[test]
    fn test_state_transitions() {
        let (mut playback, clock) = controller();
        assert_eq!(playback.state(), PlaybackState::Stopped);
        assert!(playback.pause().is_err());

        let video = playback.start(7);
        assert_eq!(video.video_id, 7);
        assert!(clock.is_running());

        playback.advance();
        playback.advance();
        assert_eq!(playback.pause().unwrap(), 2);
        assert!(!clock.is_running());
        assert!(playback.can_resume(7));
        assert!(!playback.can_resume(8));
        assert!(playback.advance().is_none());
        assert!(!playback.video_state().unwrap().is_playing);

        assert_eq!(playback.resume().unwrap(), 2);
        assert!(matches!(
            playback.resume(),
            Err(NvcError::InvalidState { .. })
        ));

        assert_eq!(playback.stop(), Some(2));
        assert!(playback.video_state().is_none());
        assert!(matches!(playback.seek(3), Err(NvcError::NoVideoSelected)));
    }

    #[test]
    fn test_sync_adjusts_rate() {
        let (mut playback, clock) = controller();
        playback.start(1);
        for _ in 0..10 {
            playback.advance();
        }

        clock.set(1.0);
        assert_eq!(playback.check_sync(), SyncAction::InSync);
        assert_eq!(playback.frame_interval(), Duration::from_millis(100));

        // Clock two frames ahead of the playhead
        clock.set(1.25);
        match playback.check_sync() {
            SyncAction::AdjustRate { target_fps } => assert!((target_fps - 11.0).abs() < 1e-9),
            other => panic!("unexpected action {:?}", other),
        }

        // Playhead three frames ahead of the clock
        clock.set(0.75);
        match playback.check_sync() {
            SyncAction::AdjustRate { target_fps } => assert!((target_fps - 9.0).abs() < 1e-9),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_sync_only_seeks_forward() {
        let (mut playback, clock) = controller();
        playback.start(1);

        clock.set(2.05);
        assert_eq!(playback.check_sync(), SyncAction::Seek { from: 0, to: 20 });
        assert_eq!(playback.current_frame(), Some(20));

        clock.set(0.5);
        assert!(matches!(
            playback.check_sync(),
            SyncAction::AdjustRate { .. }
        ));
        assert_eq!(playback.current_frame(), Some(20));
    }

    #[test]
    fn test_playhead_is_monotonic() {
        let (mut playback, clock) = controller();
        playback.start(1);

        let mut last = 0;
        for step in 0..200u64 {
            clock.set((step as f64 * 0.137) % 25.0);
            playback.check_sync();
            if let Some(frame) = playback.advance() {
                assert!(frame >= last);
                last = frame;
            }
        }
    }

    #[test]
    fn test_wall_clock() {
        let clock = WallClock::new();
        assert!(!clock.is_running());
        clock.seek(Duration::from_secs(3));
        assert_eq!(clock.position(), Duration::from_secs(3));
        clock.play();
        assert!(clock.position() >= Duration::from_secs(3));
        clock.pause();
        let paused = clock.position();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.position(), paused);
    }
}
