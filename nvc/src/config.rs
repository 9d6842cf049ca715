//! Configuration types and defaults

use nvc_core::{duration_ms, MemoryLimits, NvcError, Result};
use nvc_media::{default_reference_shapes, DEFAULT_CHUNK_SIZE};
use nvc_signaling::{IceServer, RetryPolicy, SessionConfig, DEFAULT_CONNECT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Background token fetching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Tokens requested per background fetch
    pub chunk_size: u64,
    /// Pause between background fetches
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Initial prefetch as a multiple of the buffer capacity
    pub prefetch_factor: f64,
    /// Raw tokens kept waiting for decode
    pub token_cache_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            interval: Duration::from_secs(1),
            prefetch_factor: 1.5,
            token_cache_capacity: 300,
        }
    }
}

/// Media clock synchronisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often drift is checked
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Drift in seconds tolerated before correcting
    pub max_drift_secs: f64,
    /// Frames behind the clock after which playback jumps ahead
    pub seek_threshold_frames: u64,
    /// Rate factor while video runs ahead of the clock
    pub slow_down: f64,
    /// Rate factor while video lags the clock
    pub speed_up: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_drift_secs: 0.1,
            seek_threshold_frames: 5,
            slow_down: 0.9,
            speed_up: 1.1,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Signaling WebSocket URL
    pub server_url: String,
    /// Base URL of the HTTP video API
    pub api_base_url: String,
    /// ICE servers announced to the server
    pub ice_servers: Vec<IceServer>,
    /// Playback frame rate
    pub fps: u32,
    /// Frame buffer capacity
    pub buffer_size: usize,
    /// Model location handed to the model loader
    pub model_path: Option<String>,
    /// Session handshake deadline
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// HTTP request deadline
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Reconnect policy
    pub retry: RetryPolicy,
    /// Background token fetching
    pub prefetch: PrefetchConfig,
    /// Media clock synchronisation
    pub sync: SyncConfig,
    /// Tensor memory limits
    pub memory: MemoryLimits,
    /// Tokens decoded per batch chunk
    pub batch_chunk_size: usize,
    /// Shapes of the reference feature maps
    pub reference_shapes: Vec<Vec<usize>>,
    /// How often metrics are recomputed
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws".to_string(),
            api_base_url: "http://127.0.0.1:8000".to_string(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            fps: 30,
            buffer_size: 60,
            model_path: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            prefetch: PrefetchConfig::default(),
            sync: SyncConfig::default(),
            memory: MemoryLimits::default(),
            batch_chunk_size: DEFAULT_CHUNK_SIZE,
            reference_shapes: default_reference_shapes(),
            metrics_interval: Duration::from_secs(1),
        }
    }
}

impl CodecConfig {
    /// Start building a configuration from the defaults
    pub fn builder() -> CodecConfigBuilder {
        CodecConfigBuilder::new()
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| NvcError::InvalidData {
            reason: format!("invalid configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(NvcError::MissingConfiguration {
                field: "server_url (ws:// or wss://)".to_string(),
            });
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(NvcError::MissingConfiguration {
                field: "api_base_url (http:// or https://)".to_string(),
            });
        }
        if self.fps == 0 {
            return Err(NvcError::InvalidData {
                reason: "fps must be positive".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(NvcError::InvalidData {
                reason: "buffer_size must be positive".to_string(),
            });
        }
        if self.prefetch.chunk_size == 0 || self.prefetch.prefetch_factor <= 0.0 {
            return Err(NvcError::InvalidData {
                reason: "prefetch chunk size and factor must be positive".to_string(),
            });
        }
        if self.prefetch.token_cache_capacity < self.prefetch_size() {
            return Err(NvcError::InvalidData {
                reason: format!(
                    "token cache capacity {} is smaller than the initial prefetch of {}",
                    self.prefetch.token_cache_capacity,
                    self.prefetch_size()
                ),
            });
        }
        if self.reference_shapes.len() != nvc_core::FEATURE_INPUT_COUNT {
            return Err(NvcError::InvalidData {
                reason: format!(
                    "expected {} reference shapes, got {}",
                    nvc_core::FEATURE_INPUT_COUNT,
                    self.reference_shapes.len()
                ),
            });
        }
        Ok(())
    }

    /// Tokens fetched before playback starts, `ceil(buffer_size * prefetch_factor)`
    pub fn prefetch_size(&self) -> usize {
        (self.buffer_size as f64 * self.prefetch.prefetch_factor).ceil() as usize
    }

    /// Nominal time between frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    /// Negotiation settings for a peer session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            fps: self.fps,
            ice_servers: self.ice_servers.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Fluent builder for [`CodecConfig`]
#[derive(Debug, Clone, Default)]
pub struct CodecConfigBuilder {
    config: CodecConfig,
}

impl CodecConfigBuilder {
    /// Builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signaling WebSocket URL
    pub fn server_url(mut self, url: &str) -> Self {
        self.config.server_url = url.to_string();
        self
    }

    /// Set the HTTP video API base URL
    pub fn api_base_url(mut self, url: &str) -> Self {
        self.config.api_base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Replace the ICE servers
    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    /// Set the playback frame rate
    pub fn fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    /// Set the frame buffer capacity
    pub fn buffer_size(mut self, frames: usize) -> Self {
        self.config.buffer_size = frames;
        self
    }

    /// Set the model location
    pub fn model_path(mut self, path: &str) -> Self {
        self.config.model_path = Some(path.to_string());
        self
    }

    /// Set the handshake deadline
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the HTTP request deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the reconnect policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set background fetching
    pub fn prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// Set clock synchronisation
    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    /// Set tensor memory limits
    pub fn memory(mut self, limits: MemoryLimits) -> Self {
        self.config.memory = limits;
        self
    }

    /// Set the batch chunk size
    pub fn batch_chunk_size(mut self, tokens: usize) -> Self {
        self.config.batch_chunk_size = tokens;
        self
    }

    /// Set the reference feature shapes
    pub fn reference_shapes(mut self, shapes: Vec<Vec<usize>>) -> Self {
        self.config.reference_shapes = shapes;
        self
    }

    /// Set the metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.config.metrics_interval = interval;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<CodecConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CodecConfig::default();
        assert_eq!(config.fps, 30);
        assert_eq!(config.buffer_size, 60);
        assert_eq!(config.prefetch_size(), 90);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.batch_chunk_size, 10);
        assert_eq!(config.sync.seek_threshold_frames, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CodecConfigBuilder::new()
            .server_url("wss://codec.example.com/ws")
            .api_base_url("https://codec.example.com/")
            .fps(24)
            .buffer_size(30)
            .model_path("models/decoder/model.json")
            .build()
            .unwrap();

        assert_eq!(config.api_base_url, "https://codec.example.com");
        assert_eq!(config.prefetch_size(), 45);
        assert_eq!(config.session_config().fps, 24);
        assert_eq!(config.frame_interval(), Duration::from_secs_f64(1.0 / 24.0));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(CodecConfigBuilder::new().fps(0).build().is_err());
        assert!(CodecConfigBuilder::new().buffer_size(0).build().is_err());
        assert!(CodecConfigBuilder::new()
            .server_url("http://wrong")
            .build()
            .is_err());
        assert!(CodecConfigBuilder::new()
            .buffer_size(500)
            .build()
            .is_err());
    }

    #[test]
    fn test_json_config() {
        let config = CodecConfig::from_json(
            r#"{
                "server_url": "ws://10.0.0.2:8000/ws",
                "fps": 25,
                "connect_timeout": 2500,
                "retry": { "max_attempts": 3 },
                "prefetch": { "chunk_size": 50 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.fps, 25);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.prefetch.chunk_size, 50);
        assert_eq!(config.prefetch.interval, Duration::from_secs(1));
        assert_eq!(config.buffer_size, 60);

        assert!(CodecConfig::from_json("{").is_err());
    }
}
