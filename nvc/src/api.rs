//! HTTP client for the video API
//!
//! Endpoints, relative to the configured base URL:
//!
//! * `GET /videos` → `{"videos": [{"id", "name", "frame_count"}]}`
//! * `GET /videos/:id/metadata` → `{"frame_count", "fps", ...}`
//! * `GET /videos/:id/reference` → `{"reference_features", "reference_token"}`
//! * `GET /videos/:id/frames/:n` → `{"frame": "<base64 png>"}`
//! * `GET /videos/:id/tokens?start=&end=` → a [`TokenBatch`], `end` inclusive

use nvc_core::{NvcError, Result};
use nvc_media::{DecodedFrame, FrameToken, ReferencePayload};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Entry of the video list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Video identifier
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Number of frames
    #[serde(default)]
    pub frame_count: u64,
}

#[derive(Debug, Deserialize)]
struct VideoList {
    videos: Vec<VideoInfo>,
}

/// Per-video metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Number of frames
    pub frame_count: u64,
    /// Native frame rate, when known
    #[serde(default)]
    pub fps: Option<f64>,
    /// Any other fields the server sends
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Progress information attached to a token batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBatchMetadata {
    /// Frames in the video
    #[serde(default)]
    pub total_frames: u64,
    /// Frames the server has tokens for
    #[serde(default)]
    pub processed_frames: u64,
}

/// Response of the token range endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBatch {
    /// Video the tokens belong to
    #[serde(default)]
    pub video_id: u64,
    /// Tokens keyed by frame index
    #[serde(default)]
    pub tokens: BTreeMap<String, Value>,
    /// Progress information
    #[serde(default)]
    pub metadata: TokenBatchMetadata,
}

impl TokenBatch {
    /// Parsed tokens in frame order; malformed entries are skipped
    pub fn frame_tokens(&self) -> Vec<FrameToken> {
        let mut tokens: Vec<FrameToken> = self
            .tokens
            .iter()
            .filter_map(|(key, value)| {
                let index = match key.parse::<u64>() {
                    Ok(index) => index,
                    Err(_) => {
                        warn!(key = %key, "Skipping token with non-numeric frame index");
                        return None;
                    }
                };
                match FrameToken::from_json(index, value) {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!(frame = index, "Skipping invalid token: {}", e);
                        None
                    }
                }
            })
            .collect();
        tokens.sort_by_key(|t| t.frame_index);
        tokens
    }

    /// Whether the server has tokens for the whole video
    pub fn is_complete(&self) -> bool {
        self.metadata.total_frames > 0
            && self.metadata.processed_frames >= self.metadata.total_frames
    }

    /// First frame to request after fetching `start..=end`
    ///
    /// While the server is still encoding the video, frames past
    /// `processed_frames` were not returned and are asked for again.
    pub fn resume_from(&self, start: u64, end: u64) -> u64 {
        if self.metadata.total_frames == 0 || self.is_complete() {
            end + 1
        } else {
            self.metadata.processed_frames.clamp(start, end + 1)
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrameResponse {
    frame: String,
}

/// Typed client for the video API
#[derive(Debug)]
pub struct VideoApi {
    base_url: String,
    http: Client,
    last_latency: Mutex<Option<Duration>>,
}

impl VideoApi {
    /// Client for `base_url`, e.g. `http://127.0.0.1:8000`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NvcError::Initialization {
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            last_latency: Mutex::new(None),
        })
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Round trip of the most recent successful request
    pub fn last_latency(&self) -> Option<Duration> {
        *self.last_latency.lock()
    }

    /// `GET /videos`
    pub async fn list_videos(&self) -> Result<Vec<VideoInfo>> {
        let list: VideoList = self.get_json("/videos").await?;
        Ok(list.videos)
    }

    /// `GET /videos/:id/metadata`
    pub async fn metadata(&self, video_id: u64) -> Result<VideoMetadata> {
        self.get_json(&format!("/videos/{}/metadata", video_id))
            .await
    }

    /// `GET /videos/:id/reference`
    pub async fn reference(&self, video_id: u64) -> Result<ReferencePayload> {
        self.get_json(&format!("/videos/{}/reference", video_id))
            .await
    }

    /// `GET /videos/:id/frames/:n`; `None` when the frame does not exist
    pub async fn frame(&self, video_id: u64, frame_index: u64) -> Result<Option<DecodedFrame>> {
        let path = format!("/videos/{}/frames/{}", video_id, frame_index);
        let response = match self.get_json::<FrameResponse>(&path).await {
            Ok(response) => response,
            Err(NvcError::Http {
                status: Some(404), ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let frame = DecodedFrame::from_encoded(&response.frame)?;
        Ok(Some(frame))
    }

    /// `GET /videos/:id/tokens?start=&end=`, both ends inclusive
    pub async fn tokens(&self, video_id: u64, start: u64, end: u64) -> Result<TokenBatch> {
        self.get_json(&format!(
            "/videos/{}/tokens?start={}&end={}",
            video_id, start, end
        ))
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let started = Instant::now();
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| http_error(&url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %url, status = status.as_u16(), "Request failed");
            return Err(NvcError::Http {
                url,
                status: Some(status.as_u16()),
                reason: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            });
        }

        let parsed = response
            .json::<T>()
            .await
            .map_err(|e| http_error(&url, e))?;
        let elapsed = started.elapsed();
        *self.last_latency.lock() = Some(elapsed);
        debug!(url = %url, latency_ms = elapsed.as_millis() as u64, "Request completed");
        Ok(parsed)
    }
}

fn http_error(url: &str, error: reqwest::Error) -> NvcError {
    if error.is_decode() {
        return NvcError::InvalidData {
            reason: format!("unexpected response from {}: {}", url, error),
        };
    }
    NvcError::Http {
        url: url.to_string(),
        status: error.status().map(|s| s.as_u16()),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_batch_parsing() {
        let batch: TokenBatch = serde_json::from_value(json!({
            "videoId": 4,
            "tokens": {
                "11": [[vec![0.5f32; 32]]],
                "10": [vec![0.1f32; 32]],
                "12": [1.0, 2.0],
                "x": vec![0.0f32; 32]
            },
            "metadata": { "totalFrames": 120, "processedFrames": 120 }
        }))
        .unwrap();

        let tokens = batch.frame_tokens();
        assert_eq!(batch.video_id, 4);
        assert_eq!(
            tokens.iter().map(|t| t.frame_index).collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert!(batch.is_complete());
        assert_eq!(batch.resume_from(10, 19), 20);
    }

    #[test]
    fn test_partially_encoded_video_is_fetched_again() {
        let batch = |processed: u64| TokenBatch {
            video_id: 1,
            tokens: BTreeMap::new(),
            metadata: TokenBatchMetadata {
                total_frames: 100,
                processed_frames: processed,
            },
        };

        assert!(!batch(25).is_complete());
        assert_eq!(batch(25).resume_from(20, 29), 25);
        assert_eq!(batch(10).resume_from(20, 29), 20);
        assert_eq!(batch(60).resume_from(20, 29), 30);

        let unknown = TokenBatch {
            metadata: TokenBatchMetadata::default(),
            ..batch(0)
        };
        assert_eq!(unknown.resume_from(20, 29), 30);
    }

    #[test]
    fn test_metadata_keeps_extra_fields() {
        let metadata: VideoMetadata = serde_json::from_value(json!({
            "frame_count": 300,
            "fps": 25.0,
            "width": 256
        }))
        .unwrap();
        assert_eq!(metadata.frame_count, 300);
        assert_eq!(metadata.fps, Some(25.0));
        assert_eq!(metadata.extra["width"], 256);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let api = VideoApi::new("http://127.0.0.1:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://127.0.0.1:8000");
        assert_eq!(api.url("/videos"), "http://127.0.0.1:8000/videos");
        assert!(api.last_latency().is_none());
    }
}
