//! Background token fetching

use crate::api::{TokenBatch, VideoApi};
use crate::config::PrefetchConfig;
use async_trait::async_trait;
use nvc_core::{NvcError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Receiver of prefetched token batches
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Whether `tokens` more tokens fit without evicting anything
    fn has_room(&self, tokens: usize) -> bool;

    /// Whether playback still wants tokens for this video
    fn is_active(&self) -> bool;

    /// Hand over a fetched batch
    async fn deliver(&self, batch: TokenBatch);

    /// A fetch failed and the loop is stopping
    fn on_error(&self, error: &NvcError);
}

/// Fetches consecutive token ranges of one video
#[derive(Debug)]
pub struct Prefetcher {
    api: Arc<VideoApi>,
    video_id: u64,
    next_start: u64,
    total_frames: Option<u64>,
    config: PrefetchConfig,
}

impl Prefetcher {
    /// Prefetcher whose first request starts at `start`
    pub fn new(api: Arc<VideoApi>, video_id: u64, start: u64, config: PrefetchConfig) -> Self {
        Self {
            api,
            video_id,
            next_start: start,
            total_frames: None,
            config,
        }
    }

    /// Learn the video length ahead of the first fetch
    pub fn with_total_frames(mut self, total_frames: Option<u64>) -> Self {
        self.total_frames = total_frames;
        self
    }

    /// Video being fetched
    pub fn video_id(&self) -> u64 {
        self.video_id
    }

    /// First frame of the next request
    pub fn next_start(&self) -> u64 {
        self.next_start
    }

    /// Video length, once known
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    /// Whether every frame has been requested
    pub fn finished(&self) -> bool {
        matches!(self.total_frames, Some(total) if self.next_start >= total)
    }

    /// Fetch the next range, or `None` once the video is exhausted
    pub async fn next_chunk(&mut self) -> Result<Option<TokenBatch>> {
        if self.finished() {
            return Ok(None);
        }

        let start = self.next_start;
        let mut end = start + self.config.chunk_size - 1;
        if let Some(total) = self.total_frames {
            end = end.min(total.saturating_sub(1));
        }

        let batch = self.api.tokens(self.video_id, start, end).await?;
        if batch.metadata.total_frames > 0 {
            self.total_frames = Some(batch.metadata.total_frames);
        }
        self.next_start = batch.resume_from(start, end);
        debug!(
            video_id = self.video_id,
            start = start,
            end = end,
            received = batch.tokens.len(),
            "Fetched token chunk"
        );
        Ok(Some(batch))
    }

    /// Keep fetching into `sink` until shutdown, the end of the video or an error
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, sink: Arc<dyn TokenSink>) {
        info!(
            video_id = self.video_id,
            start = self.next_start,
            "Prefetch loop started"
        );
        loop {
            tokio::select! {
                _ = sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if !sink.is_active() {
                continue;
            }
            if !sink.has_room(self.config.chunk_size as usize) {
                debug!(video_id = self.video_id, "Token cache full, skipping fetch");
                continue;
            }

            match self.next_chunk().await {
                Ok(Some(batch)) => sink.deliver(batch).await,
                Ok(None) => {
                    debug!(video_id = self.video_id, "All tokens fetched");
                    break;
                }
                Err(e) => {
                    warn!(video_id = self.video_id, "Token prefetch failed: {}", e);
                    sink.on_error(&e);
                    break;
                }
            }
        }
        info!(video_id = self.video_id, "Prefetch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn prefetcher(total: Option<u64>) -> Prefetcher {
        let api = Arc::new(VideoApi::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap());
        Prefetcher::new(api, 3, 90, PrefetchConfig::default()).with_total_frames(total)
    }

    #[test]
    fn test_finished() {
        assert!(!prefetcher(None).finished());
        assert!(!prefetcher(Some(91)).finished());
        assert!(prefetcher(Some(90)).finished());
    }

    #[tokio::test]
    async fn test_exhausted_video_yields_none() {
        let mut prefetcher = prefetcher(Some(50));
        assert!(prefetcher.next_chunk().await.unwrap().is_none());
        assert_eq!(prefetcher.next_start(), 90);
    }
}
