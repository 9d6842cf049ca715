//! Sliding window frame buffer
//!
//! Frames are keyed by index and held in a capacity-bounded window around the
//! playhead. The buffer never holds more than its capacity.

use crate::frame::DecodedFrame;
use crate::token::FrameToken;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Frames older than `current - SWEEP_WINDOW` are dropped by a sweep
pub const SWEEP_WINDOW: u64 = 5;

fn sweep_floor(current: u64) -> u64 {
    current.saturating_sub(SWEEP_WINDOW)
}

/// A decoded frame with its arrival time
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    /// When the frame entered the buffer
    pub timestamp: DateTime<Utc>,
    /// Frame image
    pub frame: DecodedFrame,
}

/// What happened to an inserted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored in a free slot
    Inserted,
    /// An older copy of the same index was replaced
    Replaced,
    /// Stored after evicting the given index
    Evicted(u64),
    /// Not stored, the buffer holds frames nearer the playhead
    Rejected,
}

impl InsertOutcome {
    /// Whether the frame is now in the buffer
    pub fn is_stored(&self) -> bool {
        !matches!(self, InsertOutcome::Rejected)
    }
}

/// Capacity-bounded frame buffer
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: BTreeMap<u64, BufferedFrame>,
    capacity: usize,
}

impl FrameBuffer {
    /// Buffer holding at most `capacity` frames (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Store `frame` at `index` with the playhead at `current`
    ///
    /// At capacity the buffer first sweeps stale frames, then evicts an
    /// already played frame, then the frame farthest ahead when `index` is
    /// nearer the playhead. Otherwise the new frame is rejected.
    pub fn insert(&mut self, index: u64, frame: DecodedFrame, current: u64) -> InsertOutcome {
        let entry = BufferedFrame {
            timestamp: Utc::now(),
            frame,
        };

        if let Some(slot) = self.frames.get_mut(&index) {
            *slot = entry;
            return InsertOutcome::Replaced;
        }
        if self.frames.len() >= self.capacity {
            self.sweep(current);
        }
        if self.frames.len() < self.capacity {
            self.frames.insert(index, entry);
            return InsertOutcome::Inserted;
        }

        match self.victim(index, current) {
            Some(victim) => {
                self.frames.remove(&victim);
                self.frames.insert(index, entry);
                tracing::trace!(frame = index, evicted = victim, "Buffer full, evicted frame");
                InsertOutcome::Evicted(victim)
            }
            None => InsertOutcome::Rejected,
        }
    }

    /// Whether [`Self::insert`] would store `index` with the playhead at `current`
    pub fn accepts(&self, index: u64, current: u64) -> bool {
        if self.frames.contains_key(&index) || self.frames.len() < self.capacity {
            return true;
        }
        let floor = sweep_floor(current);
        if self.frames.range(..floor).next().is_some() {
            return true;
        }
        self.victim(index, current).is_some()
    }

    fn victim(&self, index: u64, current: u64) -> Option<u64> {
        let lowest = self.lowest_index()?;
        if lowest < current {
            return Some(lowest);
        }
        if index < current {
            return None;
        }
        let highest = self.highest_index()?;
        (index < highest).then_some(highest)
    }

    /// Drop frames older than `current - SWEEP_WINDOW`, returning how many
    pub fn sweep(&mut self, current: u64) -> usize {
        let floor = sweep_floor(current);
        let kept = self.frames.split_off(&floor);
        let removed = self.frames.len();
        self.frames = kept;
        removed
    }

    /// Change the capacity, evicting played frames then the farthest ahead
    pub fn set_capacity(&mut self, capacity: usize, current: u64) -> Vec<u64> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.frames.len() > self.capacity {
            let victim = match self.lowest_index() {
                Some(lowest) if lowest < current => lowest,
                _ => match self.highest_index() {
                    Some(highest) => highest,
                    None => break,
                },
            };
            self.frames.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    /// Frame at `index`
    pub fn get(&self, index: u64) -> Option<&BufferedFrame> {
        self.frames.get(&index)
    }

    /// Whether `index` is buffered
    pub fn contains(&self, index: u64) -> bool {
        self.frames.contains_key(&index)
    }

    /// Whether any frame after `index` is buffered
    pub fn has_after(&self, index: u64) -> bool {
        self.frames.range(index.saturating_add(1)..).next().is_some()
    }

    /// Number of buffered frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Maximum number of frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level in percent
    pub fn health(&self) -> f64 {
        self.frames.len() as f64 / self.capacity as f64 * 100.0
    }

    /// Lowest buffered index
    pub fn lowest_index(&self) -> Option<u64> {
        self.frames.keys().next().copied()
    }

    /// Highest buffered index
    pub fn highest_index(&self) -> Option<u64> {
        self.frames.keys().next_back().copied()
    }

    /// Buffered indices in ascending order
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.frames.keys().copied()
    }

    /// Drop every frame
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Raw tokens waiting to be decoded
///
/// Holds tokens for the current video that arrived before the frame buffer
/// had room for them.
#[derive(Debug, Clone)]
pub struct TokenCache {
    tokens: BTreeMap<u64, FrameToken>,
    capacity: usize,
}

impl TokenCache {
    /// Cache holding at most `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Store a token; when full, only tokens nearer than the farthest one are kept
    pub fn insert(&mut self, token: FrameToken) -> bool {
        let index = token.frame_index;
        if self.tokens.len() >= self.capacity && !self.tokens.contains_key(&index) {
            match self.tokens.keys().next_back().copied() {
                Some(highest) if index < highest => {
                    self.tokens.remove(&highest);
                }
                _ => return false,
            }
        }
        self.tokens.insert(index, token);
        true
    }

    /// Token at `index`
    pub fn get(&self, index: u64) -> Option<&FrameToken> {
        self.tokens.get(&index)
    }

    /// Whether a token for `index` is cached
    pub fn contains(&self, index: u64) -> bool {
        self.tokens.contains_key(&index)
    }

    /// Remove and return the token at `index`
    pub fn take(&mut self, index: u64) -> Option<FrameToken> {
        self.tokens.remove(&index)
    }

    /// Up to `limit` tokens at or after `from`, ascending
    pub fn upcoming(&self, from: u64, limit: usize) -> Vec<FrameToken> {
        self.tokens
            .range(from..)
            .take(limit)
            .map(|(_, token)| token.clone())
            .collect()
    }

    /// Whether any token after `index` is cached
    pub fn has_after(&self, index: u64) -> bool {
        self.tokens.range(index.saturating_add(1)..).next().is_some()
    }

    /// Highest cached index
    pub fn highest_index(&self) -> Option<u64> {
        self.tokens.keys().next_back().copied()
    }

    /// Drop tokens older than `current - SWEEP_WINDOW`
    pub fn sweep(&mut self, current: u64) -> usize {
        let kept = self.tokens.split_off(&sweep_floor(current));
        let removed = self.tokens.len();
        self.tokens = kept;
        removed
    }

    /// Number of cached tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Drop every token
    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TOKEN_LEN;

    fn frame() -> DecodedFrame {
        DecodedFrame::from_rgb8(1, 1, vec![0u8; 3]).unwrap()
    }

    fn token(index: u64) -> FrameToken {
        FrameToken::new(index, vec![0.0; TOKEN_LEN]).unwrap()
    }

    #[test]
    fn test_insert_until_full() {
        let mut buffer = FrameBuffer::new(3);
        for i in 0..3 {
            assert_eq!(buffer.insert(i, frame(), 0), InsertOutcome::Inserted);
        }
        assert_eq!(buffer.insert(1, frame(), 0), InsertOutcome::Replaced);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.health(), 100.0);

        // all frames are ahead of the playhead and nearer than 3
        assert!(!buffer.accepts(3, 0));
        assert_eq!(buffer.insert(3, frame(), 0), InsertOutcome::Rejected);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_eviction_prefers_played_frames() {
        let mut buffer = FrameBuffer::new(3);
        for i in 10..13 {
            buffer.insert(i, frame(), 10);
        }
        assert_eq!(buffer.insert(13, frame(), 11), InsertOutcome::Evicted(10));
        assert_eq!(buffer.indices().collect::<Vec<_>>(), vec![11, 12, 13]);
    }

    #[test]
    fn test_eviction_of_farthest_frame() {
        let mut buffer = FrameBuffer::new(3);
        for i in [20, 30, 40] {
            buffer.insert(i, frame(), 20);
        }
        assert!(buffer.accepts(25, 20));
        assert_eq!(buffer.insert(25, frame(), 20), InsertOutcome::Evicted(40));
        assert_eq!(buffer.insert(19, frame(), 20), InsertOutcome::Rejected);
    }

    #[test]
    fn test_sweep() {
        let mut buffer = FrameBuffer::new(10);
        for i in 0..10 {
            buffer.insert(i, frame(), 0);
        }
        assert_eq!(buffer.sweep(3), 0);
        assert_eq!(buffer.sweep(8), 3);
        assert_eq!(buffer.lowest_index(), Some(3));
        assert_eq!(buffer.highest_index(), Some(9));
        assert!(buffer.has_after(8));
        assert!(!buffer.has_after(9));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut buffer = FrameBuffer::new(30);
        let mut current = 0;
        for step in 0..500u64 {
            let index = (step * 7919) % 97;
            buffer.insert(index, frame(), current);
            assert!(buffer.len() <= buffer.capacity());
            if step % 3 == 0 {
                current += 1;
            }
        }
    }

    #[test]
    fn test_shrinking_capacity() {
        let mut buffer = FrameBuffer::new(20);
        for i in 0..20 {
            buffer.insert(i, frame(), 5);
        }
        let evicted = buffer.set_capacity(10, 5);
        assert_eq!(evicted, vec![0, 1, 2, 3, 4, 19, 18, 17, 16, 15]);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.capacity(), 10);
    }

    #[test]
    fn test_token_cache() {
        let mut cache = TokenCache::new(3);
        for i in [5, 6, 9] {
            assert!(cache.insert(token(i)));
        }
        assert!(!cache.insert(token(12)));
        assert!(cache.insert(token(7)));
        assert!(!cache.contains(9));

        let upcoming: Vec<u64> = cache.upcoming(6, 5).iter().map(|t| t.frame_index).collect();
        assert_eq!(upcoming, vec![6, 7]);

        assert_eq!(cache.sweep(12), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.highest_index(), Some(7));

        assert_eq!(cache.take(7).map(|t| t.frame_index), Some(7));
        assert!(cache.take(7).is_none());
        assert!(cache.is_empty());
    }
}
