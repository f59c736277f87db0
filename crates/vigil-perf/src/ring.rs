//! Bounded per-call chunk buffer.
//!
//! A fixed-capacity ring over incoming audio chunks. Overruns displace
//! the oldest chunk and increment a counter rather than blocking the
//! producer; the pipeline applies backpressure separately when
//! utilization crosses the watermark.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use vigil_core::types::AudioChunk;

/// Fixed-capacity ring buffer of audio chunks.
///
/// Lock-free; safe to share via `Arc`. One producer (the transport side)
/// and one consumer (the call's pipeline worker) is the intended shape,
/// but any number of either is safe.
pub struct ChunkRing {
    queue: ArrayQueue<AudioChunk>,
    overruns: AtomicU64,
}

impl ChunkRing {
    /// Create a ring with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overruns: AtomicU64::new(0),
        }
    }

    /// Push a chunk, displacing the oldest on overrun.
    ///
    /// Returns the displaced chunk when the ring was full.
    pub fn push(&self, chunk: AudioChunk) -> Option<AudioChunk> {
        let displaced = self.queue.force_push(chunk);
        if displaced.is_some() {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    /// Pop the oldest chunk.
    pub fn pop(&self) -> Option<AudioChunk> {
        self.queue.pop()
    }

    /// Drop buffered chunks older than `horizon_ms` before `now`.
    ///
    /// Returns the number dropped. Chunks are timestamp-ordered by
    /// arrival, so draining stops at the first fresh chunk.
    pub fn drop_stale(&self, now: u64, horizon_ms: u64) -> usize {
        let mut dropped = 0;
        while let Some(chunk) = self.queue.pop() {
            if now.saturating_sub(chunk.timestamp) > horizon_ms {
                dropped += 1;
                continue;
            }
            // Fresh chunk: put it back and stop. force_push keeps it even
            // under a concurrent producer burst.
            self.queue.force_push(chunk);
            break;
        }
        dropped
    }

    /// Number of buffered chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Fill ratio in [0, 1].
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.queue.len() as f64 / self.queue.capacity() as f64
    }

    /// Overruns since creation.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::AudioEncoding;

    fn chunk(seq: u64, timestamp: u64) -> AudioChunk {
        AudioChunk {
            id: format!("chunk-{seq}"),
            call_id: "call-1".into(),
            timestamp,
            sequence_number: seq,
            payload: vec![0; 4],
            sample_rate: 16_000,
            channel_count: 1,
            encoding: AudioEncoding::Pcm,
        }
    }

    #[test]
    fn test_push_pop_fifo() {
        let ring = ChunkRing::new(4);
        for seq in 0..3 {
            assert!(ring.push(chunk(seq, seq)).is_none());
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop().unwrap().sequence_number, 0);
        assert_eq!(ring.pop().unwrap().sequence_number, 1);
    }

    #[test]
    fn test_overrun_displaces_oldest() {
        let ring = ChunkRing::new(2);
        ring.push(chunk(0, 0));
        ring.push(chunk(1, 1));
        let displaced = ring.push(chunk(2, 2));
        assert_eq!(displaced.unwrap().sequence_number, 0);
        assert_eq!(ring.overruns(), 1);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop().unwrap().sequence_number, 1);
    }

    #[test]
    fn test_utilization() {
        let ring = ChunkRing::new(4);
        assert_eq!(ring.utilization(), 0.0);
        ring.push(chunk(0, 0));
        ring.push(chunk(1, 1));
        assert!((ring.utilization() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drop_stale() {
        let ring = ChunkRing::new(8);
        // Three stale, one fresh.
        for seq in 0..3 {
            ring.push(chunk(seq, 100));
        }
        ring.push(chunk(3, 10_000));
        let dropped = ring.drop_stale(10_050, 1_000);
        assert_eq!(dropped, 3);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop().unwrap().sequence_number, 3);
    }

    #[test]
    fn test_bounded_memory_invariant() {
        let ring = ChunkRing::new(8);
        for seq in 0..100 {
            ring.push(chunk(seq, seq));
            assert!(ring.len() <= 8);
        }
        assert_eq!(ring.overruns(), 92);
    }
}
