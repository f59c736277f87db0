//! Reusable buffer pool for receive paths.
//!
//! Datagram receive loops need a scratch buffer per call; allocating one
//! per packet churns the allocator at audio frame rates. The pool
//! pre-allocates a fixed number of equally sized buffers behind a
//! lock-free queue and recycles them. An exhausted pool falls back to a
//! fresh allocation rather than blocking, so `acquire` never waits.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// A lock-free pool of pre-allocated, fixed-size byte buffers.
///
/// Cheap to clone; clones share the same storage. Returned buffers are
/// cleared and resized back to the pool's buffer size before reuse, so a
/// recycled buffer never leaks a previous frame's bytes.
pub struct BufferPool {
    pool: Arc<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `pool_size` buffers of `buffer_size` bytes each,
    /// all allocated up front.
    #[must_use]
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let pool = Arc::new(ArrayQueue::new(pool_size.max(1)));
        for _ in 0..pool_size {
            let _ = pool.push(vec![0u8; buffer_size]);
        }
        Self { pool, buffer_size }
    }

    /// Take a buffer from the pool, allocating a fresh one when the pool
    /// is empty.
    #[must_use]
    pub fn acquire(&self) -> Vec<u8> {
        self.pool
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer for reuse.
    ///
    /// The buffer is zeroed and restored to the pool's standard size; if
    /// the pool is already full it is dropped instead.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        let _ = self.pool.push(buffer);
    }

    /// Buffers currently available for [`BufferPool::acquire`].
    #[must_use]
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Maximum buffers the pool retains.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Size in bytes of every pooled buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            buffer_size: self.buffer_size,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_round_trip() {
        let pool = BufferPool::new(1024, 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.capacity(), 4);

        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 1024);
        assert_eq!(pool.available(), 3);

        pool.release(buffer);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhaustion_falls_back_to_allocation() {
        let pool = BufferPool::new(256, 1);
        let _held = pool.acquire();
        assert_eq!(pool.available(), 0);

        // Empty pool still serves a correctly sized buffer.
        let extra = pool.acquire();
        assert_eq!(extra.len(), 256);
    }

    #[test]
    fn test_release_clears_and_resizes() {
        let pool = BufferPool::new(64, 2);
        let mut buffer = pool.acquire();
        buffer[0] = 0xFF;
        buffer.resize(128, 0xAA);
        pool.release(buffer);

        let recycled = pool.acquire();
        assert_eq!(recycled.len(), 64);
        assert!(recycled.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_release_beyond_capacity_drops() {
        let pool = BufferPool::new(64, 2);
        pool.release(vec![0u8; 64]);
        assert_eq!(pool.available(), 2);
        pool.release(vec![0u8; 64]);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_clones_share_storage() {
        let a = BufferPool::new(64, 2);
        let b = a.clone();
        let buffer = a.acquire();
        assert_eq!(b.available(), 1);
        b.release(buffer);
        assert_eq!(a.available(), 2);
    }

    #[test]
    fn test_concurrent_churn() {
        let pool = Arc::new(BufferPool::new(512, 32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let buffer = pool.acquire();
                    assert_eq!(buffer.len(), 512);
                    pool.release(buffer);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 32);
    }
}
