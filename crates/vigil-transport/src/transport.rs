//! Transport trait abstraction.
//!
//! A transport is a bidirectional, message-oriented channel to one peer.
//! Frames are UTF-8 JSON envelope strings; ordering and reliability are
//! properties of the concrete implementation (the WebSocket transport is
//! ordered and reliable, the UDP media transport is neither).

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concrete channel kind behind a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Ordered, framed, always present.
    Reliable,
    /// Low-latency datagram channel, negotiated.
    Media,
}

/// Counter snapshot for one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Send failures.
    pub send_errors: u64,
    /// Receive failures.
    pub recv_errors: u64,
}

/// Shared atomic counters backing [`TransportStats`].
#[derive(Debug, Default)]
pub struct StatCounters {
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) send_errors: AtomicU64,
    pub(crate) recv_errors: AtomicU64,
}

impl StatCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// A bidirectional frame channel to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    ///
    /// # Errors
    /// Returns [`crate::TransportError::Closed`] after close, or the
    /// underlying channel error.
    async fn send(&self, frame: &str) -> Result<()>;

    /// Receive the next frame.
    ///
    /// # Errors
    /// Returns [`crate::TransportError::Closed`] when the peer closed the
    /// channel.
    async fn recv(&self) -> Result<String>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;

    /// Whether the channel is closed.
    fn is_closed(&self) -> bool;

    /// Concrete channel kind.
    fn kind(&self) -> ChannelKind;

    /// Counter snapshot.
    fn stats(&self) -> TransportStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_counters() {
        let counters = StatCounters::default();
        counters.record_send(10);
        counters.record_send(5);
        counters.record_recv(7);
        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_received, 7);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.send_errors, 0);
    }
}
