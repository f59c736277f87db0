//! Low-latency media transport over UDP.
//!
//! The media transport carries audio frames when a session has upgraded
//! to hybrid. It trades the reliable transport's ordering and delivery
//! guarantees for latency; the per-call pipeline tolerates loss and
//! reorders by sequence number.
//!
//! Negotiation follows the signaling flow: each side binds first, learns
//! its local address, exchanges addresses through the hub, then locks the
//! socket onto the peer with [`MediaTransport::connect_peer`].

use crate::buffer_pool::BufferPool;
use crate::error::{Result, TransportError};
use crate::transport::{ChannelKind, StatCounters, Transport, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Largest datagram the media channel will send or accept.
///
/// Audio frames routinely exceed one MTU and the kernel fragments them;
/// frames beyond this cap are rejected instead.
pub const MAX_DATAGRAM: usize = 60 * 1024;

/// Receive buffers pre-allocated per channel.
const RECV_POOL_SIZE: usize = 8;

/// Connected UDP channel to one peer.
pub struct MediaTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    connected: AtomicBool,
    closed: AtomicBool,
    counters: StatCounters,
    /// Recycled datagram-sized receive buffers.
    buffers: BufferPool,
}

impl MediaTransport {
    /// Bind a local socket; use port 0 for an OS-assigned port.
    ///
    /// The channel is unusable until [`Self::connect_peer`] locks it onto
    /// the negotiated peer address.
    ///
    /// # Errors
    /// Fails when the socket cannot be bound.
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        Ok(Self {
            socket,
            local_addr,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: StatCounters::default(),
            buffers: BufferPool::new(MAX_DATAGRAM, RECV_POOL_SIZE),
        })
    }

    /// Lock the socket onto the negotiated peer address.
    ///
    /// # Errors
    /// Fails when the connect fails.
    pub async fn connect_peer(&self, peer: SocketAddr) -> Result<()> {
        self.socket
            .connect(peer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Local address of the channel, exchanged during negotiation.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::MediaFailed("peer not negotiated".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MediaTransport {
    async fn send(&self, frame: &str) -> Result<()> {
        self.check_usable()?;
        if frame.len() > MAX_DATAGRAM {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        match self.socket.send(frame.as_bytes()).await {
            Ok(sent) => {
                self.counters.record_send(sent);
                Ok(())
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::MediaFailed(e.to_string()))
            }
        }
    }

    async fn recv(&self) -> Result<String> {
        self.check_usable()?;
        let mut buf = self.buffers.acquire();
        let received = self.socket.recv(&mut buf).await;
        let result = match received {
            Ok(len) => match std::str::from_utf8(&buf[..len]) {
                Ok(text) => {
                    self.counters.record_recv(len);
                    Ok(text.to_owned())
                }
                Err(_) => {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    Err(TransportError::MediaFailed("non-UTF-8 datagram".to_string()))
                }
            },
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::MediaFailed(e.to_string()))
            }
        };
        self.buffers.release(buf);
        result
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Media
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}
