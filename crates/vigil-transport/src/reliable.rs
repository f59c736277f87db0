//! Reliable message transport over WebSocket.
//!
//! The reliable transport is the ordered, framed channel every session
//! keeps for control and text traffic. Frames are WebSocket text messages
//! carrying envelope JSON. The implementation uses `tokio-tungstenite`;
//! the listener accepts WebSocket upgrades from incoming TCP connections,
//! and outbound connections are established on demand.

use crate::error::{Result, TransportError};
use crate::transport::{ChannelKind, StatCounters, Transport, TransportStats};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use vigil_core::MAX_FRAME_SIZE;

/// Type alias for a server-side WebSocket stream.
type ServerWsStream = WebSocketStream<TcpStream>;

/// Type alias for a client-side WebSocket stream.
type ClientWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half, unified over server and client streams.
enum WsSink {
    Server(SplitSink<ServerWsStream, Message>),
    Client(SplitSink<ClientWsStream, Message>),
}

impl WsSink {
    async fn send_text(&mut self, frame: String) -> Result<()> {
        let msg = Message::Text(frame);
        match self {
            Self::Server(s) => s.send(msg).await,
            Self::Client(s) => s.send(msg).await,
        }
        .map_err(|e| TransportError::Other(format!("websocket send error: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::Server(s) => s.close().await,
            Self::Client(s) => s.close().await,
        }
        .map_err(|e| TransportError::Other(format!("websocket close error: {e}")))
    }
}

/// Read half, unified over server and client streams.
enum WsSource {
    Server(SplitStream<ServerWsStream>),
    Client(SplitStream<ClientWsStream>),
}

impl WsSource {
    async fn recv_text(&mut self) -> Result<String> {
        loop {
            let msg = match self {
                Self::Server(s) => s.next().await,
                Self::Client(s) => s.next().await,
            };
            match msg {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue, // Skip binary/ping/pong frames.
                Some(Err(e)) => {
                    return Err(TransportError::Other(format!("websocket recv error: {e}")));
                }
            }
        }
    }
}

/// Ordered, framed transport to one peer over WebSocket.
///
/// Send and receive halves are independently locked, so one task can sit
/// in `recv` while others send.
pub struct ReliableTransport {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
    counters: StatCounters,
}

impl ReliableTransport {
    /// Wrap an accepted TCP connection after the WebSocket handshake.
    ///
    /// # Errors
    /// Fails when the WebSocket upgrade handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr().ok();
        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("websocket accept: {e}")))?;
        let (sink, source) = ws.split();
        Ok(Self {
            sink: Mutex::new(WsSink::Server(sink)),
            source: Mutex::new(WsSource::Server(source)),
            peer_addr,
            closed: AtomicBool::new(false),
            counters: StatCounters::default(),
        })
    }

    /// Establish an outbound connection to `url` (e.g. `ws://host:port`).
    ///
    /// # Errors
    /// Fails when the TCP connection or WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("websocket connect: {e}")))?;
        let (sink, source) = ws.split();
        Ok(Self {
            sink: Mutex::new(WsSink::Client(sink)),
            source: Mutex::new(WsSource::Client(source)),
            peer_addr: None,
            closed: AtomicBool::new(false),
            counters: StatCounters::default(),
        })
    }

    /// Peer address, when known (server side).
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[async_trait]
impl Transport for ReliableTransport {
    async fn send(&self, frame: &str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let len = frame.len();
        let mut sink = self.sink.lock().await;
        match sink.send_text(frame.to_string()).await {
            Ok(()) => {
                self.counters.record_send(len);
                Ok(())
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn recv(&self) -> Result<String> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let mut source = self.source.lock().await;
        match source.recv_text().await {
            Ok(text) => {
                if text.len() > MAX_FRAME_SIZE {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(TransportError::FrameTooLarge(text.len()));
                }
                self.counters.record_recv(text.len());
                Ok(text)
            }
            Err(TransportError::Closed) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(TransportError::Closed)
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.close().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Reliable
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

/// Listener producing [`ReliableTransport`]s from incoming connections.
pub struct ReliableListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ReliableListener {
    /// Bind to `addr`; use port 0 for an OS-assigned port.
    ///
    /// # Errors
    /// Fails when the TCP listener cannot be created.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Local address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next connection and perform the WebSocket handshake.
    ///
    /// # Errors
    /// Fails on accept or handshake failure.
    pub async fn accept(&self) -> Result<ReliableTransport> {
        let (stream, _peer) = self.listener.accept().await?;
        ReliableTransport::accept(stream).await
    }
}
