//! A framed, owning TCP endpoint with read/write/inactivity timeouts
//! (§4.B).
//!
//! [`Connection`] owns both halves of a socket until [`Connection::split`]
//! hands them to a [`ConnectionReader`] (single owner, drives a read loop)
//! and a cloneable [`ConnectionWriter`] (many call sites may hold a clone
//! and send concurrently, the way the server session, search, and transfer
//! engine all write to the same server link). This mirrors the way the
//! teacher crate splits a `Framed` stream into its sink and stream halves
//! before entering its `select!` loop.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};

use crate::error::ConnectionError;

type Result<T> = std::result::Result<T, ConnectionError>;

/// Credentials and address for an optional SOCKS5 proxy hop.
#[derive(Debug, Clone)]
pub struct Socks5ProxyOptions {
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Tuning knobs for a single connection (§6.4 "Connection").
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub read_buffer: usize,
    pub write_buffer: usize,
    pub write_queue_size: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub without_inactivity_timeout: bool,
    pub max_frame_size: u32,
    pub tcp_keepalive: Option<Duration>,
    pub proxy: Option<Socks5ProxyOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer: 16384,
            write_buffer: 16384,
            write_queue_size: 250,
            connect_timeout: Duration::from_millis(10_000),
            write_timeout: Duration::from_millis(5_000),
            inactivity_timeout: Duration::from_millis(15_000),
            without_inactivity_timeout: false,
            // generous enough for a browse response of a large share, but
            // still well short of what a desynced stream could claim
            max_frame_size: 256 * 1024 * 1024,
            tcp_keepalive: None,
            proxy: None,
        }
    }
}

/// The lifecycle of a [`Connection`]. Transitions are monotonic: once
/// `Disconnected` is reached the connection is inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// An owning wrapper around a `TcpStream`, not yet split for message
/// exchange. Use [`Connection::connect`] (outbound) or
/// [`Connection::from_accepted`] (inbound), then [`Connection::split`].
pub struct Connection {
    stream: TcpStream,
    pub peer_addr: SocketAddr,
    options: ConnectionOptions,
}

impl Connection {
    /// Dials `addr`, performing a SOCKS5 handshake first if
    /// `options.proxy` is set. Resolves once the three-way TCP handshake
    /// (and optional SOCKS5 negotiation) is complete.
    pub async fn connect(addr: SocketAddr, options: ConnectionOptions) -> Result<Self> {
        let dial_addr = options
            .proxy
            .as_ref()
            .map(|p| p.addr)
            .unwrap_or(addr);

        log::debug!("dialing {} (via proxy: {})", addr, options.proxy.is_some());
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(dial_addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout)?
            .map_err(ConnectionError::ConnectRefused)?;

        if let Some(keepalive) = options.tcp_keepalive {
            let _ = keepalive; // tokio's TcpStream exposes keepalive via socket2 on some platforms; best-effort only
        }

        let mut stream = stream;
        if let Some(proxy) = &options.proxy {
            socks5_connect(&mut stream, proxy, addr).await?;
        }

        log::info!("connected to {}", addr);
        Ok(Self {
            stream,
            peer_addr: addr,
            options,
        })
    }

    /// Wraps an already-accepted socket (from a listener).
    pub fn from_accepted(stream: TcpStream, peer_addr: SocketAddr, options: ConnectionOptions) -> Self {
        Self {
            stream,
            peer_addr,
            options,
        }
    }

    /// Splits the connection into an owned reader (drives a read loop) and
    /// a cloneable writer (many tasks may send concurrently, bounded by
    /// `options.write_queue_size`).
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = self.stream.into_split();
        let reader = ConnectionReader {
            read,
            peer_addr: self.peer_addr,
            inactivity_timeout: if self.options.without_inactivity_timeout {
                None
            } else {
                Some(self.options.inactivity_timeout)
            },
            max_frame_size: self.options.max_frame_size,
            state: Arc::new(std::sync::Mutex::new(ConnectionState::Connected)),
        };
        let writer = ConnectionWriter {
            write: Arc::new(Mutex::new(write)),
            permits: Arc::new(Semaphore::new(self.options.write_queue_size)),
            write_timeout: self.options.write_timeout,
            peer_addr: self.peer_addr,
            state: Arc::clone(&reader.state),
        };
        (reader, writer)
    }
}

/// The read half of a split [`Connection`]. Not `Clone`: exactly one task
/// should own the read loop, matching the "reads are processed in wire
/// order" ordering guarantee (§5).
pub struct ConnectionReader {
    read: OwnedReadHalf,
    pub peer_addr: SocketAddr,
    inactivity_timeout: Option<Duration>,
    max_frame_size: u32,
    state: Arc<std::sync::Mutex<ConnectionState>>,
}

impl ConnectionReader {
    fn is_disconnected(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Disconnected
    }

    fn mark_disconnected(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    /// Reads exactly `n` bytes, resuming on short reads.
    pub async fn read_length(&mut self, n: usize) -> Result<Bytes> {
        if self.is_disconnected() {
            return Err(ConnectionError::Disconnected);
        }
        let mut buf = vec![0u8; n];
        let fut = self.read.read_exact(&mut buf);
        let result = match self.inactivity_timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| ConnectionError::Eof)?,
            None => fut.await,
        };
        match result {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.mark_disconnected();
                Err(ConnectionError::Eof)
            }
            Err(e) => {
                self.mark_disconnected();
                Err(ConnectionError::Io(e))
            }
        }
    }

    /// Reads a `u32_le length || payload` frame and returns the payload
    /// (code + body, not yet parsed).
    pub async fn read_message(&mut self) -> Result<Bytes> {
        let len_bytes = self.read_length(4).await?;
        let len = u32::from_le_bytes(len_bytes.as_ref().try_into().unwrap());
        if len > self.max_frame_size {
            self.mark_disconnected();
            return Err(ConnectionError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        self.read_length(len as usize).await
    }

    pub fn disconnect(&mut self, reason: impl std::fmt::Display) {
        if !self.is_disconnected() {
            log::info!("disconnecting {}: {}", self.peer_addr, reason);
            self.mark_disconnected();
        }
    }

    /// Drops the inactivity timeout after the fact, for connections whose
    /// kind (transfer vs. message) is only known once the init frame has
    /// been read off an already-split accepted socket.
    pub fn disable_inactivity_timeout(&mut self) {
        self.inactivity_timeout = None;
    }
}

/// The cloneable write half of a split [`Connection`]. All clones share
/// the same underlying socket and bounded write queue.
#[derive(Clone)]
pub struct ConnectionWriter {
    write: Arc<Mutex<OwnedWriteHalf>>,
    permits: Arc<Semaphore>,
    write_timeout: Duration,
    pub peer_addr: SocketAddr,
    state: Arc<std::sync::Mutex<ConnectionState>>,
}

impl ConnectionWriter {
    fn is_disconnected(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Disconnected
    }

    /// Fully writes `bytes`, queueing behind any other in-flight writes up
    /// to `write_queue_size` (backpressure suspends the caller beyond
    /// that).
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_disconnected() {
            return Err(ConnectionError::Disconnected);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore is never closed");
        let mut w = self.write.lock().await;
        let fut = w.write_all(&bytes);
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                Err(ConnectionError::Io(e))
            }
            Err(_) => {
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                Err(ConnectionError::WriteTimeout)
            }
        }
    }

    pub fn disconnect(&self, reason: impl std::fmt::Display) {
        if !self.is_disconnected() {
            log::info!("disconnecting {}: {}", self.peer_addr, reason);
            *self.state.lock().unwrap() = ConnectionState::Disconnected;
        }
    }
}

/// Performs the SOCKS5 greeting and `CONNECT` request (RFC 1928) on an
/// already-established TCP stream to the proxy, with username/password
/// authentication when credentials are configured.
async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &Socks5ProxyOptions,
    target: SocketAddr,
) -> Result<()> {
    let wants_auth = proxy.username.is_some();
    let methods: &[u8] = if wants_auth { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![0x05, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .await
        .map_err(|e| ConnectionError::Proxy(e.to_string()))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| ConnectionError::Proxy(e.to_string()))?;
    if reply[0] != 0x05 {
        return Err(ConnectionError::Proxy("not a SOCKS5 proxy".into()));
    }
    match reply[1] {
        0x00 => {}
        0x02 => {
            let username = proxy.username.as_deref().unwrap_or_default();
            let password = proxy.password.as_deref().unwrap_or_default();
            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream
                .write_all(&auth)
                .await
                .map_err(|e| ConnectionError::Proxy(e.to_string()))?;
            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .await
                .map_err(|e| ConnectionError::Proxy(e.to_string()))?;
            if auth_reply[1] != 0x00 {
                return Err(ConnectionError::Proxy("SOCKS5 authentication failed".into()));
            }
        }
        0xFF => return Err(ConnectionError::Proxy("no acceptable auth method".into())),
        other => return Err(ConnectionError::Proxy(format!("unexpected auth method {}", other))),
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    match target {
        SocketAddr::V4(v4) => {
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(_) => {
            return Err(ConnectionError::Proxy("IPv6 targets are not supported".into()));
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| ConnectionError::Proxy(e.to_string()))?;

    let mut connect_reply = [0u8; 4];
    stream
        .read_exact(&mut connect_reply)
        .await
        .map_err(|e| ConnectionError::Proxy(e.to_string()))?;
    if connect_reply[1] != 0x00 {
        return Err(ConnectionError::Proxy(format!(
            "SOCKS5 CONNECT failed with status {}",
            connect_reply[1]
        )));
    }
    // drain the bound address echoed back, length depends on address type
    let addr_len = match connect_reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream
                .read_exact(&mut len_byte)
                .await
                .map_err(|e| ConnectionError::Proxy(e.to_string()))?;
            len_byte[0] as usize
        }
        other => return Err(ConnectionError::Proxy(format!("unknown address type {}", other))),
    };
    let mut discard = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut discard)
        .await
        .map_err(|e| ConnectionError::Proxy(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_and_exchange_a_framed_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = Connection::from_accepted(stream, peer, ConnectionOptions::default());
            let (mut reader, _writer) = conn.split();
            let frame = reader.read_message().await.unwrap();
            frame
        });

        let client = Connection::connect(addr, ConnectionOptions::default())
            .await
            .unwrap();
        let (_reader, writer) = client.split();
        let frame = MessageBuilder::new(1).write_string("hi").finish();
        writer.write(frame.clone()).await.unwrap();

        let received = server.await.unwrap();
        let mut msg = crate::codec::MessageReader::from_frame(received).unwrap();
        assert_eq!(msg.read_code(), 1);
        assert_eq!(msg.read_string().unwrap(), "hi");
    }

    #[tokio::test]
    async fn read_eof_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let client = Connection::connect(addr, ConnectionOptions::default())
            .await
            .unwrap();
        let (mut reader, _writer) = client.split();
        server.await.unwrap();
        let result = reader.read_message().await;
        assert!(matches!(result, Err(ConnectionError::Eof)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let options = ConnectionOptions {
                max_frame_size: 4,
                ..ConnectionOptions::default()
            };
            let conn = Connection::from_accepted(stream, peer, options);
            let (mut reader, _writer) = conn.split();
            reader.read_message().await
        });
        let client = Connection::connect(addr, ConnectionOptions::default())
            .await
            .unwrap();
        let (_reader, writer) = client.split();
        let frame = MessageBuilder::new(1).write_string("too long").finish();
        writer.write(frame.clone()).await.unwrap();
        let result = server.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::FrameTooLarge { .. })));
    }
}
