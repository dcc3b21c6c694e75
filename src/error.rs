//! Error taxonomy for the network core.
//!
//! Each subsystem gets one plain enum with a manual `Display`/`Error` impl
//! and `From` conversions at the boundaries that produce it, rather than a
//! single monolithic error type. This mirrors the Soulseek.NET separation
//! between transport, protocol, semantic and local failures (see §7 of the
//! design document).

use std::fmt;
use std::io;

/// Errors raised while encoding or decoding a framed message.
#[derive(Debug)]
pub enum CodecError {
    /// The reader expected a different message code than the one present.
    WrongCode { expected: u32, got: u32 },
    /// The buffer ended before the requested field could be read.
    Truncated,
    /// A length-prefixed string was not valid UTF-8 or Windows-1252.
    BadEncoding,
    /// Inflating (or deflating) a compressed payload failed.
    Inflate(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongCode { expected, got } => write!(
                f,
                "wrong message code: expected {}, got {}",
                expected, got
            ),
            Self::Truncated => write!(f, "message buffer truncated"),
            Self::BadEncoding => write!(f, "invalid string encoding"),
            Self::Inflate(msg) => write!(f, "compression error: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors raised by a [`crate::connection::Connection`].
#[derive(Debug)]
pub enum ConnectionError {
    /// `connect` did not complete within `connect_timeout_ms`.
    ConnectTimeout,
    /// The OS refused or reset the connection attempt.
    ConnectRefused(io::Error),
    /// The peer closed the stream before the requested bytes arrived.
    Eof,
    /// A write could not be flushed within `write_timeout_ms`.
    WriteTimeout,
    /// The inbound frame exceeded the configured maximum frame size.
    FrameTooLarge { len: u32, max: u32 },
    /// A SOCKS5 proxy handshake failed.
    Proxy(String),
    /// Underlying I/O failure not covered by a more specific variant.
    Io(io::Error),
    /// A protocol-level decode failure; the connection must be torn down
    /// since the byte stream may have desynchronized.
    Codec(CodecError),
    /// The connection was explicitly disconnected (locally or by the peer).
    Disconnected,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout => write!(f, "connect timed out"),
            Self::ConnectRefused(e) => write!(f, "connect refused: {}", e),
            Self::Eof => write!(f, "connection closed before expected bytes arrived"),
            Self::WriteTimeout => write!(f, "write timed out"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", len, max)
            }
            Self::Proxy(msg) => write!(f, "SOCKS5 proxy error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::Disconnected => write!(f, "connection is disconnected"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// Errors raised while waiting on the [`crate::waiter::WaiterRegistry`].
#[derive(Debug, Clone)]
pub enum WaiterError {
    /// The timeout given to `wait` elapsed before a value arrived.
    Timeout,
    /// The caller's cancellation signal fired before a value arrived.
    Cancelled,
    /// `throw` was called for this key with the contained reason.
    Thrown(String),
    /// The registry was torn down (`cancel_all`) while this wait was live.
    Shutdown,
}

impl fmt::Display for WaiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "wait timed out"),
            Self::Cancelled => write!(f, "wait was cancelled"),
            Self::Thrown(reason) => write!(f, "wait failed: {}", reason),
            Self::Shutdown => write!(f, "waiter registry was shut down"),
        }
    }
}

impl std::error::Error for WaiterError {}

/// Errors raised by the connection manager's `get_or_add_*_connection`
/// operations (§4.E contract).
#[derive(Debug)]
pub enum ManagerError {
    /// The server reported `0.0.0.0` for this username.
    PeerOffline,
    /// Neither the direct dial nor the server solicitation completed in
    /// time.
    ConnectionTimeout,
    /// The server's `AddUser` reply reported the user does not exist.
    UserNotFound,
    /// The adopted connection closed again during the handshake.
    Disconnected,
    /// A SOCKS5 proxy handshake failed.
    Proxy(String),
    /// The underlying connection reported a transport error.
    Connection(ConnectionError),
    /// A wait for a server or peer reply failed.
    Waiter(WaiterError),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerOffline => write!(f, "peer is offline"),
            Self::ConnectionTimeout => write!(f, "connection attempt timed out"),
            Self::UserNotFound => write!(f, "user not found"),
            Self::Disconnected => write!(f, "connection was closed during handshake"),
            Self::Proxy(msg) => write!(f, "proxy error: {}", msg),
            Self::Connection(e) => write!(f, "connection error: {}", e),
            Self::Waiter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<ConnectionError> for ManagerError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<WaiterError> for ManagerError {
    fn from(e: WaiterError) -> Self {
        Self::Waiter(e)
    }
}

/// Errors raised by the transfer engine (§4.H, §7 "Semantic" + "Local").
#[derive(Debug)]
pub enum TransferError {
    /// A transfer for this (username, filename, direction) is already
    /// active.
    DuplicateTransfer,
    /// The peer rejected the transfer with a human-readable reason.
    Rejected(String),
    /// A generic transfer-layer failure reported by the peer or by us.
    Failed(String),
    /// The peer-response wait, the queue wait, or the read-gap wait timed
    /// out.
    Timeout,
    /// The caller's cancellation token fired.
    Cancelled,
    /// An operation was attempted while the transfer was in the wrong
    /// state.
    StateError(&'static str),
    /// The connection manager could not obtain a peer or transfer
    /// connection.
    Manager(ManagerError),
    /// The transfer or message connection failed mid-flight.
    Connection(ConnectionError),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTransfer => write!(f, "a transfer for this file is already active"),
            Self::Rejected(reason) => write!(f, "transfer rejected: {}", reason),
            Self::Failed(reason) => write!(f, "transfer failed: {}", reason),
            Self::Timeout => write!(f, "transfer timed out"),
            Self::Cancelled => write!(f, "transfer was cancelled"),
            Self::StateError(what) => write!(f, "invalid transfer state: {}", what),
            Self::Manager(e) => write!(f, "{}", e),
            Self::Connection(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<ManagerError> for TransferError {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}

impl From<ConnectionError> for TransferError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<WaiterError> for TransferError {
    fn from(e: WaiterError) -> Self {
        match e {
            WaiterError::Timeout => Self::Timeout,
            WaiterError::Cancelled => Self::Cancelled,
            WaiterError::Thrown(reason) => Self::Failed(reason),
            WaiterError::Shutdown => Self::Failed("registry shut down".into()),
        }
    }
}

/// Top-level client errors (login, and anything not already covered above).
#[derive(Debug)]
pub enum ClientError {
    LoginFailed(String),
    Manager(ManagerError),
    Connection(ConnectionError),
    Transfer(TransferError),
    Waiter(WaiterError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginFailed(reason) => write!(f, "login failed: {}", reason),
            Self::Manager(e) => write!(f, "{}", e),
            Self::Connection(e) => write!(f, "{}", e),
            Self::Transfer(e) => write!(f, "{}", e),
            Self::Waiter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ManagerError> for ClientError {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}

impl From<ConnectionError> for ClientError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> Self {
        Self::Transfer(e)
    }
}

impl From<WaiterError> for ClientError {
    fn from(e: WaiterError) -> Self {
        Self::Waiter(e)
    }
}
