//! Session error types.

use link_wire::WireError;
use thiserror::Error;

/// Errors surfaced by sockets, endpoints and the session manager
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket could not be created or bound
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Outbound connection failed
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// Fatal socket error other than would-block
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Relay did not assign a peer ID in time
    #[error("relay handshake timed out")]
    HandshakeTimeout,

    /// Relay answered the handshake without a usable peer ID
    #[error("relay handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Operation needs a connected socket
    #[error("not connected")]
    NotConnected,

    /// Envelope parse failure mid-stream
    #[error("protocol desync: {0}")]
    Desync(#[source] WireError),

    /// Message could not be prepared for sending
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Result type alias using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
