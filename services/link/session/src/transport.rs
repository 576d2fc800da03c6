//! Transport endpoint: one socket plus its receive staging buffer.

use crate::error::Result;
use crate::socket::{ConnectStatus, Socket};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

/// Default receive staging buffer size (64 KiB)
pub const DEFAULT_STAGING_SIZE: usize = 64 * 1024;

/// Byte-stream seam under a protocol endpoint
pub trait Transport {
    /// Write what the OS accepts now; 0 means it would block
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Everything currently readable, possibly empty
    fn receive(&mut self) -> Result<Bytes>;
}

/// Socket-backed transport that never blocks
#[derive(Debug)]
pub struct TransportEndpoint {
    socket: Socket,
    staging: Box<[u8]>,
}

impl TransportEndpoint {
    /// Wrap a socket with a staging buffer of `staging_size` bytes
    pub fn new(socket: Socket, staging_size: usize) -> Self {
        Self {
            socket,
            staging: vec![0u8; staging_size.max(1)].into_boxed_slice(),
        }
    }

    /// Drive a non-blocking connect on the owned socket
    pub fn connect_non_blocking(&mut self, addr: SocketAddr) -> ConnectStatus {
        self.socket.connect_non_blocking(addr)
    }

    /// The owned socket
    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Transport for TransportEndpoint {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send(bytes)
    }

    fn receive(&mut self) -> Result<Bytes> {
        self.socket
            .receive(&mut self.staging)
            .map(|received| received.freeze())
    }
}
