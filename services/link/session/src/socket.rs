//! Non-blocking TCP sockets.
//!
//! Sockets are `tokio::net` sockets, so they never block the calling thread.
//! Connect and accept futures are polled with a no-op waker: each call returns
//! right away and the caller polls again on its next tick. Every method must be
//! called from inside a tokio runtime, whose driver records socket readiness
//! between calls.

use crate::error::{Result, SessionError};
use bytes::BytesMut;
use futures::task::noop_waker_ref;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Outcome of one non-blocking connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connection established
    Success,
    /// Handshake still in progress, call again later
    Pending,
    /// Connection failed; the socket is unusable
    Error(io::ErrorKind),
}

enum Handle {
    Bound(TcpSocket),
    Connecting(ConnectFuture),
    Connected(TcpStream),
    Listening(TcpListener),
    Closed,
}

/// Owned TCP handle. Dropping it closes the underlying descriptor.
pub struct Socket {
    handle: Handle,
}

impl Socket {
    /// Create an IPv4 socket bound to `port` on all interfaces (0 picks a free port)
    pub fn create(port: u16) -> Result<Self> {
        let socket = TcpSocket::new_v4().map_err(SessionError::Bind)?;
        socket.set_reuseaddr(true).map_err(SessionError::Bind)?;
        socket
            .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .map_err(SessionError::Bind)?;

        trace!("Created socket bound to port {}", port);
        Ok(Self {
            handle: Handle::Bound(socket),
        })
    }

    /// Turn a bound socket into a listener
    pub fn listen(&mut self, backlog: u32) -> Result<()> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Bound(socket) => {
                let listener = socket.listen(backlog).map_err(SessionError::Bind)?;
                debug!("Listening on {}", listener.local_addr()?);
                self.handle = Handle::Listening(listener);
                Ok(())
            }
            other => {
                self.handle = other;
                Err(SessionError::Bind(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket is not in the bound state",
                )))
            }
        }
    }

    /// Connect and wait for the TCP handshake to finish
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Bound(socket) => {
                let stream = socket.connect(addr).await.map_err(SessionError::Connect)?;
                debug!("Connected to {}", addr);
                self.handle = Handle::Connected(stream);
                Ok(())
            }
            Handle::Connecting(future) => {
                let stream = future.await.map_err(SessionError::Connect)?;
                debug!("Connected to {}", addr);
                self.handle = Handle::Connected(stream);
                Ok(())
            }
            Handle::Connected(stream) => {
                self.handle = Handle::Connected(stream);
                Ok(())
            }
            other => {
                self.handle = other;
                Err(SessionError::NotConnected)
            }
        }
    }

    /// Start or continue a connect without waiting.
    ///
    /// `addr` is only used by the first call; later calls poll the same attempt.
    pub fn connect_non_blocking(&mut self, addr: SocketAddr) -> ConnectStatus {
        let mut future = match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Bound(socket) => {
                trace!("Starting non-blocking connect to {}", addr);
                Box::pin(socket.connect(addr)) as ConnectFuture
            }
            Handle::Connecting(future) => future,
            Handle::Connected(stream) => {
                self.handle = Handle::Connected(stream);
                return ConnectStatus::Success;
            }
            other => {
                self.handle = other;
                return ConnectStatus::Error(io::ErrorKind::NotConnected);
            }
        };

        let mut cx = Context::from_waker(noop_waker_ref());
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(stream)) => {
                debug!("Connected to {}", addr);
                self.handle = Handle::Connected(stream);
                ConnectStatus::Success
            }
            Poll::Ready(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                ConnectStatus::Error(e.kind())
            }
            Poll::Pending => {
                self.handle = Handle::Connecting(future);
                ConnectStatus::Pending
            }
        }
    }

    /// Accept one pending connection, if any
    pub fn accept(&mut self) -> Result<Option<Socket>> {
        let Handle::Listening(listener) = &self.handle else {
            return Err(SessionError::NotConnected);
        };

        let mut cx = Context::from_waker(noop_waker_ref());
        match listener.poll_accept(&mut cx) {
            Poll::Ready(Ok((stream, peer))) => {
                debug!("Accepted connection from {}", peer);
                Ok(Some(Socket {
                    handle: Handle::Connected(stream),
                }))
            }
            Poll::Ready(Err(e)) => Err(SessionError::Io(e)),
            Poll::Pending => Ok(None),
        }
    }

    /// Write as much of `bytes` as the OS accepts right now.
    ///
    /// Returns the number of bytes written, 0 when the socket would block.
    pub fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        let Handle::Connected(stream) = &self.handle else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        match stream.try_write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drain everything currently readable, using `staging` as the read buffer.
    ///
    /// Returns an empty buffer when nothing is available. A closed peer or any
    /// error other than would-block is fatal for the socket.
    pub fn receive(&self, staging: &mut [u8]) -> Result<BytesMut> {
        let Handle::Connected(stream) = &self.handle else {
            return Err(SessionError::NotConnected);
        };

        let mut received = BytesMut::new();
        loop {
            match stream.try_read(staging) {
                Ok(0) if received.is_empty() => return Err(SessionError::ConnectionClosed),
                // EOF is reported again on the next call
                Ok(0) => return Ok(received),
                Ok(n) => received.extend_from_slice(&staging[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(received),
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
    }

    /// Close the handle now instead of on drop
    pub fn close(&mut self) {
        if !matches!(self.handle, Handle::Closed) {
            trace!("Closing socket");
        }
        self.handle = Handle::Closed;
    }

    /// Whether the socket has a live connection
    pub fn is_connected(&self) -> bool {
        matches!(self.handle, Handle::Connected(_))
    }

    /// Local address of a bound, listening or connected socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            Handle::Bound(socket) => socket.local_addr(),
            Handle::Connected(stream) => stream.local_addr(),
            Handle::Listening(listener) => listener.local_addr(),
            Handle::Connecting(_) | Handle::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Remote address of a connected socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            Handle::Connected(stream) => stream.peer_addr(),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.handle {
            Handle::Bound(_) => "bound",
            Handle::Connecting(_) => "connecting",
            Handle::Connected(_) => "connected",
            Handle::Listening(_) => "listening",
            Handle::Closed => "closed",
        };
        f.debug_struct("Socket").field("state", &state).finish()
    }
}
