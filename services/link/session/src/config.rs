//! Session and relay configuration.

use crate::transport::DEFAULT_STAGING_SIZE;
use link_wire::DEFAULT_MAX_CONTENT_LENGTH;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Well-known relay port
pub const RELAY_PORT: u16 = 7373;

/// Configuration for a session manager
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Relay address
    pub relay_addr: SocketAddr,
    /// How long to wait for the relay to assign a peer ID
    pub handshake_timeout: Duration,
    /// Timeout used by `send_request_default`
    pub default_request_timeout: Duration,
    /// Receive staging buffer size in bytes
    pub staging_buffer_size: usize,
    /// Largest accepted message body
    pub max_content_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, RELAY_PORT)),
            handshake_timeout: Duration::from_secs(5),
            default_request_timeout: Duration::from_secs(10),
            staging_buffer_size: DEFAULT_STAGING_SIZE,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// Configuration for a relay
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Port to listen on
    pub listen_port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Receive staging buffer size per client
    pub staging_buffer_size: usize,
    /// Largest accepted message body
    pub max_content_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: RELAY_PORT,
            backlog: 128,
            staging_buffer_size: DEFAULT_STAGING_SIZE,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}
