//! Non-blocking sockets, send queues, request correlation and the relay for link.
//!
//! This crate provides the session half of the link protocol: peers connect to
//! a central relay, receive a peer ID, and exchange requests and responses
//! through it. Everything is poll-driven; callers advance the state machines
//! by calling `update` from their own loop.
//!
//! ## Features
//!
//! - **Sockets**: tokio TCP sockets driven without blocking or awaiting
//! - **Send queue**: FIFO output surviving partial writes
//! - **Session manager**: one in-flight request per destination, timeouts,
//!   path routing with 404 replies for unmatched targets
//! - **Relay**: peer ID assignment and message forwarding
//!
//! ## Example
//!
//! ```rust,no_run
//! use link_session::{SessionConfig, SessionManager};
//! use link_wire::{PeerId, Request};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let mut manager = SessionManager::new(SessionConfig::default());
//! manager.connect_to_relay();
//! manager.register_path("/echo");
//!
//! let pending = manager
//!     .send_request(Request::new(PeerId(2), "/echo/hi", "hello"), Duration::from_secs(5))
//!     .expect("request not finalized");
//!
//! let mut ticker = tokio::time::interval(Duration::from_millis(10));
//! while pending.is_pending() {
//!     ticker.tick().await;
//!     manager.update(Duration::from_millis(10));
//! }
//! println!("status: {:?}", pending.status());
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod pending;
pub mod relay;
pub mod send_queue;
pub mod socket;
pub mod transport;

// Re-export main types
pub use config::{RelayConfig, SessionConfig, RELAY_PORT};
pub use endpoint::{EndpointStats, ProtocolEndpoint};
pub use error::{Result, SessionError};
pub use manager::{ConnectionState, SessionManager, SessionStats, ASSIGN_PATH, PING_PATH};
pub use pending::{PendingResponse, ResponseStatus};
pub use relay::{Relay, RelayStats};
pub use send_queue::SendQueue;
pub use socket::{ConnectStatus, Socket};
pub use transport::{Transport, TransportEndpoint, DEFAULT_STAGING_SIZE};
