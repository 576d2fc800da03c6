//! Wire protocol for link: envelope codec, header lines, messages and stream reassembly.
//!
//! This crate provides the byte-level half of the link protocol. It has no
//! I/O of its own; the session crate feeds it socket reads and drains its
//! encoded messages into send queues.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Envelope (16B)       | addressing + length + flags|
//! +----------------------+----------------------------+
//! | start line           | REQUEST <target> or        |
//! |                      | RESPONSE <status>          |
//! +----------------------+----------------------------+
//! | header lines         | name: value, CRLF-ended    |
//! +----------------------+----------------------------+
//! | empty line           | CRLF                       |
//! +----------------------+----------------------------+
//! | content              | opaque bytes               |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod error;
pub mod header;
pub mod headers;
pub mod message;

// Re-export main types
pub use decoder::{MessageDecoder, Parsed, DEFAULT_MAX_CONTENT_LENGTH};
pub use error::WireError;
pub use header::{
    Envelope, Flags, PeerId, ENVELOPE_SIZE, LARGE_MESSAGE_THRESHOLD, MAX_CONTENT_LENGTH,
};
pub use headers::{parse_header_line, HeaderLine, Headers, DESTINATION_ID, PEER_ID, SOURCE_ID};
pub use message::{status, Message, Request, Response};
