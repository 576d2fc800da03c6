//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes for an envelope
    #[error("incomplete envelope")]
    Incomplete,

    /// Buffer handed to the serializer has the wrong size
    #[error("buffer size {actual}, expected {expected}")]
    BufferSize {
        /// Required size in bytes
        expected: usize,
        /// Size of the buffer that was passed in
        actual: usize,
    },

    /// Content length above the configured limit or the 32-bit length field
    #[error("content length {0} exceeds limit")]
    Size(usize),

    /// Body could not be parsed as a request or response
    #[error("malformed body: {0}")]
    Malformed(&'static str),

    /// Message was already stamped for sending
    #[error("message already finalized")]
    AlreadyFinalized,
}
