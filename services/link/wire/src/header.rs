//! Fixed-size envelope that precedes every message on the wire.
//!
//! All fields are written in network byte order:
//!
//! ```text
//! +--------+-------------+-----------+----------------+-------+-------------+
//! | source | destination | messageID | contentLength  | flags | statusCode  |
//! |  u16   |    u16      |   u32     |     u32        |  u16  |    u16      |
//! +--------+-------------+-----------+----------------+-------+-------------+
//! ```
//!
//! The envelope is followed by exactly `contentLength` body bytes.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope size in bytes
pub const ENVELOPE_SIZE: usize = 16;

/// Content above this size is tagged with [`Flags::LARGE_MESSAGE`]
pub const LARGE_MESSAGE_THRESHOLD: usize = 64 * 1024;

/// Largest body the 32-bit length field can describe
pub const MAX_CONTENT_LENGTH: usize = u32::MAX as usize;

/// Identifier the relay assigns to each connected client
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub u16);

impl PeerId {
    /// Not yet assigned. As a destination it addresses the relay itself.
    pub const UNASSIGNED: PeerId = PeerId(0);

    /// Whether the relay has assigned this ID
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PeerId {
    fn from(value: u16) -> Self {
        PeerId(value)
    }
}

bitflags! {
    /// Envelope flags bitmask
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Body is a response; clear means request
        const RESPONSE = 1 << 0;
        /// Body is larger than 64 KiB (informational)
        const LARGE_MESSAGE = 1 << 1;
    }
}

/// Binary message envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending peer
    pub source: PeerId,
    /// Receiving peer
    pub destination: PeerId,
    /// Sender-local message counter; responses echo the request's value
    pub message_id: u32,
    /// Number of body bytes following the envelope
    pub content_length: u32,
    /// Message flags
    pub flags: Flags,
    /// Request or response status code
    pub status_code: u16,
}

impl Envelope {
    /// Create an envelope with no body
    pub fn new(source: PeerId, destination: PeerId) -> Self {
        Self {
            source,
            destination,
            ..Self::default()
        }
    }

    /// Whether the body carries a response
    pub fn is_response(&self) -> bool {
        self.flags.contains(Flags::RESPONSE)
    }

    /// Whether flag bits outside the known set are present
    pub fn has_unknown_flags(&self) -> bool {
        !Flags::all().contains(self.flags)
    }

    /// Set the content length and keep the large-message flag consistent with it.
    ///
    /// Fails without changing the envelope when `len` does not fit the 32-bit field.
    pub fn set_content_length(&mut self, len: usize) -> Result<(), crate::WireError> {
        let content_length = u32::try_from(len).map_err(|_| crate::WireError::Size(len))?;
        self.content_length = content_length;
        self.flags
            .set(Flags::LARGE_MESSAGE, len > LARGE_MESSAGE_THRESHOLD);
        Ok(())
    }

    /// Write the envelope into a buffer of exactly [`ENVELOPE_SIZE`] bytes.
    ///
    /// Returns `false` without touching the buffer when the size is wrong.
    pub fn serialize(&self, buf: &mut [u8]) -> bool {
        if buf.len() != ENVELOPE_SIZE {
            return false;
        }

        let mut out = buf;
        out.put_u16(self.source.0);
        out.put_u16(self.destination.0);
        out.put_u32(self.message_id);
        out.put_u32(self.content_length);
        out.put_u16(self.flags.bits());
        out.put_u16(self.status_code);
        true
    }

    /// Append the envelope to a growable buffer (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut raw = [0u8; ENVELOPE_SIZE];
        self.serialize(&mut raw);
        buf.put_slice(&raw);
    }

    /// Parse an envelope from the first [`ENVELOPE_SIZE`] bytes of `buf`
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Self::try_parse(buf).ok()
    }

    /// Parse an envelope, reporting why it failed.
    ///
    /// Unknown flag bits are kept as they are; only `RESPONSE` affects dispatch.
    pub fn try_parse(buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < ENVELOPE_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let mut buf = &buf[..ENVELOPE_SIZE];
        let source = PeerId(buf.get_u16());
        let destination = PeerId(buf.get_u16());
        let message_id = buf.get_u32();
        let content_length = buf.get_u32();
        let flags = Flags::from_bits_retain(buf.get_u16());
        let status_code = buf.get_u16();

        Ok(Self {
            source,
            destination,
            message_id,
            content_length,
            flags,
            status_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            source: PeerId(7),
            destination: PeerId(0xBEEF),
            message_id: 0xDEADBEEF,
            content_length: 4096,
            flags: Flags::RESPONSE,
            status_code: 404,
        }
    }

    #[test]
    fn test_envelope_serialize_parse() {
        let envelope = sample();
        let mut buf = [0u8; ENVELOPE_SIZE];
        assert!(envelope.serialize(&mut buf));

        let parsed = Envelope::parse(&buf).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_envelope_byte_order() {
        let mut buf = [0u8; ENVELOPE_SIZE];
        assert!(sample().serialize(&mut buf));

        assert_eq!(&buf[0..2], &[0x00, 0x07]);
        assert_eq!(&buf[2..4], &[0xBE, 0xEF]);
        assert_eq!(&buf[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(&buf[12..14], &[0x00, 0x01]);
        assert_eq!(&buf[14..16], &[0x01, 0x94]);
    }

    #[test]
    fn test_serialize_rejects_wrong_size() {
        let envelope = sample();

        let mut short = [0xAAu8; ENVELOPE_SIZE - 1];
        assert!(!envelope.serialize(&mut short));
        assert!(short.iter().all(|&b| b == 0xAA));

        let mut long = [0xAAu8; ENVELOPE_SIZE + 1];
        assert!(!envelope.serialize(&mut long));
        assert!(long.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_parse_short_buffer() {
        assert!(Envelope::parse(&[0u8; ENVELOPE_SIZE - 1]).is_none());
        assert_eq!(
            Envelope::try_parse(&[]).unwrap_err(),
            crate::WireError::Incomplete
        );
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        buf.put_slice(b"body");

        assert_eq!(Envelope::parse(&buf).unwrap(), sample());
    }

    #[test]
    fn test_unknown_flags_survive_round_trip() {
        let mut envelope = sample();
        envelope.flags = Flags::from_bits_retain(0x0004);
        assert!(envelope.has_unknown_flags());
        assert!(!envelope.is_response());

        let mut buf = [0u8; ENVELOPE_SIZE];
        assert!(envelope.serialize(&mut buf));
        assert_eq!(Envelope::parse(&buf), Some(envelope));

        buf[12] = 0x80;
        let parsed = Envelope::parse(&buf).unwrap();
        assert_eq!(parsed.flags.bits(), 0x8004);
        assert!(!sample().has_unknown_flags());
    }

    #[test]
    fn test_large_message_flag() {
        let mut envelope = Envelope::new(PeerId(1), PeerId(2));
        envelope.set_content_length(LARGE_MESSAGE_THRESHOLD + 1).unwrap();
        assert!(envelope.flags.contains(Flags::LARGE_MESSAGE));

        envelope.set_content_length(10).unwrap();
        assert!(!envelope.flags.contains(Flags::LARGE_MESSAGE));
        assert_eq!(envelope.content_length, 10);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_content_length_above_field_width() {
        let mut envelope = Envelope::new(PeerId(1), PeerId(2));
        envelope.set_content_length(10).unwrap();

        assert_eq!(
            envelope.set_content_length(MAX_CONTENT_LENGTH + 1),
            Err(crate::WireError::Size(MAX_CONTENT_LENGTH + 1))
        );
        assert_eq!(envelope.content_length, 10);
        envelope.set_content_length(MAX_CONTENT_LENGTH).unwrap();
        assert_eq!(envelope.content_length, u32::MAX);
    }
}
