//! Stream reassembly: turns arbitrary TCP reads into whole messages.
//!
//! The decoder alternates between two states:
//! - `AwaitingEnvelope`: fewer than [`ENVELOPE_SIZE`] bytes are handed back to
//!   the caller as leftover, to be prepended to the next read
//! - `AwaitingBody`: the envelope is parsed, body bytes accumulate internally
//!   until `content_length` bytes have arrived
//!
//! Any split of a byte stream across calls yields the same messages as feeding
//! it in one call.

use crate::header::{Envelope, ENVELOPE_SIZE, MAX_CONTENT_LENGTH};
use crate::message::Message;
use crate::WireError;
use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

/// Default upper bound on a single message body (64 MiB)
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Body buffers start at most this large and grow as bytes arrive
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
enum State {
    AwaitingEnvelope,
    AwaitingBody {
        envelope: Envelope,
        remaining: usize,
        body: BytesMut,
    },
}

/// Result of feeding one read into the decoder
#[derive(Debug, Default)]
pub struct Parsed {
    /// Messages completed by this read, in stream order
    pub messages: Vec<Message>,
    /// Trailing bytes too short for an envelope; prepend to the next read
    pub leftover: Bytes,
    /// Envelope failure that discarded the rest of this read
    pub desync: Option<WireError>,
}

/// Resumable decoder for one byte stream
#[derive(Debug)]
pub struct MessageDecoder {
    state: State,
    max_content_length: usize,
}

impl MessageDecoder {
    /// Create a decoder with the default body limit
    pub fn new() -> Self {
        Self::with_max_content_length(DEFAULT_MAX_CONTENT_LENGTH)
    }

    /// Create a decoder that treats larger bodies as a desync.
    ///
    /// The limit is capped at what the 32-bit length field can carry.
    pub fn with_max_content_length(max_content_length: usize) -> Self {
        Self {
            state: State::AwaitingEnvelope,
            max_content_length: max_content_length.min(MAX_CONTENT_LENGTH),
        }
    }

    /// Largest body accepted before the stream is treated as out of sync
    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    /// Whether a message is partially received
    pub fn is_mid_message(&self) -> bool {
        matches!(self.state, State::AwaitingBody { .. })
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.state = State::AwaitingEnvelope;
    }

    /// Feed raw bytes and collect every message they complete
    pub fn parse_messages(&mut self, raw: &[u8]) -> Parsed {
        let mut input = raw;
        let mut parsed = Parsed::default();

        loop {
            match &mut self.state {
                State::AwaitingEnvelope => {
                    if input.len() < ENVELOPE_SIZE {
                        parsed.leftover = Bytes::copy_from_slice(input);
                        return parsed;
                    }

                    let envelope = match self.parse_envelope(input) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(
                                "Envelope parse failed ({}); discarding {} bytes",
                                e,
                                input.len()
                            );
                            parsed.desync = Some(e);
                            return parsed;
                        }
                    };

                    input = &input[ENVELOPE_SIZE..];
                    if envelope.has_unknown_flags() {
                        trace!(
                            "Envelope from {} carries unknown flags {:#06x}",
                            envelope.source,
                            envelope.flags.bits()
                        );
                    }
                    let remaining = envelope.content_length as usize;
                    trace!(
                        "Envelope from {} to {}, awaiting {} body bytes",
                        envelope.source,
                        envelope.destination,
                        remaining
                    );
                    self.state = State::AwaitingBody {
                        envelope,
                        remaining,
                        body: BytesMut::with_capacity(remaining.min(INITIAL_BODY_CAPACITY)),
                    };
                }

                State::AwaitingBody {
                    envelope,
                    remaining,
                    body,
                } => {
                    let take = (*remaining).min(input.len());
                    body.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    *remaining -= take;

                    if *remaining > 0 {
                        return parsed;
                    }

                    let envelope = *envelope;
                    let body = std::mem::take(body).freeze();
                    self.state = State::AwaitingEnvelope;

                    match Message::decode(envelope, body) {
                        Ok(message) => parsed.messages.push(message),
                        Err(e) => warn!(
                            "Dropping malformed message {} from {}: {}",
                            envelope.message_id, envelope.source, e
                        ),
                    }
                }
            }
        }
    }

    fn parse_envelope(&self, input: &[u8]) -> Result<Envelope, WireError> {
        let envelope = Envelope::try_parse(input)?;
        if envelope.content_length as usize > self.max_content_length {
            return Err(WireError::Size(envelope.content_length as usize));
        }
        Ok(envelope)
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PeerId;
    use crate::message::{status, Request, Response};

    fn request_bytes(id: u32, content: Bytes) -> (Message, Bytes) {
        let mut message: Message = Request::new(PeerId(2), "/asset/model", content).into();
        message.finalize(PeerId(1), Some(id)).unwrap();
        let bytes = message.encode().unwrap();
        (message, bytes)
    }

    /// Feed `chunks` in order, prepending leftover the way a transport would
    fn feed(decoder: &mut MessageDecoder, chunks: &[&[u8]]) -> (Vec<Message>, Bytes) {
        let mut messages = Vec::new();
        let mut leftover = Bytes::new();
        for chunk in chunks {
            let mut input = leftover.to_vec();
            input.extend_from_slice(chunk);
            let parsed = decoder.parse_messages(&input);
            assert!(parsed.desync.is_none());
            messages.extend(parsed.messages);
            leftover = parsed.leftover;
        }
        (messages, leftover)
    }

    #[test]
    fn test_every_split_offset() {
        for content_len in [0usize, 1, 4096] {
            let content: Bytes = (0..content_len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
            let (expected, bytes) = request_bytes(3, content);

            for split in 0..=bytes.len() {
                let mut decoder = MessageDecoder::new();
                let (messages, leftover) =
                    feed(&mut decoder, &[&bytes[..split], &bytes[split..]]);

                assert_eq!(messages.len(), 1, "split {} of {}", split, bytes.len());
                assert_eq!(messages[0], expected);
                assert!(leftover.is_empty());
                assert!(!decoder.is_mid_message());
            }
        }
    }

    #[test]
    fn test_concatenated_messages() {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for id in 1..=5u32 {
            let (message, bytes) = request_bytes(id, Bytes::from(vec![id as u8; id as usize * 10]));
            stream.extend_from_slice(&bytes);
            expected.push(message);
        }
        let mut response: Message = Response::new(PeerId(1), status::OK, "done").into();
        response.finalize(PeerId(2), None).unwrap();
        stream.extend_from_slice(&response.encode().unwrap());
        expected.push(response);

        let parsed = MessageDecoder::new().parse_messages(&stream);
        assert_eq!(parsed.messages, expected);
        assert!(parsed.leftover.is_empty());
        assert!(parsed.desync.is_none());
    }

    #[test]
    fn test_byte_at_a_time() {
        let (expected, bytes) = request_bytes(8, Bytes::from_static(b"payload"));
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();

        let mut decoder = MessageDecoder::new();
        let (messages, leftover) = feed(&mut decoder, &chunks);
        assert_eq!(messages, vec![expected]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_short_read_is_leftover() {
        let (_, bytes) = request_bytes(1, Bytes::new());
        let short = &bytes[..ENVELOPE_SIZE - 1];

        let parsed = MessageDecoder::new().parse_messages(short);
        assert!(parsed.messages.is_empty());
        assert_eq!(parsed.leftover.as_ref(), short);
    }

    #[test]
    fn test_desync_discards_rest_of_read() {
        let (first, good) = request_bytes(1, Bytes::from_static(b"ok"));
        let mut bad = Envelope::new(PeerId(1), PeerId(2));
        bad.content_length = u32::MAX;

        let mut stream = bytes::BytesMut::from(good.as_ref());
        bad.encode(&mut stream);
        stream.extend_from_slice(&good);

        let parsed = MessageDecoder::new().parse_messages(&stream);
        assert_eq!(parsed.messages, vec![first]);
        assert!(parsed.leftover.is_empty());
        assert_eq!(parsed.desync, Some(WireError::Size(u32::MAX as usize)));
    }

    #[test]
    fn test_unknown_flags_do_not_desync() {
        let (expected, bytes) = request_bytes(4, Bytes::from_static(b"x"));
        let mut bytes = bytes.to_vec();
        bytes[12] |= 0x40;

        let parsed = MessageDecoder::new().parse_messages(&bytes);
        assert!(parsed.desync.is_none());
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].envelope().flags.bits() & 0x4000, 0x4000);
        assert_eq!(parsed.messages[0].envelope().message_id, expected.envelope().message_id);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_limit_is_capped_at_field_width() {
        let decoder = MessageDecoder::with_max_content_length(usize::MAX);
        assert_eq!(decoder.max_content_length(), MAX_CONTENT_LENGTH);
    }

    #[test]
    fn test_content_length_limit() {
        let (_, bytes) = request_bytes(1, Bytes::from(vec![0u8; 128]));
        let parsed = MessageDecoder::with_max_content_length(64).parse_messages(&bytes);

        assert!(parsed.messages.is_empty());
        assert!(matches!(parsed.desync, Some(WireError::Size(_))));
    }

    #[test]
    fn test_malformed_body_keeps_stream_in_sync() {
        let mut envelope = Envelope::new(PeerId(1), PeerId(2));
        envelope.set_content_length(4).unwrap();
        let mut stream = bytes::BytesMut::new();
        envelope.encode(&mut stream);
        stream.extend_from_slice(b"junk");

        let (expected, good) = request_bytes(2, Bytes::new());
        stream.extend_from_slice(&good);

        let parsed = MessageDecoder::new().parse_messages(&stream);
        assert_eq!(parsed.messages, vec![expected]);
        assert!(parsed.desync.is_none());
    }

    #[test]
    fn test_reset_drops_partial_message() {
        let (expected, bytes) = request_bytes(1, Bytes::from_static(b"abcdef"));
        let mut decoder = MessageDecoder::new();

        let parsed = decoder.parse_messages(&bytes[..ENVELOPE_SIZE + 2]);
        assert!(parsed.messages.is_empty());
        assert!(decoder.is_mid_message());

        decoder.reset();
        let parsed = decoder.parse_messages(&bytes);
        assert_eq!(parsed.messages, vec![expected]);
    }
}
