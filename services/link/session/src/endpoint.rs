//! Protocol endpoint: framing on top of one transport.
//!
//! Combines the stream decoder (bytes to messages) with the outbound send
//! queue (messages to bytes) and stamps outgoing messages with this side's
//! peer ID and a local message counter.

use crate::error::{Result, SessionError};
use crate::send_queue::SendQueue;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use link_wire::{Message, MessageDecoder, PeerId};
use tracing::{debug, warn};

/// Counters for one endpoint
#[derive(Clone, Debug, Default)]
pub struct EndpointStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Messages fully parsed
    pub messages_in: u64,
    /// Messages queued for sending
    pub messages_out: u64,
    /// Reads discarded after an envelope parse failure
    pub desyncs: u64,
}

/// One connection's framing and send state
pub struct ProtocolEndpoint {
    transport: Box<dyn Transport>,
    decoder: MessageDecoder,
    leftover: Bytes,
    send_queue: SendQueue,
    next_message_id: u32,
    local_id: PeerId,
    stats: EndpointStats,
}

impl ProtocolEndpoint {
    /// Wrap a connected transport
    pub fn new(transport: Box<dyn Transport>, max_content_length: usize) -> Self {
        Self {
            transport,
            decoder: MessageDecoder::with_max_content_length(max_content_length),
            leftover: Bytes::new(),
            send_queue: SendQueue::new(),
            next_message_id: 1,
            local_id: PeerId::UNASSIGNED,
            stats: EndpointStats::default(),
        }
    }

    /// Peer ID stamped as the source of outgoing messages
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Set the source ID for messages finalized from now on
    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = id;
    }

    /// Endpoint counters
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    fn allocate_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Stamp a message for sending.
    ///
    /// Assigns the next local message ID when `assign_id` is set; responses keep
    /// the ID of the request they answer.
    pub fn finalize_message(&mut self, message: &mut Message, assign_id: bool) -> Result<()> {
        if message.is_finalized() {
            return Err(SessionError::Wire(link_wire::WireError::AlreadyFinalized));
        }
        let id = assign_id.then(|| self.allocate_message_id());
        message.finalize(self.local_id, id)?;
        Ok(())
    }

    /// Finalize and enqueue; returns the message ID on the wire
    pub fn finalize_and_send(&mut self, mut message: Message, assign_id: bool) -> Result<u32> {
        self.finalize_message(&mut message, assign_id)?;
        self.send_message(&message)?;
        Ok(message.envelope().message_id)
    }

    /// Serialize a message and append it to the send queue
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        let bytes = message.encode()?;
        debug!(
            "Queued message {} to {} ({} bytes)",
            message.envelope().message_id,
            message.envelope().destination,
            bytes.len()
        );
        self.stats.messages_out += 1;
        self.send_queue.push(bytes);
        Ok(())
    }

    /// One non-blocking write of the head of the send queue
    pub fn update_send(&mut self) -> Result<usize> {
        let written = self.send_queue.update_send(self.transport.as_mut())?;
        self.stats.bytes_out += written as u64;
        Ok(written)
    }

    /// Whether `update_send` still has work to do
    pub fn has_unsent_messages(&self) -> bool {
        self.send_queue.has_unsent()
    }

    /// Keep calling `update_send` until the queue drains or the socket would block
    pub fn flush(&mut self) -> Result<()> {
        while self.has_unsent_messages() {
            if self.update_send()? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Drain the transport and return every message completed by the new bytes
    pub fn receive_messages(&mut self) -> Result<Vec<Message>> {
        let received = self.transport.receive()?;
        if received.is_empty() {
            return Ok(Vec::new());
        }
        self.stats.bytes_in += received.len() as u64;

        let input = if self.leftover.is_empty() {
            received
        } else {
            let mut joined = BytesMut::with_capacity(self.leftover.len() + received.len());
            joined.extend_from_slice(&self.leftover);
            joined.extend_from_slice(&received);
            joined.freeze()
        };

        let parsed = self.decoder.parse_messages(&input);
        self.leftover = parsed.leftover;
        if let Some(e) = parsed.desync {
            warn!("Protocol desync on endpoint {}: {}", self.local_id, e);
            self.stats.desyncs += 1;
        }

        self.stats.messages_in += parsed.messages.len() as u64;
        Ok(parsed.messages)
    }
}

impl std::fmt::Debug for ProtocolEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEndpoint")
            .field("local_id", &self.local_id)
            .field("queued", &self.send_queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}
