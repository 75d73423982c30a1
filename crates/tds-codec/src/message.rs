//! TDS message splitting and reassembly.
//!
//! A message spans one or more packets; only the last carries the
//! `END_OF_MESSAGE` status. Outbound messages are split by
//! [`Message::into_packets`], inbound packets are glued back together by
//! [`MessageAssembler`].

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::packet_codec::Packet;

/// Per-connection packet sequence counter.
///
/// Ids start at 1 and wrap from 255 back to 1.
#[derive(Debug, Clone)]
pub struct PacketSequence {
    next: u8,
}

impl PacketSequence {
    /// Start a fresh sequence.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next packet id.
    pub fn next_id(&mut self) -> u8 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Id the next packet will get.
    #[must_use]
    pub fn peek(&self) -> u8 {
        self.next
    }
}

impl Default for PacketSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete TDS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The packet type of this message.
    pub packet_type: PacketType,
    /// The complete message payload (all packets combined).
    pub payload: Bytes,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Get the message payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the message is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Split into packets of at most `max_packet_size` bytes each.
    ///
    /// An empty payload still yields one (end-of-message) packet.
    #[must_use]
    pub fn into_packets(self, max_packet_size: usize, sequence: &mut PacketSequence) -> Vec<Packet> {
        let chunk_size = max_packet_size.saturating_sub(PACKET_HEADER_SIZE).max(1);
        let count = self.payload.len().div_ceil(chunk_size).max(1);
        let mut packets = Vec::with_capacity(count);

        let mut remaining = self.payload;
        for index in 0..count {
            let take = remaining.len().min(chunk_size);
            let chunk = remaining.split_to(take);
            let status = if index + 1 == count {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let header = PacketHeader::new(self.packet_type, status, 0)
                .with_packet_id(sequence.next_id());
            packets.push(Packet::new(header, chunk));
        }

        tracing::trace!(
            packet_type = ?self.packet_type,
            packets = packets.len(),
            "split message into packets"
        );

        packets
    }
}

/// Reassembles packets into complete messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    packet_type: Option<PacketType>,
    packet_count: usize,
}

impl MessageAssembler {
    /// Create a new message assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a packet, returning the message it completes, if any.
    pub fn push(&mut self, packet: Packet) -> Option<Message> {
        let packet_type = *self.packet_type.get_or_insert(packet.header.packet_type);
        self.buffer.extend_from_slice(&packet.payload);
        self.packet_count += 1;

        tracing::trace!(
            packet_type = ?packet_type,
            packet_count = self.packet_count,
            buffer_len = self.buffer.len(),
            is_eom = packet.is_end_of_message(),
            "assembling message"
        );

        if !packet.is_end_of_message() {
            return None;
        }

        self.packet_type = None;
        self.packet_count = 0;
        Some(Message {
            packet_type,
            payload: self.buffer.split().freeze(),
        })
    }

    /// Check if the assembler has partial data buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.packet_type.is_some()
    }

    /// Get the number of packets accumulated so far.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Clear any partial message data.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.packet_type = None;
        self.packet_count = 0;
    }
}
