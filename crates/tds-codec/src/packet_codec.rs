//! TDS packet codec.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// A TDS packet with header and payload.
///
/// The header's length field is recomputed on encode, so a packet built
/// by hand only needs the type, status and packet id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Total size on the wire including the header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// TDS packet codec for tokio-util framing.
///
/// Decoding never consumes input until a whole packet is buffered, so it
/// can be called again with the same buffer after more bytes arrive.
#[derive(Debug, Clone)]
pub struct TdsCodec {
    max_packet_size: usize,
}

impl TdsCodec {
    /// Create a codec accepting packets up to the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Limit the packet size in both directions.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.set_max_packet_size(size);
        self
    }

    /// Change the packet size limit, e.g. after the server renegotiates it.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE);
    }

    /// Current packet size limit.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode every complete packet in `src`.
    ///
    /// Fails with [`CodecError::NoProgress`] if a packet is produced without
    /// the buffer shrinking by at least that packet's declared length.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Packet>, CodecError> {
        let mut packets = Vec::new();
        loop {
            let before = src.len();
            let Some(packet) = self.decode(src)? else {
                break;
            };
            if before - src.len() < usize::from(packet.header.length) {
                return Err(CodecError::NoProgress);
            }
            packets.push(packet);
        }
        Ok(packets)
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = PacketHeader::peek_length(src) else {
            return Ok(None);
        };

        let length_usize = usize::from(length);
        if length_usize < PACKET_HEADER_SIZE {
            return Err(CodecError::InvalidLength(length));
        }
        if length_usize > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: length_usize,
                max: self.max_packet_size,
            });
        }

        if src.len() < length_usize {
            src.reserve(length_usize - src.len());
            return Ok(None);
        }

        let mut packet_bytes = src.split_to(length_usize).freeze();
        let header = PacketHeader::decode(&mut packet_bytes)?;

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = length_usize,
            is_eom = header.is_end_of_message(),
            packet_id = header.packet_id,
            "decoded TDS packet"
        );

        Ok(Some(Packet::new(header, packet_bytes)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::TruncatedStream {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = item.total_size();
        if total_length > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total_length,
                max: self.max_packet_size,
            });
        }

        dst.reserve(total_length);

        let mut header = item.header;
        header.length = total_length as u16;
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            is_eom = header.is_end_of_message(),
            packet_id = header.packet_id,
            "encoded TDS packet"
        );

        Ok(())
    }
}
