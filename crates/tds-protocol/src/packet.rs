//! TDS packet header.
//!
//! Every packet on the wire starts with the same 8-byte header:
//!
//! ```text
//! +------+--------+-----------+-----------+-----------+--------+
//! | type | status | length BE | spid BE   | packet id | window |
//! |  u8  |   u8   |   u16     |   u16     |    u8     |   u8   |
//! +------+--------+-----------+-----------+-----------+--------+
//! ```
//!
//! `length` counts the header itself, so a valid packet is never shorter
//! than [`PACKET_HEADER_SIZE`]. Checking the length against the negotiated
//! packet size is the framer's job.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest length the header's `u16` length field can express.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Smallest packet size a server will negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Packet size used until the server announces another.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Kind of message a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Server reply carrying a token stream.
    TabularResult = 0x04,
    /// Attention (cancel) signal.
    Attention = 0x06,
    /// LOGIN7 request.
    Tds7Login = 0x10,
    /// SSPI exchange.
    Sspi = 0x11,
    /// PRELOGIN exchange. Also carries TLS handshake records during the
    /// encryption upgrade.
    PreLogin = 0x12,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Self::SqlBatch,
            0x03 => Self::Rpc,
            0x04 => Self::TabularResult,
            0x06 => Self::Attention,
            0x10 => Self::Tds7Login,
            0x11 => Self::Sspi,
            0x12 => Self::PreLogin,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        })
    }
}

bitflags! {
    /// Status byte of a packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// More packets of this message follow.
        const NORMAL = 0x00;
        /// Last packet of the message.
        const END_OF_MESSAGE = 0x01;
        /// The server should ignore this message.
        const IGNORE_EVENT = 0x02;
        /// Reset session state before running the request.
        const RESET_CONNECTION = 0x08;
        /// Like `RESET_CONNECTION`, keeping the transaction.
        const RESET_CONNECTION_SKIP_TRAN = 0x10;
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message kind.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Packet length including this header.
    pub length: u16,
    /// Server process id; zero from the client.
    pub spid: u16,
    /// Per-connection sequence number, wrapping at 255.
    pub packet_id: u8,
    /// Unused, always zero.
    pub window: u8,
}

impl PacketHeader {
    /// Header with zero length, spid and packet id.
    ///
    /// The framer fills in the length when the packet is written.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Same header with another sequence number.
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Whether this packet ends its message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Read the length field of a buffered header without consuming it.
    ///
    /// Returns `None` until a full header is buffered.
    #[must_use]
    pub fn peek_length(src: &[u8]) -> Option<u16> {
        match src {
            [_, _, hi, lo, _, _, _, _, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Interpret the eight header bytes.
    pub fn from_bytes(raw: [u8; PACKET_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let [kind, status, len_hi, len_lo, spid_hi, spid_lo, packet_id, window] = raw;
        Ok(Self {
            packet_type: PacketType::try_from(kind)?,
            status: PacketStatus::from_bits(status)
                .ok_or(ProtocolError::InvalidPacketStatus(status))?,
            length: u16::from_be_bytes([len_hi, len_lo]),
            spid: u16::from_be_bytes([spid_hi, spid_lo]),
            packet_id,
            window,
        })
    }

    /// The eight header bytes as they go on the wire.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let [len_hi, len_lo] = self.length.to_be_bytes();
        let [spid_hi, spid_lo] = self.spid.to_be_bytes();
        [
            self.packet_type as u8,
            self.status.bits(),
            len_hi,
            len_lo,
            spid_hi,
            spid_lo,
            self.packet_id,
            self.window,
        ]
    }

    /// Consume a header from `src`.
    ///
    /// Fewer than eight buffered bytes is reported as incomplete and
    /// consumes nothing.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ProtocolError::ensure(src.remaining(), PACKET_HEADER_SIZE)?;
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        src.copy_to_slice(&mut raw);
        Self::from_bytes(raw)
    }

    /// Append the header to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.to_bytes());
    }
}
