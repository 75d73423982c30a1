//! Codec error types.

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing packets.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The header's length field is smaller than the header itself.
    #[error("invalid packet length {0}: shorter than the packet header")]
    InvalidLength(u16),

    /// Packet exceeds the negotiated maximum size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A decoder reported a packet without consuming its bytes.
    #[error("decoder returned a packet without consuming input")]
    NoProgress,

    /// The stream ended with a partial packet buffered.
    #[error("stream ended inside a packet ({buffered} bytes buffered)")]
    TruncatedStream {
        /// Bytes left in the read buffer.
        buffered: usize,
    },

    /// Header or payload failed protocol validation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
