//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding or encoding TDS wire data.
///
/// [`ProtocolError::Incomplete`] is not a failure in the usual sense: it is
/// the signal that a decoder ran out of bytes and should be retried once more
/// input has arrived. Every other variant is fatal for the message being
/// decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes are buffered to finish decoding.
    #[error("incomplete data: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required by the decoder at the point it stopped.
        needed: usize,
        /// Bytes that were available.
        available: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown packet status bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Unknown token discriminator.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Column data type the row decoder has no read policy for.
    #[error("unsupported column data type: 0x{0:02X}")]
    UnsupportedDataType(u8),

    /// A ROW or NBCROW token arrived before any COLMETADATA.
    #[error("row data received before column metadata")]
    RowBeforeMetadata,

    /// A row was paired with a lookup table from another schema generation.
    #[error("row decoded against schema generation {actual}, lookup table is generation {expected}")]
    StaleMetadata {
        /// Generation of the lookup table.
        expected: u64,
        /// Generation the row was decoded against.
        actual: u64,
    },

    /// The final chunk of a message ended in the middle of a token.
    #[error("message ended mid-token with {buffered} bytes left undecoded")]
    TruncatedMessage {
        /// Number of bytes that could not be decoded.
        buffered: usize,
    },

    /// Unknown PRELOGIN option.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// String data that is not valid in its declared encoding.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// Structurally invalid token contents.
    #[error("malformed data: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Returns `true` if this is the "need more bytes" control signal.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    /// Check that `src` holds at least `needed` bytes.
    pub(crate) fn ensure(available: usize, needed: usize) -> Result<(), Self> {
        if available < needed {
            Err(Self::Incomplete { needed, available })
        } else {
            Ok(())
        }
    }
}
