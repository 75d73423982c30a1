//! # tds-codec
//!
//! Packet framing for the TDS protocol.
//!
//! This crate turns a raw byte stream into TDS packets and back. It knows
//! about packet headers, sizes and the end-of-message flag, and nothing
//! about what the payloads mean.
//!
//! ```text
//! bytes → TdsCodec → Packet → MessageAssembler → Message
//! Message → Message::into_packets → TdsCodec → bytes
//! ```
//!
//! [`TdsCodec`] implements `tokio_util`'s `Decoder` and `Encoder`, so it
//! can drive a [`PacketStream`] over any tokio transport or be called
//! directly on a `BytesMut` by a sans-IO pipeline.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use error::CodecError;
pub use framed::PacketStream;
pub use message::{Message, MessageAssembler, PacketSequence};
pub use packet_codec::{Packet, TdsCodec};
