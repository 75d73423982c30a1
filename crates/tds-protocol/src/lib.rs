//! # tds-protocol
//!
//! Wire-level building blocks of the Tabular Data Stream protocol.
//!
//! This crate is IO-agnostic: it turns bytes into packet headers and tokens
//! and turns request descriptions back into payload bytes. Framing over a
//! transport lives in `tds-codec`, connection handling in `tds-client`.
//!
//! ## Token parsing
//!
//! ```rust
//! use tds_protocol::{StreamingTokenParser, Token};
//!
//! let mut parser = StreamingTokenParser::new();
//! // DONE with no row count, split over two packets.
//! let first = parser.feed(&[0xFD, 0x00, 0x00, 0xC1], false).unwrap();
//! assert!(first.need_more);
//! let second = parser.feed(&[0x00, 0, 0, 0, 0, 0, 0, 0, 0], true).unwrap();
//! assert!(matches!(second.tokens[0], Token::Done(_)));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod collation;
pub mod error;
pub mod login7;
pub mod packet;
pub mod parser;
pub mod prelogin;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod version;

pub use collation::Collation;
pub use error::ProtocolError;
pub use login7::Login7;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use parser::{ParsedTokens, StreamingTokenParser};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption};
pub use sql_batch::{decode_sql_batch, encode_sql_batch, encode_sql_batch_with_transaction};
pub use token::{
    ColMetaData, ColumnDescriptor, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue,
    LoginAck, Order, RowData, ServerMessage, Token, TokenType, TypeInfo,
};
pub use types::{ColumnFlags, ReadPolicy, TypeId};
pub use version::{SqlServerVersion, TdsVersion};
