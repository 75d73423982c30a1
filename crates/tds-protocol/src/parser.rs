//! Resumable token stream parser.
//!
//! A response message can be split across any number of packets, and a
//! token can straddle a packet boundary. [`StreamingTokenParser`] buffers
//! whatever it could not decode yet and resumes on the next [`feed`].
//!
//! The parser owns two pieces of sticky state: the byte accumulator and the
//! most recent column metadata, versioned by a generation counter. Rows are
//! decoded against the metadata in force when they arrive.
//!
//! [`feed`]: StreamingTokenParser::feed

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::token::{
    ColMetaData, Done, EnvChange, LoginAck, Order, RowData, ServerMessage, Token, TokenType,
    decode_return_status,
};

/// Result of one [`StreamingTokenParser::feed`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTokens {
    /// Tokens decoded by this call, in wire order.
    pub tokens: Vec<Token>,
    /// A partial token is buffered and more bytes are required.
    pub need_more: bool,
}

/// Stateful, resumable token parser for one connection.
#[derive(Debug, Default)]
pub struct StreamingTokenParser {
    buffer: BytesMut,
    metadata: Option<Arc<ColMetaData>>,
    generation: u64,
}

impl StreamingTokenParser {
    /// Create a parser with no buffered bytes and no metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and decode as many whole tokens as possible.
    ///
    /// When `is_final` is set the bytes end a message, so a partial token
    /// left over is a [`ProtocolError::TruncatedMessage`] instead of a
    /// request for more input. Any error other than running out of bytes is
    /// returned immediately; tokens decoded earlier in the same call are
    /// dropped with it.
    pub fn feed(&mut self, bytes: &[u8], is_final: bool) -> Result<ParsedTokens, ProtocolError> {
        self.buffer.extend_from_slice(bytes);

        let mut cursor: Bytes = self.buffer.split().freeze();
        let mut tokens = Vec::new();
        let mut need_more = false;

        while cursor.has_remaining() {
            let checkpoint = cursor.clone();
            match self.next_token(&mut cursor) {
                Ok(token) => tokens.push(token),
                Err(e) if e.is_incomplete() => {
                    cursor = checkpoint;
                    need_more = true;
                    break;
                }
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }

        if need_more && is_final {
            let buffered = cursor.len();
            return Err(ProtocolError::TruncatedMessage { buffered });
        }
        self.buffer.extend_from_slice(&cursor);

        tracing::trace!(
            tokens = tokens.len(),
            buffered = self.buffer.len(),
            need_more,
            "parsed token batch"
        );

        Ok(ParsedTokens { tokens, need_more })
    }

    /// Metadata rows are currently decoded against.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<ColMetaData>> {
        self.metadata.as_ref()
    }

    /// Generation of the current metadata; 0 before any has been seen.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of bytes buffered waiting for the rest of a token.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_token(&mut self, src: &mut Bytes) -> Result<Token, ProtocolError> {
        let token_type = TokenType::from_u8(src.get_u8())?;

        let token = match token_type {
            TokenType::ColMetaData => {
                let decoded = ColMetaData::decode(src)?;
                self.generation += 1;
                let metadata = Arc::new(decoded.with_generation(self.generation));
                self.metadata = Some(Arc::clone(&metadata));
                Token::ColMetaData(metadata)
            }
            TokenType::Row => Token::Row(RowData::decode(src, self.current_metadata()?)?),
            TokenType::NbcRow => Token::NbcRow(RowData::decode_nbc(src, self.current_metadata()?)?),
            TokenType::Done => Token::Done(Done::decode(src)?),
            TokenType::DoneProc => Token::DoneProc(Done::decode(src)?),
            TokenType::DoneInProc => Token::DoneInProc(Done::decode(src)?),
            TokenType::ReturnStatus => Token::ReturnStatus(decode_return_status(src)?),
            TokenType::Error => Token::Error(ServerMessage::decode(src)?),
            TokenType::Info => Token::Info(ServerMessage::decode(src)?),
            TokenType::LoginAck => Token::LoginAck(LoginAck::decode(src)?),
            TokenType::EnvChange => Token::EnvChange(EnvChange::decode(src)?),
            TokenType::Order => Token::Order(Order::decode(src)?),
        };

        Ok(token)
    }

    fn current_metadata(&self) -> Result<&ColMetaData, ProtocolError> {
        self.metadata
            .as_deref()
            .ok_or(ProtocolError::RowBeforeMetadata)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::write_b_varchar;
    use crate::token::{DoneStatus, write_plp};
    use bytes::BufMut;
    use proptest::prelude::*;

    /// COLMETADATA with INT `id` and NVARCHAR(MAX) `body`.
    fn colmetadata(buf: &mut BytesMut) {
        buf.put_u8(0x81);
        buf.put_u16_le(2);
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u8(0x38);
        write_b_varchar(buf, "id");
        buf.put_u32_le(0);
        buf.put_u16_le(1);
        buf.put_u8(0xE7);
        buf.put_u16_le(0xFFFF);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        write_b_varchar(buf, "body");
    }

    fn row(buf: &mut BytesMut, id: i32, body: Option<&[u8]>, chunk: usize) {
        buf.put_u8(0xD1);
        buf.put_i32_le(id);
        write_plp(buf, body, chunk);
    }

    fn done(buf: &mut BytesMut, rows: u64) {
        buf.put_u8(0xFD);
        Done {
            status: DoneStatus::COUNT,
            cur_cmd: 0xC1,
            row_count: rows,
        }
        .encode(buf);
    }

    fn result_set() -> Bytes {
        let mut buf = BytesMut::new();
        colmetadata(&mut buf);
        row(&mut buf, 1, Some(b"first"), 2);
        row(&mut buf, 2, None, 1);
        row(&mut buf, 3, Some(b""), 4);
        done(&mut buf, 3);
        buf.freeze()
    }

    #[test]
    fn test_parse_whole_message() {
        let mut parser = StreamingTokenParser::new();
        let parsed = parser.feed(&result_set(), true).unwrap();
        assert!(!parsed.need_more);
        assert_eq!(parsed.tokens.len(), 5);

        let Token::Row(first) = &parsed.tokens[1] else {
            panic!("expected row, got {:?}", parsed.tokens[1]);
        };
        assert_eq!(first.generation, 1);
        assert_eq!(first.columns[1].as_deref(), Some(&b"first"[..]));

        let Token::Row(second) = &parsed.tokens[2] else {
            panic!("expected row");
        };
        assert!(second.is_null(1));

        let Token::Row(third) = &parsed.tokens[3] else {
            panic!("expected row");
        };
        assert_eq!(third.columns[1].as_deref(), Some(&b""[..]));

        assert!(matches!(parsed.tokens[4], Token::Done(d) if d.rows_affected() == Some(3)));
    }

    #[test]
    fn test_split_token_is_buffered() {
        let data = result_set();
        let mut parser = StreamingTokenParser::new();

        // Cut inside the first row.
        let cut = data.len() - 40;
        let first = parser.feed(&data[..cut], false).unwrap();
        assert!(first.need_more);
        assert!(parser.buffered() > 0);

        let second = parser.feed(&data[cut..], true).unwrap();
        assert!(!second.need_more);
        assert_eq!(first.tokens.len() + second.tokens.len(), 5);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_final_chunk_mid_token_is_truncation() {
        let data = result_set();
        let mut parser = StreamingTokenParser::new();
        let err = parser.feed(&data[..data.len() - 3], true).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedMessage { buffered } if buffered > 0));
    }

    #[test]
    fn test_row_before_metadata() {
        let mut buf = BytesMut::new();
        row(&mut buf, 1, None, 1);
        let mut parser = StreamingTokenParser::new();
        assert_eq!(
            parser.feed(&buf, false),
            Err(ProtocolError::RowBeforeMetadata)
        );

        let mut parser = StreamingTokenParser::new();
        assert_eq!(
            parser.feed(&[0xD2, 0x00], false),
            Err(ProtocolError::RowBeforeMetadata)
        );
    }

    #[test]
    fn test_unknown_token_is_fatal_not_stalled() {
        let mut parser = StreamingTokenParser::new();
        assert_eq!(
            parser.feed(&[0x42, 0x00, 0x00], false),
            Err(ProtocolError::InvalidTokenType(0x42))
        );
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_new_metadata_bumps_generation() {
        let mut buf = BytesMut::new();
        colmetadata(&mut buf);
        row(&mut buf, 1, None, 1);
        colmetadata(&mut buf);
        row(&mut buf, 2, None, 1);

        let mut parser = StreamingTokenParser::new();
        let parsed = parser.feed(&buf, true).unwrap();
        let generations: Vec<u64> = parsed
            .tokens
            .iter()
            .filter_map(|t| match t {
                Token::Row(r) => Some(r.generation),
                _ => None,
            })
            .collect();
        assert_eq!(generations, vec![1, 2]);
        assert_eq!(parser.generation(), 2);
        assert_eq!(parser.metadata().unwrap().generation, 2);
    }

    #[test]
    fn test_metadata_persists_across_feeds() {
        let mut parser = StreamingTokenParser::new();
        let mut meta = BytesMut::new();
        colmetadata(&mut meta);
        parser.feed(&meta, true).unwrap();

        let mut rows = BytesMut::new();
        row(&mut rows, 9, Some(b"x"), 1);
        let parsed = parser.feed(&rows, true).unwrap();
        assert!(matches!(&parsed.tokens[0], Token::Row(r) if r.generation == 1));
    }

    #[test]
    fn test_variant_column_does_not_fail_the_batch() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u16_le(2);
        buf.put_u32_le(0);
        buf.put_u16_le(1);
        buf.put_u8(0x62);
        buf.put_u32_le(8016);
        write_b_varchar(&mut buf, "v");
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u8(0x38);
        write_b_varchar(&mut buf, "id");
        // Variant holding INT 1, then id 7.
        buf.put_u8(0xD1);
        buf.put_u32_le(6);
        buf.put_slice(&[0x38, 0, 1, 0, 0, 0]);
        buf.put_i32_le(7);
        done(&mut buf, 1);

        let parsed = StreamingTokenParser::new().feed(&buf, true).unwrap();
        let Token::Row(row) = &parsed.tokens[1] else {
            panic!("expected row, got {:?}", parsed.tokens[1]);
        };
        assert_eq!(row.columns[1].as_deref(), Some(&[7, 0, 0, 0][..]));
        assert!(matches!(parsed.tokens[2], Token::Done(_)));
    }

    proptest! {
        #[test]
        fn prop_byte_by_byte_matches_whole(chunk in 1usize..64) {
            let data = result_set();
            let whole = StreamingTokenParser::new().feed(&data, true).unwrap().tokens;

            let mut parser = StreamingTokenParser::new();
            let mut pieced = Vec::new();
            let pieces: Vec<&[u8]> = data.chunks(chunk).collect();
            for (i, piece) in pieces.iter().enumerate() {
                let parsed = parser.feed(piece, i + 1 == pieces.len()).unwrap();
                pieced.extend(parsed.tokens);
            }
            prop_assert_eq!(pieced, whole);
        }

        #[test]
        fn prop_plp_chunking_roundtrip(
            value in proptest::collection::vec(any::<u8>(), 0..300),
            chunk in 1usize..50,
        ) {
            let mut buf = BytesMut::new();
            colmetadata(&mut buf);
            row(&mut buf, 7, Some(&value), chunk);

            let parsed = StreamingTokenParser::new().feed(&buf, true).unwrap();
            let Token::Row(decoded) = &parsed.tokens[1] else {
                return Err(TestCaseError::fail("expected a row"));
            };
            prop_assert_eq!(decoded.columns[1].as_deref(), Some(&value[..]));
        }

        #[test]
        fn prop_plp_null_ignores_trailing(trailing in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut buf = BytesMut::new();
            buf.put_u64_le(u64::MAX);
            buf.put_slice(&trailing);
            let mut cursor = buf.freeze();
            prop_assert_eq!(crate::token::read_plp(&mut cursor).unwrap(), None);
            prop_assert_eq!(cursor.len(), trailing.len());
        }
    }
}
