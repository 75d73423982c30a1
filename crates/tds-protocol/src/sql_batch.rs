//! SQL batch payload encoding.
//!
//! A SQL batch payload is the ALL_HEADERS block followed by the SQL text as
//! UTF-16LE. The only header sent is the transaction descriptor.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{read_u32_le, write_utf16_string};
use crate::error::ProtocolError;

/// Size of ALL_HEADERS carrying just the transaction descriptor header.
pub const ALL_HEADERS_SIZE: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// Encode a SQL batch outside any explicit transaction.
///
/// ```
/// use tds_protocol::sql_batch::encode_sql_batch;
///
/// let payload = encode_sql_batch("SELECT 1");
/// assert_eq!(payload.len(), 22 + 16);
/// ```
#[must_use]
pub fn encode_sql_batch(sql: &str) -> Bytes {
    encode_sql_batch_with_transaction(sql, 0)
}

/// Encode a SQL batch under the transaction descriptor the server handed
/// out in a BeginTransaction environment change.
#[must_use]
pub fn encode_sql_batch_with_transaction(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_SIZE + sql.len() * 2);

    buf.put_u32_le(ALL_HEADERS_SIZE as u32);
    buf.put_u32_le(18); // header length
    buf.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
    buf.put_u64_le(transaction_descriptor);
    buf.put_u32_le(1); // outstanding requests

    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

/// Recover the SQL text from a batch payload, skipping ALL_HEADERS.
pub fn decode_sql_batch(payload: &[u8]) -> Result<String, ProtocolError> {
    let mut src = payload;
    let headers_len = read_u32_le(&mut src)? as usize;
    let text = payload.get(headers_len..).ok_or_else(|| {
        ProtocolError::Malformed(format!(
            "ALL_HEADERS length {headers_len} exceeds batch of {} bytes",
            payload.len()
        ))
    })?;
    if text.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(
            "odd byte count in UTF-16 batch text".into(),
        ));
    }
    let units: Vec<u16> = text
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}
