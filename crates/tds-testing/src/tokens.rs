//! Token stream builders.
//!
//! Responses are assembled token by token the way a server would write
//! them, so tests can exercise the parser against realistic byte layouts
//! without a live server.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::codec::{utf16_byte_len, write_b_varchar, write_us_varchar, write_utf16_string};
use tds_protocol::token::write_plp;
use tds_protocol::types::{MAX_LENGTH_MARKER, TypeId};
use tds_protocol::{Done, DoneStatus, EnvChangeType, TokenType};

/// Collation sent with character columns: LCID 0x0409, `SQL_Latin1_General_CP1_CI_AS`.
const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// `CURCMD` value servers report for a SELECT.
const CURCMD_SELECT: u16 = 0xC1;

/// Shape of a mock column on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// `INT` as `INTN(4)`.
    Int,
    /// `BIGINT` as `INTN(8)`.
    BigInt,
    /// `BIT` as `BITN(1)`.
    Bit,
    /// `FLOAT` as `FLTN(8)`.
    Float,
    /// `NVARCHAR(n)`, length in characters.
    NVarChar(u16),
    /// `NVARCHAR(MAX)`, sent as PLP.
    NVarCharMax,
    /// `VARBINARY(n)`.
    VarBinary(u16),
    /// `DECIMAL(precision, scale)`.
    Decimal(u8, u8),
    /// `DATETIME2(scale)`.
    DateTime2(u8),
}

/// Mock column definition.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Wire shape.
    pub kind: ColumnKind,
    /// Whether the column is nullable.
    pub nullable: bool,
}

impl MockColumn {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    /// Create an INT column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Int)
    }

    /// Create a BIGINT column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::BigInt)
    }

    /// Create a BIT column.
    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Bit)
    }

    /// Create a FLOAT column.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Float)
    }

    /// Create an NVARCHAR column of `max_len` characters.
    pub fn nvarchar(name: impl Into<String>, max_len: u16) -> Self {
        Self::new(name, ColumnKind::NVarChar(max_len))
    }

    /// Create an NVARCHAR(MAX) column.
    pub fn nvarchar_max(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::NVarCharMax)
    }

    /// Create a VARBINARY column.
    pub fn varbinary(name: impl Into<String>, max_len: u16) -> Self {
        Self::new(name, ColumnKind::VarBinary(max_len))
    }

    /// Create a DECIMAL column.
    pub fn decimal(name: impl Into<String>, precision: u8, scale: u8) -> Self {
        Self::new(name, ColumnKind::Decimal(precision, scale))
    }

    /// Create a DATETIME2 column.
    pub fn datetime2(name: impl Into<String>, scale: u8) -> Self {
        Self::new(name, ColumnKind::DateTime2(scale))
    }

    /// Set nullable flag.
    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    fn encode_metadata(&self, dst: &mut BytesMut) {
        dst.put_u32_le(0); // user type
        dst.put_u16_le(u16::from(self.nullable));
        match self.kind {
            ColumnKind::Int => {
                dst.put_u8(TypeId::IntN as u8);
                dst.put_u8(4);
            }
            ColumnKind::BigInt => {
                dst.put_u8(TypeId::IntN as u8);
                dst.put_u8(8);
            }
            ColumnKind::Bit => {
                dst.put_u8(TypeId::BitN as u8);
                dst.put_u8(1);
            }
            ColumnKind::Float => {
                dst.put_u8(TypeId::FloatN as u8);
                dst.put_u8(8);
            }
            ColumnKind::NVarChar(len) => {
                dst.put_u8(TypeId::NVarChar as u8);
                dst.put_u16_le(len.saturating_mul(2));
                dst.put_slice(&DEFAULT_COLLATION);
            }
            ColumnKind::NVarCharMax => {
                dst.put_u8(TypeId::NVarChar as u8);
                dst.put_u16_le(MAX_LENGTH_MARKER as u16);
                dst.put_slice(&DEFAULT_COLLATION);
            }
            ColumnKind::VarBinary(len) => {
                dst.put_u8(TypeId::BigVarBinary as u8);
                dst.put_u16_le(len);
            }
            ColumnKind::Decimal(precision, scale) => {
                dst.put_u8(TypeId::DecimalN as u8);
                dst.put_u8(17);
                dst.put_u8(precision);
                dst.put_u8(scale);
            }
            ColumnKind::DateTime2(scale) => {
                dst.put_u8(TypeId::DateTime2 as u8);
                dst.put_u8(scale);
            }
        }
        write_b_varchar(dst, &self.name);
    }
}

/// A value in a mock row.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 64-bit float.
    Double(f64),
    /// String value.
    String(String),
    /// Binary data.
    Binary(Vec<u8>),
    /// Unscaled decimal; the column supplies the scale.
    Decimal(i128),
    /// Days since 0001-01-01 and time ticks at the column's scale.
    DateTime2 {
        /// Days since 0001-01-01.
        days: u32,
        /// Ticks of 10^-scale seconds since midnight.
        ticks: u64,
    },
}

impl ScalarValue {
    fn encode(&self, kind: ColumnKind, dst: &mut BytesMut) {
        match (kind, self) {
            (ColumnKind::NVarChar(_) | ColumnKind::VarBinary(_), Self::Null) => {
                dst.put_u16_le(0xFFFF);
            }
            (ColumnKind::NVarCharMax, Self::Null) => write_plp(dst, None, PLP_CHUNK),
            (_, Self::Null) => dst.put_u8(0),

            (ColumnKind::Int, Self::Int(v)) => {
                dst.put_u8(4);
                dst.put_i32_le(*v);
            }
            (ColumnKind::BigInt, Self::BigInt(v)) => {
                dst.put_u8(8);
                dst.put_i64_le(*v);
            }
            (ColumnKind::BigInt, Self::Int(v)) => {
                dst.put_u8(8);
                dst.put_i64_le(i64::from(*v));
            }
            (ColumnKind::Bit, Self::Bool(v)) => {
                dst.put_u8(1);
                dst.put_u8(u8::from(*v));
            }
            (ColumnKind::Float, Self::Double(v)) => {
                dst.put_u8(8);
                dst.put_f64_le(*v);
            }
            (ColumnKind::NVarChar(_), Self::String(s)) => {
                dst.put_u16_le(utf16_byte_len(s) as u16);
                write_utf16_string(dst, s);
            }
            (ColumnKind::NVarCharMax, Self::String(s)) => {
                let mut data = BytesMut::new();
                write_utf16_string(&mut data, s);
                write_plp(dst, Some(&data), PLP_CHUNK);
            }
            (ColumnKind::VarBinary(_), Self::Binary(data)) => {
                dst.put_u16_le(data.len() as u16);
                dst.put_slice(data);
            }
            (ColumnKind::Decimal(..), Self::Decimal(unscaled)) => {
                dst.put_u8(17);
                dst.put_u8(u8::from(*unscaled >= 0));
                dst.put_u128_le(unscaled.unsigned_abs());
            }
            (ColumnKind::DateTime2(scale), Self::DateTime2 { days, ticks }) => {
                let time_len = time_length(scale);
                dst.put_u8((time_len + 3) as u8);
                dst.put_slice(&ticks.to_le_bytes()[..time_len]);
                dst.put_slice(&days.to_le_bytes()[..3]);
            }
            (kind, value) => {
                tracing::warn!(?kind, ?value, "value does not fit column, sending NULL");
                Self::Null.encode(kind, dst);
            }
        }
    }
}

/// Chunk size used for PLP values.
const PLP_CHUNK: usize = 16;

/// Byte width of a time value at `scale`.
fn time_length(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

/// Builds a response token stream.
///
/// ```rust,ignore
/// let payload = TokenStreamBuilder::new()
///     .col_metadata(&[MockColumn::int("id")])
///     .row(&[ScalarValue::Int(1)])
///     .done(1)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct TokenStreamBuilder {
    buf: BytesMut,
    columns: Vec<MockColumn>,
}

impl TokenStreamBuilder {
    /// Start an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// COLMETADATA for `columns`; later rows are encoded against them.
    #[must_use]
    pub fn col_metadata(mut self, columns: &[MockColumn]) -> Self {
        self.buf.put_u8(TokenType::ColMetaData as u8);
        self.buf.put_u16_le(columns.len() as u16);
        for column in columns {
            column.encode_metadata(&mut self.buf);
        }
        self.columns = columns.to_vec();
        self
    }

    /// ROW with one value per column.
    #[must_use]
    pub fn row(mut self, values: &[ScalarValue]) -> Self {
        self.buf.put_u8(TokenType::Row as u8);
        for (column, value) in self.columns.iter().zip(values) {
            value.encode(column.kind, &mut self.buf);
        }
        self
    }

    /// NBCROW: nulls go in the bitmap instead of the value list.
    #[must_use]
    pub fn nbc_row(mut self, values: &[ScalarValue]) -> Self {
        self.buf.put_u8(TokenType::NbcRow as u8);
        let mut bitmap = vec![0u8; self.columns.len().div_ceil(8)];
        for (i, value) in values.iter().enumerate() {
            if *value == ScalarValue::Null {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        self.buf.put_slice(&bitmap);
        for (column, value) in self.columns.iter().zip(values) {
            if *value != ScalarValue::Null {
                value.encode(column.kind, &mut self.buf);
            }
        }
        self
    }

    /// Final DONE with a row count.
    #[must_use]
    pub fn done(self, row_count: u64) -> Self {
        self.done_token(TokenType::Done, DoneStatus::COUNT, row_count)
    }

    /// DONE marking a failed statement.
    #[must_use]
    pub fn done_error(self) -> Self {
        self.done_token(TokenType::Done, DoneStatus::ERROR, 0)
    }

    /// DONE with explicit status flags and no row count.
    #[must_use]
    pub fn done_status(self, status: DoneStatus) -> Self {
        self.done_token(TokenType::Done, status, 0)
    }

    /// DONEINPROC with a row count, more results following.
    #[must_use]
    pub fn done_in_proc(self, row_count: u64) -> Self {
        self.done_token(
            TokenType::DoneInProc,
            DoneStatus::COUNT | DoneStatus::MORE,
            row_count,
        )
    }

    /// DONEPROC closing a stored procedure.
    #[must_use]
    pub fn done_proc(self) -> Self {
        self.done_token(TokenType::DoneProc, DoneStatus::empty(), 0)
    }

    fn done_token(mut self, token: TokenType, status: DoneStatus, row_count: u64) -> Self {
        self.buf.put_u8(token as u8);
        Done {
            status,
            cur_cmd: CURCMD_SELECT,
            row_count,
        }
        .encode(&mut self.buf);
        self
    }

    /// RETURNSTATUS.
    #[must_use]
    pub fn return_status(mut self, status: i32) -> Self {
        self.buf.put_u8(TokenType::ReturnStatus as u8);
        self.buf.put_i32_le(status);
        self
    }

    /// ERROR token.
    #[must_use]
    pub fn error(self, number: i32, class: u8, message: &str) -> Self {
        self.message(TokenType::Error, number, class, message)
    }

    /// INFO token.
    #[must_use]
    pub fn info(self, number: i32, message: &str) -> Self {
        self.message(TokenType::Info, number, 0, message)
    }

    fn message(mut self, token: TokenType, number: i32, class: u8, message: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_i32_le(number);
        body.put_u8(1); // state
        body.put_u8(class);
        write_us_varchar(&mut body, message);
        write_b_varchar(&mut body, "MockSQLServer");
        write_b_varchar(&mut body, "");
        body.put_i32_le(1);
        self.length_prefixed(token, &body);
        self
    }

    /// LOGINACK for TDS `tds_version` (as sent on the wire).
    #[must_use]
    pub fn login_ack(mut self, prog_name: &str, tds_version: u32) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(1); // interface: SQL
        body.put_u32(tds_version);
        write_b_varchar(&mut body, prog_name);
        body.put_u32(0x1000_0000);
        self.length_prefixed(TokenType::LoginAck, &body);
        self
    }

    /// ENVCHANGE with string values (database, language, packet size).
    #[must_use]
    pub fn env_change(mut self, env_type: EnvChangeType, new: &str, old: &str) -> Self {
        let code = match env_type {
            EnvChangeType::Database => 1,
            EnvChangeType::Language => 2,
            EnvChangeType::CharacterSet => 3,
            EnvChangeType::PacketSize => 4,
            EnvChangeType::Other(code) => code,
            other => {
                tracing::warn!(?other, "not a string environment change");
                return self;
            }
        };
        let mut body = BytesMut::new();
        body.put_u8(code);
        write_b_varchar(&mut body, new);
        write_b_varchar(&mut body, old);
        self.length_prefixed(TokenType::EnvChange, &body);
        self
    }

    /// Append pre-encoded bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    fn length_prefixed(&mut self, token: TokenType, body: &[u8]) -> &mut Self {
        self.buf.put_u8(token as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(body);
        self
    }

    /// Finish the stream.
    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}
