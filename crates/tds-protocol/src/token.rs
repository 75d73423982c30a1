//! TDS token definitions and per-token decoders.
//!
//! Tokens are the units of a response message's payload. Each begins with a
//! one-byte discriminator followed by a token-specific body. The decoders in
//! this module are pure: they take a byte cursor (and, for rows, the column
//! metadata in force) and either return a token or an error. A
//! [`ProtocolError::Incomplete`] result means the cursor ended inside the
//! token, and the caller is expected to retry from the token start once more
//! bytes have been buffered. Stateful parsing across packets lives in
//! [`crate::parser`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{read_b_varchar, read_bytes, read_u8, read_u16_le, read_u32_le, read_u64_le, read_us_varchar};
use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::types::{ColumnFlags, MAX_TIME_SCALE, ReadPolicy, TypeId};
use crate::version::TdsVersion;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x79 => Ok(Self::ReturnStatus),
            0x81 => Ok(Self::ColMetaData),
            0xA9 => Ok(Self::Order),
            0xAA => Ok(Self::Error),
            0xAB => Ok(Self::Info),
            0xAD => Ok(Self::LoginAck),
            0xD1 => Ok(Self::Row),
            0xD2 => Ok(Self::NbcRow),
            0xE3 => Ok(Self::EnvChange),
            0xFD => Ok(Self::Done),
            0xFE => Ok(Self::DoneProc),
            0xFF => Ok(Self::DoneInProc),
            _ => Err(ProtocolError::InvalidTokenType(value)),
        }
    }
}

/// Parsed TDS token.
///
/// Closed set: every token kind the parser understands has exactly one
/// variant, and consumers dispatch with an exhaustive `match`.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Column metadata describing the result set that follows.
    ColMetaData(Arc<ColMetaData>),
    /// Row data.
    Row(RowData),
    /// Null bitmap compressed row.
    NbcRow(RowData),
    /// Completion of a SQL statement.
    Done(Done),
    /// Completion of a stored procedure.
    DoneProc(Done),
    /// Completion of a statement within a stored procedure.
    DoneInProc(Done),
    /// Return status of a stored procedure.
    ReturnStatus(i32),
    /// Error message from the server.
    Error(ServerMessage),
    /// Informational message from the server.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Column ordering of the current result set.
    Order(Order),
}

impl Token {
    /// The wire discriminator of this token.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::ColMetaData(_) => TokenType::ColMetaData,
            Self::Row(_) => TokenType::Row,
            Self::NbcRow(_) => TokenType::NbcRow,
            Self::Done(_) => TokenType::Done,
            Self::DoneProc(_) => TokenType::DoneProc,
            Self::DoneInProc(_) => TokenType::DoneInProc,
            Self::ReturnStatus(_) => TokenType::ReturnStatus,
            Self::Error(_) => TokenType::Error,
            Self::Info(_) => TokenType::Info,
            Self::LoginAck(_) => TokenType::LoginAck,
            Self::EnvChange(_) => TokenType::EnvChange,
            Self::Order(_) => TokenType::Order,
        }
    }
}

// =============================================================================
// Column metadata
// =============================================================================

/// Column metadata token.
///
/// Each decoded instance is stamped with a schema generation by the parser.
/// Rows remember the generation they were decoded against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColMetaData {
    /// Schema generation this metadata belongs to.
    pub generation: u64,
    /// Column definitions, in ordinal order.
    pub columns: Vec<ColumnDescriptor>,
}

/// Column definition within metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Column name (may be empty for computed expressions).
    pub name: String,
    /// Wire data type.
    pub type_id: TypeId,
    /// Column flags.
    pub flags: ColumnFlags,
    /// User type ID.
    pub user_type: u32,
    /// Type-specific metadata.
    pub type_info: TypeInfo,
}

/// Type-specific metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeInfo {
    /// Declared maximum length in bytes.
    pub max_length: Option<u32>,
    /// Precision for decimal types.
    pub precision: Option<u8>,
    /// Scale for decimal and time types.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
}

impl ColMetaData {
    /// Column count announcing that no metadata follows.
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Decode a COLMETADATA token body (after the discriminator).
    ///
    /// The result carries generation 0; the parser assigns the real one.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let column_count = read_u16_le(src)?;
        if column_count == Self::NO_METADATA {
            return Ok(Self::default());
        }

        let mut columns = Vec::with_capacity(usize::from(column_count));
        for _ in 0..column_count {
            columns.push(ColumnDescriptor::decode(src)?);
        }

        Ok(Self {
            generation: 0,
            columns,
        })
    }

    /// Stamp this metadata with a schema generation.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Get the number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Check if this represents no metadata.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl ColumnDescriptor {
    fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let user_type = read_u32_le(src)?;
        let flags = ColumnFlags::from_bits(read_u16_le(src)?);
        let type_byte = read_u8(src)?;
        let type_id =
            TypeId::from_u8(type_byte).ok_or(ProtocolError::UnsupportedDataType(type_byte))?;
        let type_info = decode_type_info(src, type_id)?;
        let name = read_b_varchar(src)?;

        Ok(Self {
            name,
            type_id,
            flags,
            user_type,
            type_info,
        })
    }

    /// Create a descriptor from its parts.
    #[must_use]
    pub fn new(name: impl Into<String>, type_id: TypeId, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            type_id,
            flags: ColumnFlags::default(),
            user_type: 0,
            type_info,
        }
    }

    /// Check if this column is nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.nullable
    }

    /// How this column's values are laid out in a row.
    ///
    /// TEXT, NTEXT, IMAGE and SQL_VARIANT have no read policy; rows read
    /// them raw with their own layouts.
    pub fn read_policy(&self) -> Result<ReadPolicy, ProtocolError> {
        ReadPolicy::for_column(self.type_id, self.type_info.max_length, self.type_info.scale)
            .ok_or(ProtocolError::UnsupportedDataType(self.type_id as u8))
    }
}

fn decode_type_info(src: &mut impl Buf, type_id: TypeId) -> Result<TypeInfo, ProtocolError> {
    let info = match type_id {
        TypeId::Null
        | TypeId::Int1
        | TypeId::Bit
        | TypeId::Int2
        | TypeId::Int4
        | TypeId::Int8
        | TypeId::Float4
        | TypeId::Float8
        | TypeId::Money
        | TypeId::Money4
        | TypeId::DateTime
        | TypeId::DateTime4
        | TypeId::Date => TypeInfo::default(),

        TypeId::IntN
        | TypeId::BitN
        | TypeId::FloatN
        | TypeId::MoneyN
        | TypeId::DateTimeN
        | TypeId::Guid
        | TypeId::Char
        | TypeId::VarChar
        | TypeId::Binary
        | TypeId::VarBinary => TypeInfo {
            max_length: Some(u32::from(read_u8(src)?)),
            ..Default::default()
        },

        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => TypeInfo {
            max_length: Some(u32::from(read_u8(src)?)),
            precision: Some(read_u8(src)?),
            scale: Some(read_u8(src)?),
            ..Default::default()
        },

        TypeId::BigVarChar | TypeId::BigChar | TypeId::NChar | TypeId::NVarChar => TypeInfo {
            max_length: Some(u32::from(read_u16_le(src)?)),
            collation: Some(Collation::decode(src)?),
            ..Default::default()
        },

        TypeId::BigVarBinary | TypeId::BigBinary => TypeInfo {
            max_length: Some(u32::from(read_u16_le(src)?)),
            ..Default::default()
        },

        TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
            let scale = read_u8(src)?;
            if scale > MAX_TIME_SCALE {
                return Err(ProtocolError::Malformed(format!(
                    "{type_id:?} scale {scale} exceeds {MAX_TIME_SCALE}"
                )));
            }
            TypeInfo {
                scale: Some(scale),
                ..Default::default()
            }
        }

        TypeId::Text | TypeId::NText | TypeId::Image => {
            let max_length = read_u32_le(src)?;
            let collation = if type_id == TypeId::Image {
                None
            } else {
                Some(Collation::decode(src)?)
            };
            // Table name, one US_VARCHAR per part.
            let parts = read_u8(src)?;
            for _ in 0..parts {
                read_us_varchar(src)?;
            }
            TypeInfo {
                max_length: Some(max_length),
                collation,
                ..Default::default()
            }
        }

        TypeId::Xml => {
            if read_u8(src)? != 0 {
                read_b_varchar(src)?; // database
                read_b_varchar(src)?; // owning schema
                read_us_varchar(src)?; // schema collection
            }
            TypeInfo::default()
        }

        TypeId::Udt => {
            let max_length = u32::from(read_u16_le(src)?);
            read_b_varchar(src)?; // database
            read_b_varchar(src)?; // schema
            read_b_varchar(src)?; // type name
            read_us_varchar(src)?; // assembly qualified name
            TypeInfo {
                max_length: Some(max_length),
                ..Default::default()
            }
        }

        TypeId::Variant => TypeInfo {
            max_length: Some(read_u32_le(src)?),
            ..Default::default()
        },
    };
    Ok(info)
}

// =============================================================================
// Rows
// =============================================================================

/// Raw values of one row, positionally aligned with the column metadata.
///
/// `None` marks a SQL NULL; an empty `Some` is a zero-length value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    /// Schema generation of the metadata this row was decoded against.
    pub generation: u64,
    /// One entry per column.
    pub columns: Vec<Option<Bytes>>,
}

/// PLP total length announcing a NULL value.
pub const PLP_NULL: u64 = u64::MAX;

/// PLP total length announcing a value of unknown length.
pub const PLP_UNKNOWN_LENGTH: u64 = u64::MAX - 1;

impl RowData {
    /// Decode a ROW token body.
    pub fn decode(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let mut columns = Vec::with_capacity(metadata.columns.len());
        for column in &metadata.columns {
            columns.push(read_column_value(src, column)?);
        }
        Ok(Self {
            generation: metadata.generation,
            columns,
        })
    }

    /// Decode an NBCROW token body.
    ///
    /// A null bitmap of `ceil(columns / 8)` bytes precedes the values; bit
    /// `i % 8` of byte `i / 8` set means column `i` is NULL and contributes
    /// no bytes.
    pub fn decode_nbc(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let column_count = metadata.columns.len();
        let bitmap = read_bytes(src, column_count.div_ceil(8))?;

        let mut columns = Vec::with_capacity(column_count);
        for (i, column) in metadata.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                columns.push(None);
            } else {
                columns.push(read_column_value(src, column)?);
            }
        }
        Ok(Self {
            generation: metadata.generation,
            columns,
        })
    }

    /// Check if the column at `index` is NULL. Out of range counts as NULL.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        !matches!(self.columns.get(index), Some(Some(_)))
    }
}

/// Read one column value according to its read policy.
pub fn read_column_value(
    src: &mut impl Buf,
    column: &ColumnDescriptor,
) -> Result<Option<Bytes>, ProtocolError> {
    let Some(policy) =
        ReadPolicy::for_column(column.type_id, column.type_info.max_length, column.type_info.scale)
    else {
        return read_legacy_value(src, column);
    };
    match policy {
        ReadPolicy::Fixed(_) if column.type_id == TypeId::Null => Ok(None),
        ReadPolicy::Fixed(width) => read_bytes(src, width).map(Some),
        ReadPolicy::Variable => match read_u16_le(src)? {
            0xFFFF => Ok(None),
            len => read_bytes(src, usize::from(len)).map(Some),
        },
        ReadPolicy::ByteLen { width } => {
            let len = usize::from(read_u8(src)?);
            if len == 0 {
                return Ok(None);
            }
            if let Some(width) = width {
                if len != width {
                    return Err(ProtocolError::Malformed(format!(
                        "column '{}' of type {:?} has length {len}, expected {width}",
                        column.name, column.type_id
                    )));
                }
            }
            read_bytes(src, len).map(Some)
        }
        ReadPolicy::Plp => read_plp(src),
    }
}

/// Read a value whose row layout is none of the four read policies.
///
/// TEXT, NTEXT and IMAGE carry a text pointer (`u8` length, `0` for NULL)
/// and an 8-byte timestamp ahead of a `u32` length and the data.
/// SQL_VARIANT is a `u32` length with `0` for NULL. The bytes are handed
/// out raw; typed decoding decides what to make of them.
fn read_legacy_value(
    src: &mut impl Buf,
    column: &ColumnDescriptor,
) -> Result<Option<Bytes>, ProtocolError> {
    let len = match column.type_id {
        TypeId::Text | TypeId::NText | TypeId::Image => {
            let pointer_len = usize::from(read_u8(src)?);
            if pointer_len == 0 {
                return Ok(None);
            }
            // Text pointer, then timestamp.
            read_bytes(src, pointer_len + 8)?;
            read_u32_le(src)?
        }
        TypeId::Variant => match read_u32_le(src)? {
            0 => return Ok(None),
            len => len,
        },
        other => return Err(ProtocolError::UnsupportedDataType(other as u8)),
    };
    let len = usize::try_from(len)
        .map_err(|_| ProtocolError::Malformed(format!("column '{}' length {len}", column.name)))?;
    read_bytes(src, len).map(Some)
}

/// Read a partially length-prefixed value.
///
/// Layout: `u64` total length (all-ones for NULL), then `(u32 length, bytes)`
/// chunks terminated by a zero-length chunk. Chunks are concatenated.
pub fn read_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    let total = read_u64_le(src)?;
    if total == PLP_NULL {
        return Ok(None);
    }

    let capacity = if total == PLP_UNKNOWN_LENGTH {
        0
    } else {
        usize::try_from(total).unwrap_or(usize::MAX).min(src.remaining())
    };
    let mut value = BytesMut::with_capacity(capacity);

    loop {
        let chunk_len = read_u32_le(src)? as usize;
        if chunk_len == 0 {
            break;
        }
        let chunk = read_bytes(src, chunk_len)?;
        value.put(chunk);
    }

    if total != PLP_UNKNOWN_LENGTH && value.len() as u64 != total {
        return Err(ProtocolError::Malformed(format!(
            "PLP value announced {total} bytes, chunks carried {}",
            value.len()
        )));
    }

    Ok(Some(value.freeze()))
}

/// Encode a value in PLP form using the given chunk size.
///
/// `None` encodes NULL. Used by tests and the mock server.
pub fn write_plp(dst: &mut impl BufMut, value: Option<&[u8]>, chunk_size: usize) {
    let Some(value) = value else {
        dst.put_u64_le(PLP_NULL);
        return;
    };
    dst.put_u64_le(value.len() as u64);
    for chunk in value.chunks(chunk_size.max(1)) {
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}

// =============================================================================
// Completion tokens
// =============================================================================

bitflags::bitflags! {
    /// Done token status flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// Statement failed.
        const ERROR = 0x0002;
        /// Transaction in progress.
        const IN_XACT = 0x0004;
        /// Row count is valid.
        const COUNT = 0x0010;
        /// Attention acknowledgment.
        const ATTN = 0x0020;
        /// Server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// DONE, DONEPROC and DONEINPROC body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count, valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Size of the body in bytes.
    pub const SIZE: usize = 12;

    /// Decode a done body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ProtocolError::ensure(src.remaining(), Self::SIZE)?;
        Ok(Self {
            status: DoneStatus::from_bits_retain(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_u64_le(),
        })
    }

    /// Encode a done body.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Row count if the server marked it valid.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.status
            .contains(DoneStatus::COUNT)
            .then_some(self.row_count)
    }

    /// Whether more results follow in this response.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }
}

// =============================================================================
// Messages, login acknowledgment, environment changes
// =============================================================================

/// Body of an ERROR or INFO token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    /// Decode an ERROR or INFO body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = length_prefixed_body(src)?;
        let body = &mut body;
        bounded(|| {
            Ok(Self {
                number: read_u32_le(body)? as i32,
                state: read_u8(body)?,
                class: read_u8(body)?,
                message: read_us_varchar(body)?,
                server: read_b_varchar(body)?,
                procedure: read_b_varchar(body)?,
                line: read_u32_le(body)? as i32,
            })
        })
    }

    /// Severity 20 and above terminates the connection on the server side.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version (major, minor, build high, build low).
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = length_prefixed_body(src)?;
        let body = &mut body;
        bounded(|| {
            let interface = read_u8(body)?;
            ProtocolError::ensure(body.remaining(), 4)?;
            let tds_version = TdsVersion::new(body.get_u32());
            let prog_name = read_b_varchar(body)?;
            ProtocolError::ensure(body.remaining(), 4)?;
            let prog_version = body.get_u32();
            Ok(Self {
                interface,
                tds_version,
                prog_name,
                prog_version,
            })
        })
    }
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvChangeType {
    /// Database changed.
    Database,
    /// Language changed.
    Language,
    /// Character set changed.
    CharacterSet,
    /// Packet size changed.
    PacketSize,
    /// SQL collation changed.
    SqlCollation,
    /// Transaction began.
    BeginTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Connection reset acknowledged.
    ResetConnectionAck,
    /// Routing to another server.
    Routing,
    /// Any other change type, kept as raw bytes.
    Other(u8),
}

impl EnvChangeType {
    /// Create from raw byte value.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            18 => Self::ResetConnectionAck,
            20 => Self::Routing,
            other => Self::Other(other),
        }
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value.
    Binary(Bytes),
    /// Routing target.
    Routing {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
    },
}

/// Environment change token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = length_prefixed_body(src)?;
        let body = &mut body;
        bounded(|| {
            let env_type = EnvChangeType::from_u8(read_u8(body)?);
            let (new_value, old_value) = match env_type {
                EnvChangeType::Database
                | EnvChangeType::Language
                | EnvChangeType::CharacterSet
                | EnvChangeType::PacketSize => (
                    EnvChangeValue::String(read_b_varchar(body)?),
                    EnvChangeValue::String(read_b_varchar(body)?),
                ),
                EnvChangeType::SqlCollation
                | EnvChangeType::BeginTransaction
                | EnvChangeType::CommitTransaction
                | EnvChangeType::RollbackTransaction
                | EnvChangeType::ResetConnectionAck => (
                    EnvChangeValue::Binary(read_b_varbyte(body)?),
                    EnvChangeValue::Binary(read_b_varbyte(body)?),
                ),
                EnvChangeType::Routing => {
                    let _len = read_u16_le(body)?;
                    let _protocol = read_u8(body)?;
                    let port = read_u16_le(body)?;
                    let host = read_us_varchar(body)?;
                    (
                        EnvChangeValue::Routing { host, port },
                        EnvChangeValue::Binary(Bytes::new()),
                    )
                }
                EnvChangeType::Other(_) => (
                    EnvChangeValue::Binary(body.copy_to_bytes(body.remaining())),
                    EnvChangeValue::Binary(Bytes::new()),
                ),
            };
            Ok(Self {
                env_type,
                new_value,
                old_value,
            })
        })
    }

    /// New packet size, if this is a valid packet size change.
    #[must_use]
    pub fn new_packet_size(&self) -> Option<usize> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// New database name, if this is a database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Database, EnvChangeValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Routing target, if this is a routing change.
    #[must_use]
    pub fn routing_info(&self) -> Option<(&str, u16)> {
        match &self.new_value {
            EnvChangeValue::Routing { host, port } => Some((host, *port)),
            _ => None,
        }
    }
}

/// Column ordering information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Ordinals of the ORDER BY columns.
    pub columns: Vec<u16>,
}

impl Order {
    /// Decode an ORDER body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = length_prefixed_body(src)?;
        let mut columns = Vec::with_capacity(body.len() / 2);
        while body.remaining() >= 2 {
            columns.push(body.get_u16_le());
        }
        Ok(Self { columns })
    }
}

/// Decode a RETURNSTATUS body.
pub fn decode_return_status(src: &mut impl Buf) -> Result<i32, ProtocolError> {
    Ok(read_u32_le(src)? as i32)
}

/// Read a `u16` length and split off that many bytes as the token body.
fn length_prefixed_body(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u16_le(src)?);
    read_bytes(src, len)
}

/// Run a decoder over a complete, length-bounded body.
///
/// Running out of bytes inside a body whose length was already satisfied is
/// corruption, not a reason to wait for more input.
fn bounded<T>(decode: impl FnOnce() -> Result<T, ProtocolError>) -> Result<T, ProtocolError> {
    decode().map_err(|e| match e {
        ProtocolError::Incomplete { needed, available } => ProtocolError::Malformed(format!(
            "token body too short: needed {needed} bytes, had {available}"
        )),
        other => other,
    })
}

fn read_b_varbyte(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u8(src)?);
    read_bytes(src, len)
}
