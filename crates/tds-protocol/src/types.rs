//! TDS data type definitions and the row read policy table.
//!
//! Each column type maps to exactly one of four wire read policies, see
//! [`ReadPolicy`]. The mapping lives in [`ReadPolicy::for_column`] and is
//! the single source of truth for ROW and NBCROW decoding.

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types (no length prefix)
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Byte-length prefixed types
    /// GUID.
    Guid = 0x24,
    /// Nullable integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Decimal.
    DecimalN = 0x6A,
    /// Numeric.
    NumericN = 0x6C,
    /// Nullable float.
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// Legacy fixed-length character.
    Char = 0x2F,
    /// Legacy variable-length character.
    VarChar = 0x27,
    /// Legacy fixed-length binary.
    Binary = 0x2D,
    /// Legacy variable-length binary.
    VarBinary = 0x25,

    // Types with a 2-byte length prefix (or PLP when declared as MAX)
    /// Large variable-length character.
    BigVarChar = 0xA7,
    /// Large variable-length binary.
    BigVarBinary = 0xA5,
    /// Large fixed-length character.
    BigChar = 0xAF,
    /// Large fixed-length binary.
    BigBinary = 0xAD,
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // Deprecated large object types
    /// Text.
    Text = 0x23,
    /// Image.
    Image = 0x22,
    /// NText.
    NText = 0x63,

    // Date/time types
    /// Date (3 bytes).
    Date = 0x28,
    /// Time with variable precision.
    Time = 0x29,
    /// DateTime2 with variable precision.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable precision.
    DateTimeOffset = 0x2B,

    // Special types
    /// SQL Variant.
    Variant = 0x62,
    /// User-defined type.
    Udt = 0xF0,
    /// XML type.
    Xml = 0xF1,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1F => Some(Self::Null),
            0x30 => Some(Self::Int1),
            0x32 => Some(Self::Bit),
            0x34 => Some(Self::Int2),
            0x38 => Some(Self::Int4),
            0x7F => Some(Self::Int8),
            0x3B => Some(Self::Float4),
            0x3E => Some(Self::Float8),
            0x3C => Some(Self::Money),
            0x7A => Some(Self::Money4),
            0x3D => Some(Self::DateTime),
            0x3A => Some(Self::DateTime4),
            0x24 => Some(Self::Guid),
            0x26 => Some(Self::IntN),
            0x37 => Some(Self::Decimal),
            0x3F => Some(Self::Numeric),
            0x68 => Some(Self::BitN),
            0x6A => Some(Self::DecimalN),
            0x6C => Some(Self::NumericN),
            0x6D => Some(Self::FloatN),
            0x6E => Some(Self::MoneyN),
            0x6F => Some(Self::DateTimeN),
            0x2F => Some(Self::Char),
            0x27 => Some(Self::VarChar),
            0x2D => Some(Self::Binary),
            0x25 => Some(Self::VarBinary),
            0xA7 => Some(Self::BigVarChar),
            0xA5 => Some(Self::BigVarBinary),
            0xAF => Some(Self::BigChar),
            0xAD => Some(Self::BigBinary),
            0xEF => Some(Self::NChar),
            0xE7 => Some(Self::NVarChar),
            0x23 => Some(Self::Text),
            0x22 => Some(Self::Image),
            0x63 => Some(Self::NText),
            0x28 => Some(Self::Date),
            0x29 => Some(Self::Time),
            0x2A => Some(Self::DateTime2),
            0x2B => Some(Self::DateTimeOffset),
            0x62 => Some(Self::Variant),
            0xF0 => Some(Self::Udt),
            0xF1 => Some(Self::Xml),
            _ => None,
        }
    }

    /// Get the fixed size of this type in bytes, if it carries no length
    /// prefix on the wire.
    #[must_use]
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Check if this is a Unicode (UTF-16LE) character type.
    #[must_use]
    pub const fn is_unicode(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Check if this is a character type of any encoding.
    #[must_use]
    pub const fn is_character(&self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::VarChar
                | Self::BigChar
                | Self::BigVarChar
                | Self::NChar
                | Self::NVarChar
                | Self::Text
                | Self::NText
        )
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_datetime(&self) -> bool {
        matches!(
            self,
            Self::DateTime
                | Self::DateTime4
                | Self::DateTimeN
                | Self::Date
                | Self::Time
                | Self::DateTime2
                | Self::DateTimeOffset
        )
    }

    /// Check if this type is in the scaled time family (TIME, DATETIME2,
    /// DATETIMEOFFSET), whose width depends on the declared scale.
    #[must_use]
    pub const fn is_scaled_time(&self) -> bool {
        matches!(self, Self::Time | Self::DateTime2 | Self::DateTimeOffset)
    }

    /// Width of this type's value for a given fractional-second scale.
    ///
    /// Only defined for the scaled time family and DATE.
    #[must_use]
    pub const fn scaled_width(&self, scale: u8) -> Option<usize> {
        match self {
            Self::Date => Some(3),
            Self::Time => Some(time_width_for_scale(scale)),
            Self::DateTime2 => Some(time_width_for_scale(scale) + 3),
            Self::DateTimeOffset => Some(time_width_for_scale(scale) + 5),
            _ => None,
        }
    }
}

/// Largest fractional-second scale of TIME, DATETIME2 and DATETIMEOFFSET.
pub const MAX_TIME_SCALE: u8 = 7;

/// Width of the tick count of a TIME value with the given scale.
///
/// Scale 0-2 uses 3 bytes, 3-4 uses 4 bytes and 5-7 uses 5 bytes.
#[must_use]
pub const fn time_width_for_scale(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

/// Marker for "declared length is MAX", switching a type to PLP encoding.
pub const MAX_LENGTH_MARKER: u32 = 0xFFFF;

/// How a column's value is laid out inside a ROW token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Exactly `n` raw bytes, never null.
    Fixed(usize),
    /// `u16` little-endian length, `0xFFFF` for null.
    Variable,
    /// `u8` length, `0` for null.
    ///
    /// When `width` is known the length byte must be `0` or exactly `width`.
    ByteLen {
        /// Expected value width, if the type fixes it.
        width: Option<usize>,
    },
    /// Partially length-prefixed chunks.
    Plp,
}

impl ReadPolicy {
    /// Pick the read policy for a column.
    ///
    /// Returns `None` for types whose row encoding is none of the four
    /// policies (TEXT, NTEXT, IMAGE and SQL_VARIANT).
    #[must_use]
    pub fn for_column(type_id: TypeId, max_length: Option<u32>, scale: Option<u8>) -> Option<Self> {
        let policy = match type_id {
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
            | TypeId::DateTime4 => Self::Fixed(type_id.fixed_size().unwrap_or_default()),

            TypeId::Date => Self::ByteLen { width: Some(3) },
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => Self::ByteLen {
                width: type_id.scaled_width(scale.unwrap_or(7)),
            },
            TypeId::Guid => Self::ByteLen { width: Some(16) },

            TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Decimal
            | TypeId::Numeric
            | TypeId::DecimalN
            | TypeId::NumericN
            | TypeId::Char
            | TypeId::VarChar
            | TypeId::Binary
            | TypeId::VarBinary => Self::ByteLen { width: None },

            TypeId::BigVarChar | TypeId::BigVarBinary | TypeId::NVarChar => {
                if max_length == Some(MAX_LENGTH_MARKER) {
                    Self::Plp
                } else {
                    Self::Variable
                }
            }
            TypeId::BigChar | TypeId::BigBinary | TypeId::NChar => Self::Variable,

            TypeId::Xml | TypeId::Udt => Self::Plp,

            TypeId::Text | TypeId::NText | TypeId::Image | TypeId::Variant => return None,
        };
        Some(policy)
    }
}

/// Column flags from COLMETADATA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnFlags {
    /// Column is nullable.
    pub nullable: bool,
    /// Column allows case-sensitive comparison.
    pub case_sensitive: bool,
    /// Column is an identity column.
    pub identity: bool,
    /// Column is computed.
    pub computed: bool,
    /// Column is hidden.
    pub hidden: bool,
    /// Column is a key column.
    pub key: bool,
}

impl ColumnFlags {
    /// Parse column flags from the 2-byte flags field.
    #[must_use]
    pub fn from_bits(flags: u16) -> Self {
        Self {
            nullable: (flags & 0x0001) != 0,
            case_sensitive: (flags & 0x0002) != 0,
            identity: (flags & 0x0010) != 0,
            computed: (flags & 0x0020) != 0,
            hidden: (flags & 0x2000) != 0,
            key: (flags & 0x4000) != 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_from_u8() {
        assert_eq!(TypeId::from_u8(0x38), Some(TypeId::Int4));
        assert_eq!(TypeId::from_u8(0xE7), Some(TypeId::NVarChar));
        assert_eq!(TypeId::from_u8(0x3A), Some(TypeId::DateTime4));
        assert_eq!(TypeId::from_u8(0x3F), Some(TypeId::Numeric));
        assert_eq!(TypeId::from_u8(0x99), None);
    }

    #[test]
    fn test_time_width_for_scale() {
        assert_eq!(time_width_for_scale(0), 3);
        assert_eq!(time_width_for_scale(2), 3);
        assert_eq!(time_width_for_scale(3), 4);
        assert_eq!(time_width_for_scale(4), 4);
        assert_eq!(time_width_for_scale(5), 5);
        assert_eq!(time_width_for_scale(7), 5);
    }

    #[test]
    fn test_scaled_width() {
        assert_eq!(TypeId::Time.scaled_width(7), Some(5));
        assert_eq!(TypeId::DateTime2.scaled_width(3), Some(7));
        assert_eq!(TypeId::DateTimeOffset.scaled_width(0), Some(8));
        assert_eq!(TypeId::Int4.scaled_width(0), None);
    }

    #[test]
    fn test_fixed_policies() {
        assert_eq!(
            ReadPolicy::for_column(TypeId::Int4, None, None),
            Some(ReadPolicy::Fixed(4))
        );
        assert_eq!(
            ReadPolicy::for_column(TypeId::DateTime, None, None),
            Some(ReadPolicy::Fixed(8))
        );
        assert_eq!(
            ReadPolicy::for_column(TypeId::Null, None, None),
            Some(ReadPolicy::Fixed(0))
        );
    }

    #[test]
    fn test_max_types_use_plp() {
        assert_eq!(
            ReadPolicy::for_column(TypeId::NVarChar, Some(0xFFFF), None),
            Some(ReadPolicy::Plp)
        );
        assert_eq!(
            ReadPolicy::for_column(TypeId::NVarChar, Some(100), None),
            Some(ReadPolicy::Variable)
        );
        assert_eq!(
            ReadPolicy::for_column(TypeId::Xml, None, None),
            Some(ReadPolicy::Plp)
        );
    }

    #[test]
    fn test_time_family_width_follows_scale() {
        assert_eq!(
            ReadPolicy::for_column(TypeId::Time, None, Some(1)),
            Some(ReadPolicy::ByteLen { width: Some(3) })
        );
        assert_eq!(
            ReadPolicy::for_column(TypeId::DateTime2, None, Some(7)),
            Some(ReadPolicy::ByteLen { width: Some(8) })
        );
    }

    #[test]
    fn test_legacy_lobs_have_no_policy() {
        assert_eq!(ReadPolicy::for_column(TypeId::Text, None, None), None);
        assert_eq!(ReadPolicy::for_column(TypeId::Variant, None, None), None);
    }

    #[test]
    fn test_column_flags() {
        let flags = ColumnFlags::from_bits(0x0011);
        assert!(flags.nullable);
        assert!(flags.identity);
        assert!(!flags.key);
    }
}
