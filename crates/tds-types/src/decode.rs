//! Typed decoding of raw column values.
//!
//! The token parser hands out each column as the bare value bytes, with
//! length prefixes and PLP chunking already stripped, or `None` for null.
//! [`decode_value`] interprets those bytes according to the column's type.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use rust_decimal::Decimal;
use tds_protocol::{ColumnDescriptor, TypeId};
use uuid::Uuid;

use crate::error::TypeError;
use crate::value::SqlValue;

/// Decode one column value.
///
/// ```
/// use tds_protocol::{ColumnDescriptor, TypeId, TypeInfo};
/// use tds_types::{SqlValue, decode_value};
///
/// let column = ColumnDescriptor::new("n", TypeId::Int4, TypeInfo::default());
/// let value = decode_value(&column, Some(&[0x2A, 0, 0, 0])).unwrap();
/// assert_eq!(value, SqlValue::Int(42));
/// ```
pub fn decode_value(column: &ColumnDescriptor, raw: Option<&[u8]>) -> Result<SqlValue, TypeError> {
    let Some(raw) = raw else {
        return Ok(SqlValue::Null);
    };
    let scale = column.type_info.scale;

    match column.type_id {
        TypeId::Null => Ok(SqlValue::Null),
        TypeId::Bit | TypeId::BitN => Ok(SqlValue::Bool(fixed::<1>(raw)?[0] != 0)),
        TypeId::Int1 => Ok(SqlValue::TinyInt(fixed::<1>(raw)?[0])),
        TypeId::Int2 => Ok(SqlValue::SmallInt(i16::from_le_bytes(fixed(raw)?))),
        TypeId::Int4 => Ok(SqlValue::Int(i32::from_le_bytes(fixed(raw)?))),
        TypeId::Int8 => Ok(SqlValue::BigInt(i64::from_le_bytes(fixed(raw)?))),
        TypeId::IntN => match raw.len() {
            1 => Ok(SqlValue::TinyInt(raw[0])),
            2 => Ok(SqlValue::SmallInt(i16::from_le_bytes(fixed(raw)?))),
            4 => Ok(SqlValue::Int(i32::from_le_bytes(fixed(raw)?))),
            _ => Ok(SqlValue::BigInt(i64::from_le_bytes(fixed(raw)?))),
        },
        TypeId::Float4 => Ok(SqlValue::Float(f32::from_le_bytes(fixed(raw)?))),
        TypeId::Float8 => Ok(SqlValue::Double(f64::from_le_bytes(fixed(raw)?))),
        TypeId::FloatN => match raw.len() {
            4 => Ok(SqlValue::Float(f32::from_le_bytes(fixed(raw)?))),
            _ => Ok(SqlValue::Double(f64::from_le_bytes(fixed(raw)?))),
        },
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => decode_money(raw),
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            decode_decimal(raw, scale.unwrap_or(0))
        }
        TypeId::Guid => Ok(SqlValue::Uuid(Uuid::from_bytes_le(fixed(raw)?))),

        TypeId::DateTime => decode_datetime(raw),
        TypeId::DateTime4 => decode_smalldatetime(raw),
        TypeId::DateTimeN => match raw.len() {
            4 => decode_smalldatetime(raw),
            _ => decode_datetime(raw),
        },
        TypeId::Date => Ok(SqlValue::Date(decode_date(raw)?)),
        TypeId::Time => Ok(SqlValue::Time(decode_time(raw, scale.unwrap_or(7))?)),
        TypeId::DateTime2 => decode_datetime2(raw, scale.unwrap_or(7)),
        TypeId::DateTimeOffset => decode_datetimeoffset(raw, scale.unwrap_or(7)),

        TypeId::NChar | TypeId::NVarChar => Ok(SqlValue::String(decode_utf16_string(raw)?)),
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar => {
            decode_varchar(raw, column)
        }
        TypeId::Xml => Ok(SqlValue::Xml(decode_utf16_string(strip_utf16_bom(raw))?)),
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Udt => Ok(SqlValue::Binary(bytes::Bytes::copy_from_slice(raw))),

        TypeId::Text | TypeId::NText | TypeId::Image | TypeId::Variant => {
            Err(TypeError::UnsupportedType(column.type_id as u8))
        }
    }
}

/// Decode a UTF-16LE string.
pub fn decode_utf16_string(data: &[u8]) -> Result<String, TypeError> {
    if data.len() % 2 != 0 {
        return Err(TypeError::InvalidEncoding(format!(
            "odd byte count {} in UTF-16 data",
            data.len()
        )));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| TypeError::InvalidEncoding(e.to_string()))
}

fn strip_utf16_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xFF, 0xFE]).unwrap_or(data)
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N], TypeError> {
    raw.try_into().map_err(|_| TypeError::BufferTooSmall {
        needed: N,
        available: raw.len(),
    })
}

fn decode_varchar(raw: &[u8], column: &ColumnDescriptor) -> Result<SqlValue, TypeError> {
    let encoding = column
        .type_info
        .collation
        .map_or(encoding_rs::WINDOWS_1252, |c| c.encoding());
    encoding
        .decode_without_bom_handling_and_without_replacement(raw)
        .map(|s| SqlValue::String(s.into_owned()))
        .ok_or_else(|| TypeError::InvalidEncoding(format!("invalid {} data", encoding.name())))
}

/// MONEY is a 64-bit count of ten-thousandths sent high half first;
/// SMALLMONEY is the 32-bit version.
fn decode_money(raw: &[u8]) -> Result<SqlValue, TypeError> {
    let units = match raw.len() {
        4 => i64::from(i32::from_le_bytes(fixed(raw)?)),
        _ => {
            let bytes: [u8; 8] = fixed(raw)?;
            let high = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let low = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            (i64::from(high) << 32) | i64::from(low)
        }
    };
    Ok(SqlValue::Decimal(Decimal::new(units, 4)))
}

fn decode_decimal(raw: &[u8], scale: u8) -> Result<SqlValue, TypeError> {
    let Some((&sign, mantissa)) = raw.split_first() else {
        return Err(TypeError::BufferTooSmall {
            needed: 1,
            available: 0,
        });
    };
    if mantissa.len() > 16 {
        return Err(TypeError::InvalidDecimal(format!(
            "mantissa of {} bytes",
            mantissa.len()
        )));
    }

    let mut bytes = [0u8; 16];
    bytes[..mantissa.len()].copy_from_slice(mantissa);
    let magnitude = i128::try_from(u128::from_le_bytes(bytes))
        .map_err(|_| TypeError::InvalidDecimal("mantissa overflows i128".into()))?;
    let signed = if sign == 0 { -magnitude } else { magnitude };

    Decimal::try_from_i128_with_scale(signed, u32::from(scale))
        .map(SqlValue::Decimal)
        .map_err(|e| TypeError::InvalidDecimal(e.to_string()))
}

fn epoch(year: i32) -> Result<NaiveDate, TypeError> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("no epoch for year {year}")))
}

fn add_days(base: NaiveDate, days: i64) -> Result<NaiveDate, TypeError> {
    base.checked_add_signed(Duration::days(days))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{days} days past {base} overflows")))
}

/// Little-endian unsigned integer of up to eight bytes.
fn le_uint(raw: &[u8]) -> u64 {
    raw.iter()
        .rev()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

/// DATETIME: signed days since 1900-01-01, then 1/300 second ticks.
fn decode_datetime(raw: &[u8]) -> Result<SqlValue, TypeError> {
    let bytes: [u8; 8] = fixed(raw)?;
    let days = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let ticks = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let date = add_days(epoch(1900)?, i64::from(days))?;
    let nanos = i64::from(ticks) * 1_000_000_000 / 300;
    date.and_time(NaiveTime::default())
        .checked_add_signed(Duration::nanoseconds(nanos))
        .map(SqlValue::DateTime)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{ticks} ticks overflow")))
}

/// SMALLDATETIME: days since 1900-01-01, then minutes since midnight.
fn decode_smalldatetime(raw: &[u8]) -> Result<SqlValue, TypeError> {
    let bytes: [u8; 4] = fixed(raw)?;
    let days = u16::from_le_bytes([bytes[0], bytes[1]]);
    let minutes = u16::from_le_bytes([bytes[2], bytes[3]]);

    let date = add_days(epoch(1900)?, i64::from(days))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{minutes} minutes past midnight")))?;
    Ok(SqlValue::DateTime(date.and_time(time)))
}

/// DATE: 3-byte day count since 0001-01-01.
fn decode_date(raw: &[u8]) -> Result<NaiveDate, TypeError> {
    let bytes: [u8; 3] = fixed(raw)?;
    add_days(epoch(1)?, le_uint(&bytes) as i64)
}

/// TIME: 3 to 5 byte tick count in units of 10^-scale seconds.
fn decode_time(raw: &[u8], scale: u8) -> Result<NaiveTime, TypeError> {
    if !(3..=5).contains(&raw.len()) {
        return Err(TypeError::InvalidDateTime(format!(
            "TIME value of {} bytes",
            raw.len()
        )));
    }
    if scale > 7 {
        return Err(TypeError::InvalidDateTime(format!("TIME scale {scale}")));
    }

    let ticks = le_uint(raw);
    let nanos_per_tick = 10u64.pow(9 - u32::from(scale));
    let total = ticks
        .checked_mul(nanos_per_tick)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{ticks} ticks overflow")))?;
    let secs = u32::try_from(total / 1_000_000_000)
        .map_err(|_| TypeError::InvalidDateTime(format!("{ticks} ticks overflow")))?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, (total % 1_000_000_000) as u32)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{ticks} ticks past midnight")))
}

/// Split a scaled date/time value into its time and date parts.
fn split_time_date(raw: &[u8], trailing: usize) -> Result<(&[u8], &[u8]), TypeError> {
    if raw.len() < trailing + 3 {
        return Err(TypeError::BufferTooSmall {
            needed: trailing + 3,
            available: raw.len(),
        });
    }
    Ok(raw.split_at(raw.len() - trailing))
}

fn decode_datetime2(raw: &[u8], scale: u8) -> Result<SqlValue, TypeError> {
    let (time, date) = split_time_date(raw, 3)?;
    Ok(SqlValue::DateTime(
        decode_date(date)?.and_time(decode_time(time, scale)?),
    ))
}

/// DATETIMEOFFSET: a DATETIME2 value followed by a signed offset in
/// minutes, which is subtracted from the constructed instant.
fn decode_datetimeoffset(raw: &[u8], scale: u8) -> Result<SqlValue, TypeError> {
    let (value, offset) = split_time_date(raw, 2)?;
    let (time, date) = split_time_date(value, 3)?;
    let offset_minutes = i16::from_le_bytes([offset[0], offset[1]]);

    let constructed = decode_date(date)?.and_time(decode_time(time, scale)?);
    let instant = constructed
        .checked_sub_signed(Duration::minutes(i64::from(offset_minutes)))
        .ok_or_else(|| TypeError::InvalidDateTime("offset overflows".into()))?;
    let zone = FixedOffset::east_opt(i32::from(offset_minutes) * 60)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("offset {offset_minutes} minutes")))?;

    let value: DateTime<FixedOffset> = zone.from_utc_datetime(&instant);
    Ok(SqlValue::DateTimeOffset(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use tds_protocol::{Collation, TypeInfo};

    fn column(type_id: TypeId) -> ColumnDescriptor {
        ColumnDescriptor::new("c", type_id, TypeInfo::default())
    }

    fn scaled(type_id: TypeId, scale: u8) -> ColumnDescriptor {
        ColumnDescriptor::new(
            "c",
            type_id,
            TypeInfo {
                scale: Some(scale),
                ..TypeInfo::default()
            },
        )
    }

    fn decode(column: &ColumnDescriptor, raw: &[u8]) -> SqlValue {
        decode_value(column, Some(raw)).unwrap()
    }

    #[test]
    fn test_null_is_null_for_every_type() {
        for type_id in [TypeId::IntN, TypeId::NVarChar, TypeId::DateTime2, TypeId::DecimalN] {
            assert_eq!(decode_value(&column(type_id), None).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_integers() {
        assert_eq!(decode(&column(TypeId::Int1), &[0xFF]), SqlValue::TinyInt(255));
        assert_eq!(decode(&column(TypeId::Int2), &[0xFE, 0xFF]), SqlValue::SmallInt(-2));
        assert_eq!(
            decode(&column(TypeId::IntN), &[1, 0, 0, 0, 0, 0, 0, 0]),
            SqlValue::BigInt(1)
        );
        assert_eq!(decode(&column(TypeId::IntN), &[9]), SqlValue::TinyInt(9));
        assert!(matches!(
            decode_value(&column(TypeId::Int4), Some(&[1, 2])),
            Err(TypeError::BufferTooSmall {
                needed: 4,
                available: 2
            })
        ));
    }

    #[test]
    fn test_floats_and_bits() {
        assert_eq!(
            decode(&column(TypeId::FloatN), &1.5f64.to_le_bytes()),
            SqlValue::Double(1.5)
        );
        assert_eq!(
            decode(&column(TypeId::FloatN), &0.25f32.to_le_bytes()),
            SqlValue::Float(0.25)
        );
        assert_eq!(decode(&column(TypeId::BitN), &[1]), SqlValue::Bool(true));
    }

    #[test]
    fn test_money() {
        // 12.3456 as MONEY: 123456 ten-thousandths, high half first.
        let mut raw = Vec::new();
        raw.extend_from_slice(&0i32.to_le_bytes());
        raw.extend_from_slice(&123_456u32.to_le_bytes());
        assert_eq!(
            decode(&column(TypeId::MoneyN), &raw),
            SqlValue::Decimal(Decimal::new(123_456, 4))
        );
        assert_eq!(
            decode(&column(TypeId::Money4), &(-50_000i32).to_le_bytes()),
            SqlValue::Decimal(Decimal::new(-50_000, 4))
        );
    }

    #[test]
    fn test_decimal() {
        let mut col = scaled(TypeId::DecimalN, 2);
        col.type_info.precision = Some(10);
        // -123.45
        let raw = [0x00, 0x39, 0x30, 0x00, 0x00];
        assert_eq!(decode(&col, &raw), SqlValue::Decimal(Decimal::new(-12_345, 2)));
    }

    #[test]
    fn test_guid_mixed_endian() {
        let raw = [
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let SqlValue::Uuid(uuid) = decode(&column(TypeId::Guid), &raw) else {
            panic!("expected uuid");
        };
        assert_eq!(uuid.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }

    #[test]
    fn test_legacy_datetime() {
        let value = decode(&column(TypeId::DateTime), &[2, 0, 0, 0, 88, 81, 0, 0]);
        let SqlValue::DateTime(dt) = value else {
            panic!("expected datetime");
        };
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(1900, 1, 3).unwrap());
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (0, 1, 9));
        assert_eq!(dt.and_utc().timestamp_subsec_millis(), 413);
    }

    #[test]
    fn test_smalldatetime() {
        // 1900-01-02 01:30
        let SqlValue::DateTime(dt) = decode(&column(TypeId::DateTime4), &[1, 0, 90, 0]) else {
            panic!("expected datetime");
        };
        assert_eq!(dt.to_string(), "1900-01-02 01:30:00");
    }

    #[test]
    fn test_date_three_bytes() {
        // 737_424 days after 0001-01-01 is 2020-01-01.
        let days = 737_424u32.to_le_bytes();
        let SqlValue::Date(date) = decode(&column(TypeId::Date), &days[..3]) else {
            panic!("expected date");
        };
        assert_eq!((date.year(), date.month(), date.day()), (2020, 1, 1));
        assert!(decode_value(&column(TypeId::Date), Some(&days)).is_err());
    }

    #[test]
    fn test_time_scales() {
        // 12:00:00 at scale 0: 43200 ticks in 3 bytes.
        let ticks = 43_200u64.to_le_bytes();
        assert_eq!(
            decode(&scaled(TypeId::Time, 0), &ticks[..3]),
            SqlValue::Time(NaiveTime::from_hms_opt(12, 0, 0).unwrap())
        );

        // 00:00:01.5 at scale 7: 15_000_000 ticks in 5 bytes.
        let ticks = 15_000_000u64.to_le_bytes();
        assert_eq!(
            decode(&scaled(TypeId::Time, 7), &ticks[..5]),
            SqlValue::Time(NaiveTime::from_hms_milli_opt(0, 0, 1, 500).unwrap())
        );
    }

    #[test]
    fn test_datetime2() {
        let mut raw = 36_000u64.to_le_bytes()[..3].to_vec(); // 10:00 at scale 0
        raw.extend_from_slice(&737_424u32.to_le_bytes()[..3]);
        let SqlValue::DateTime(dt) = decode(&scaled(TypeId::DateTime2, 0), &raw) else {
            panic!("expected datetime");
        };
        assert_eq!(dt.to_string(), "2020-01-01 10:00:00");
    }

    #[test]
    fn test_datetimeoffset_subtracts_offset() {
        let mut raw = 36_000u64.to_le_bytes()[..3].to_vec();
        raw.extend_from_slice(&737_424u32.to_le_bytes()[..3]);
        raw.extend_from_slice(&120i16.to_le_bytes());

        let SqlValue::DateTimeOffset(dt) = decode(&scaled(TypeId::DateTimeOffset, 0), &raw) else {
            panic!("expected datetimeoffset");
        };
        assert_eq!(dt.naive_utc().to_string(), "2020-01-01 08:00:00");
        assert_eq!(dt.offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_strings() {
        let raw: Vec<u8> = "héllo".encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(
            decode(&column(TypeId::NVarChar), &raw),
            SqlValue::String("héllo".into())
        );
        assert!(decode_value(&column(TypeId::NVarChar), Some(&raw[..3])).is_err());

        // 0xE9 is é in Windows-1252.
        let mut col = column(TypeId::BigVarChar);
        col.type_info.collation = Some(Collation {
            info: 0x0409,
            sort_id: 0,
        });
        assert_eq!(decode(&col, &[b'h', 0xE9]), SqlValue::String("hé".into()));
    }

    #[test]
    fn test_xml_strips_bom() {
        let mut raw = vec![0xFF, 0xFE];
        raw.extend("<a/>".encode_utf16().flat_map(u16::to_le_bytes));
        assert_eq!(decode(&column(TypeId::Xml), &raw), SqlValue::Xml("<a/>".into()));
    }

    proptest::proptest! {
        #[test]
        fn prop_decimal_matches_mantissa(value in proptest::prelude::any::<i64>(), scale in 0u8..=18) {
            let mut raw = vec![u8::from(value >= 0)];
            raw.extend_from_slice(&value.unsigned_abs().to_le_bytes());
            let decoded = decode_value(&scaled(TypeId::NumericN, scale), Some(&raw)).unwrap();
            proptest::prop_assert_eq!(decoded, SqlValue::Decimal(Decimal::new(value, u32::from(scale))));
        }

        #[test]
        fn prop_time_ticks_roundtrip(seconds in 0u32..86_400, scale in 0u8..=7) {
            let ticks = u64::from(seconds) * 10u64.pow(u32::from(scale));
            let width = tds_protocol::types::time_width_for_scale(scale);
            let raw = &ticks.to_le_bytes()[..width];
            let SqlValue::Time(time) = decode_value(&scaled(TypeId::Time, scale), Some(raw)).unwrap() else {
                return Err(proptest::test_runner::TestCaseError::fail("expected time"));
            };
            proptest::prop_assert_eq!(time.num_seconds_from_midnight(), seconds);
        }
    }

    #[test]
    fn test_unsupported_type_is_scoped_error() {
        assert!(matches!(
            decode_value(&column(TypeId::Variant), Some(&[1])),
            Err(TypeError::UnsupportedType(0x62))
        ));
    }
}
