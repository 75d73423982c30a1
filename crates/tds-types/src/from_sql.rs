//! Conversion from decoded SQL values to Rust types.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::TypeError;
use crate::value::SqlValue;

/// Types that can be extracted from a [`SqlValue`].
///
/// `Option<T>` maps NULL to `None`; every other implementation rejects
/// NULL with [`TypeError::UnexpectedNull`].
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    match value {
        SqlValue::Null => TypeError::UnexpectedNull,
        _ => TypeError::TypeMismatch {
            expected,
            actual: value.type_name(),
        },
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql(value).map(Some)
        }
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Ok(value.clone())
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            _ => Err(mismatch("bool", value)),
        }
    }
}

impl FromSql for u8 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::TinyInt(v) => Ok(*v),
            _ => Err(mismatch("u8", value)),
        }
    }
}

impl FromSql for i16 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::SmallInt(v) => Ok(*v),
            SqlValue::TinyInt(v) => Ok(i16::from(*v)),
            _ => Err(mismatch("i16", value)),
        }
    }
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::SmallInt(v) => Ok(i32::from(*v)),
            SqlValue::TinyInt(v) => Ok(i32::from(*v)),
            SqlValue::BigInt(v) => {
                i32::try_from(*v).map_err(|_| TypeError::OutOfRange { target_type: "i32" })
            }
            _ => Err(mismatch("i32", value)),
        }
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            _ => Err(mismatch("f32", value)),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Double(v) => Ok(*v),
            SqlValue::Float(v) => Ok(f64::from(*v)),
            _ => Err(mismatch("f64", value)),
        }
    }
}

impl FromSql for Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Decimal(v) => Ok(*v),
            _ => value
                .as_i64()
                .map(Decimal::from)
                .ok_or_else(|| mismatch("Decimal", value)),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| mismatch("String", value))
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.clone()),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| mismatch("Vec<u8>", value))
    }
}

impl FromSql for Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Uuid(v) => Ok(*v),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

impl FromSql for NaiveDate {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Date(v) => Ok(*v),
            SqlValue::DateTime(v) => Ok(v.date()),
            _ => Err(mismatch("NaiveDate", value)),
        }
    }
}

impl FromSql for NaiveTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Time(v) => Ok(*v),
            _ => Err(mismatch("NaiveTime", value)),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTime(v) => Ok(*v),
            _ => Err(mismatch("NaiveDateTime", value)),
        }
    }
}

impl FromSql for DateTime<FixedOffset> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(*v),
            _ => Err(mismatch("DateTime<FixedOffset>", value)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handling() {
        assert!(matches!(
            i32::from_sql(&SqlValue::Null),
            Err(TypeError::UnexpectedNull)
        ));
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Null).unwrap(), None);
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Int(3)).unwrap(), Some(3));
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(i64::from_sql(&SqlValue::SmallInt(-4)).unwrap(), -4);
        assert_eq!(i32::from_sql(&SqlValue::BigInt(7)).unwrap(), 7);
        assert!(matches!(
            i32::from_sql(&SqlValue::BigInt(i64::MAX)),
            Err(TypeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_mismatch_names_types() {
        let err = String::from_sql(&SqlValue::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch: expected String, got INT");
    }

    #[test]
    fn test_decimal_from_integer() {
        assert_eq!(
            Decimal::from_sql(&SqlValue::Int(12)).unwrap(),
            Decimal::from(12)
        );
    }
}
