//! # tds-types
//!
//! Typed decoding of TDS column values.
//!
//! Rows leave the token parser as raw byte slices. This crate turns a raw
//! slice plus its [`ColumnDescriptor`](tds_protocol::ColumnDescriptor) into
//! a [`SqlValue`], and a `SqlValue` into a Rust type through [`FromSql`].
//! Failures are [`TypeError`]s scoped to the one value.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | Rust Type |
//! |-----------------|-----------|
//! | `BIT` | `bool` |
//! | `TINYINT` | `u8` |
//! | `SMALLINT` | `i16` |
//! | `INT` | `i32` |
//! | `BIGINT` | `i64` |
//! | `REAL` | `f32` |
//! | `FLOAT` | `f64` |
//! | `DECIMAL`/`NUMERIC`/`MONEY` | `rust_decimal::Decimal` |
//! | `CHAR`/`VARCHAR`/`NCHAR`/`NVARCHAR` | `String` |
//! | `BINARY`/`VARBINARY` | `bytes::Bytes` |
//! | `UNIQUEIDENTIFIER` | `uuid::Uuid` |
//! | `DATE` | `chrono::NaiveDate` |
//! | `TIME` | `chrono::NaiveTime` |
//! | `DATETIME`/`SMALLDATETIME`/`DATETIME2` | `chrono::NaiveDateTime` |
//! | `DATETIMEOFFSET` | `chrono::DateTime<FixedOffset>` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod decode;
pub mod error;
pub mod from_sql;
pub mod value;

pub use decode::{decode_utf16_string, decode_value};
pub use error::TypeError;
pub use from_sql::FromSql;
pub use value::SqlValue;
