//! Result rows.
//!
//! A [`Row`] holds the raw column slices exactly as the token parser
//! produced them plus a shared handle to the [`LookupTable`] of its schema
//! generation. Typed decoding happens on access.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tds_protocol::{ColumnDescriptor, ProtocolError, RowData};
use tds_types::{FromSql, SqlValue, decode_value};

use crate::error::{Error, Result};
use crate::lookup::LookupTable;

/// A single result row.
#[derive(Clone)]
pub struct Row {
    table: Arc<LookupTable>,
    columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Pair raw row data with the lookup table of its schema.
    ///
    /// Fails with [`ProtocolError::StaleMetadata`] when the row was decoded
    /// against a different schema generation than the table describes.
    pub fn new(table: Arc<LookupTable>, data: RowData) -> std::result::Result<Self, ProtocolError> {
        if data.generation != table.generation() {
            return Err(ProtocolError::StaleMetadata {
                expected: table.generation(),
                actual: data.generation,
            });
        }
        if data.columns.len() != table.len() {
            return Err(ProtocolError::Malformed(format!(
                "row has {} values for {} columns",
                data.columns.len(),
                table.len()
            )));
        }
        Ok(Self {
            table,
            columns: data.columns,
        })
    }

    /// Get a value by column name with type conversion.
    pub fn get<T: FromSql>(&self, name: &str) -> Result<T> {
        let value = self.value(name)?;
        Ok(T::from_sql(&value)?)
    }

    /// Get a value by ordinal with type conversion.
    pub fn get_at<T: FromSql>(&self, index: usize) -> Result<T> {
        let value = self.value_at(index)?;
        Ok(T::from_sql(&value)?)
    }

    /// Decode the named column.
    pub fn value(&self, name: &str) -> Result<SqlValue> {
        let (index, column) = self.column(name)?;
        self.decode(index, column)
    }

    /// Decode the column at `index`.
    pub fn value_at(&self, index: usize) -> Result<SqlValue> {
        let column = self
            .table
            .columns()
            .get(index)
            .ok_or_else(|| Error::ColumnNotFound(format!("#{index}")))?;
        self.decode(index, column)
    }

    /// Raw bytes of the named column; `None` is SQL NULL.
    pub fn raw(&self, name: &str) -> Result<Option<&[u8]>> {
        let (index, _) = self.column(name)?;
        Ok(self.columns[index].as_deref())
    }

    /// All columns decoded, as name/value pairs in ordinal order.
    pub fn values(&self) -> Result<Vec<(String, SqlValue)>> {
        self.table
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| Ok((column.name.clone(), self.decode(index, column)?)))
            .collect()
    }

    /// Check whether the named column is NULL.
    #[must_use]
    pub fn is_null(&self, name: &str) -> bool {
        matches!(self.raw(name), Ok(None))
    }

    /// Column descriptors in ordinal order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        self.table.columns()
    }

    /// The lookup table this row shares with its result set.
    #[must_use]
    pub fn lookup_table(&self) -> &Arc<LookupTable> {
        &self.table
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn column(&self, name: &str) -> Result<(usize, &ColumnDescriptor)> {
        self.table
            .lookup(name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    fn decode(&self, index: usize, column: &ColumnDescriptor) -> Result<SqlValue> {
        Ok(decode_value(column, self.columns[index].as_deref())?)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("generation", &self.table.generation())
            .field("columns", &self.columns.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{ColMetaData, TypeId, TypeInfo};
    use tds_types::TypeError;

    fn table() -> Arc<LookupTable> {
        let columns = vec![
            ColumnDescriptor::new(
                "id",
                TypeId::IntN,
                TypeInfo {
                    max_length: Some(4),
                    ..Default::default()
                },
            ),
            ColumnDescriptor::new(
                "name",
                TypeId::NVarChar,
                TypeInfo {
                    max_length: Some(100),
                    ..Default::default()
                },
            ),
        ];
        let metadata = ColMetaData {
            generation: 0,
            columns,
        }
        .with_generation(1);
        Arc::new(LookupTable::build(Arc::new(metadata)))
    }

    fn data(generation: u64, name: Option<&'static [u8]>) -> RowData {
        RowData {
            generation,
            columns: vec![
                Some(Bytes::from_static(&[42, 0, 0, 0])),
                name.map(Bytes::from_static),
            ],
        }
    }

    #[test]
    fn test_typed_access() {
        let row = Row::new(table(), data(1, Some(&[b'h', 0, b'i', 0]))).unwrap();
        assert_eq!(row.get::<i32>("id").unwrap(), 42);
        assert_eq!(row.get::<String>("name").unwrap(), "hi");
        assert_eq!(row.get_at::<i64>(0).unwrap(), 42);
        assert_eq!(row.raw("id").unwrap(), Some(&[42u8, 0, 0, 0][..]));
    }

    #[test]
    fn test_null_column() {
        let row = Row::new(table(), data(1, None)).unwrap();
        assert!(row.is_null("name"));
        assert_eq!(row.value("name").unwrap(), SqlValue::Null);
        assert_eq!(row.get::<Option<String>>("name").unwrap(), None);
        assert!(matches!(
            row.get::<String>("name"),
            Err(Error::Type(TypeError::UnexpectedNull))
        ));
    }

    #[test]
    fn test_values_in_ordinal_order() {
        let row = Row::new(table(), data(1, Some(&[b'x', 0]))).unwrap();
        let values = row.values().unwrap();
        assert_eq!(values[0], ("id".to_string(), SqlValue::Int(42)));
        assert_eq!(values[1], ("name".to_string(), SqlValue::String("x".into())));
    }

    #[test]
    fn test_missing_column() {
        let row = Row::new(table(), data(1, None)).unwrap();
        assert!(matches!(row.value("nope"), Err(Error::ColumnNotFound(_))));
        assert!(matches!(row.value_at(9), Err(Error::ColumnNotFound(_))));
    }

    #[test]
    fn test_unsupported_type_fails_only_that_value() {
        let metadata = ColMetaData {
            generation: 0,
            columns: vec![
                ColumnDescriptor::new("v", TypeId::Variant, TypeInfo::default()),
                ColumnDescriptor::new("id", TypeId::Int4, TypeInfo::default()),
            ],
        }
        .with_generation(1);
        let table = Arc::new(LookupTable::build(Arc::new(metadata)));
        let row = Row::new(
            table,
            RowData {
                generation: 1,
                columns: vec![
                    Some(Bytes::from_static(&[0x38, 0, 1, 0, 0, 0])),
                    Some(Bytes::from_static(&[7, 0, 0, 0])),
                ],
            },
        )
        .unwrap();

        assert!(matches!(
            row.value("v"),
            Err(Error::Type(TypeError::UnsupportedType(0x62)))
        ));
        assert_eq!(row.raw("v").unwrap(), Some(&[0x38, 0, 1, 0, 0, 0][..]));
        assert_eq!(row.get::<i32>("id").unwrap(), 7);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let err = Row::new(table(), data(2, None)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::StaleMetadata {
                expected: 1,
                actual: 2
            }
        );
    }
}
