//! Column lookup table.
//!
//! Built once per COLMETADATA token and shared by every row decoded under
//! that schema generation.

use std::collections::HashMap;
use std::sync::Arc;

use tds_protocol::{ColMetaData, ColumnDescriptor};

/// Name to ordinal index over one schema generation.
#[derive(Debug)]
pub struct LookupTable {
    metadata: Arc<ColMetaData>,
    by_name: HashMap<String, usize>,
}

impl LookupTable {
    /// Build the table. Duplicate names resolve to their first occurrence.
    #[must_use]
    pub fn build(metadata: Arc<ColMetaData>) -> Self {
        let mut by_name = HashMap::with_capacity(metadata.columns.len());
        for (ordinal, column) in metadata.columns.iter().enumerate() {
            by_name.entry(column.name.clone()).or_insert(ordinal);
        }
        Self { metadata, by_name }
    }

    /// Find a column by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(usize, &ColumnDescriptor)> {
        let ordinal = *self.by_name.get(name)?;
        self.metadata.columns.get(ordinal).map(|c| (ordinal, c))
    }

    /// Schema generation the table was built from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }

    /// Columns in ordinal order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.metadata.columns
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metadata.columns.len()
    }

    /// Whether the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.columns.is_empty()
    }
}
