//! Result records.
//!
//! A [`Record`] is one row of a result: column keys plus the raw wire values
//! in column order. Values stay in the transport's representation; turning
//! them into rich graph types is the value-layer collaborator's concern.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bolt::Value;

// ============================================================================
// Record
// ============================================================================

/// One result row.
#[derive(Debug, Clone)]
pub struct Record {
    keys: Arc<Vec<String>>,
    values: Vec<Value>,
    key_index: Arc<HashMap<String, usize>>,
}

impl Record {
    /// Build a record over a shared key set.
    pub(crate) fn new(
        keys: Arc<Vec<String>>,
        key_index: Arc<HashMap<String, usize>>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            keys,
            values,
            key_index,
        }
    }

    /// Build the shared key index for a result's records.
    pub(crate) fn index_keys(keys: &[String]) -> Arc<HashMap<String, usize>> {
        Arc::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| (k.clone(), i))
                .collect(),
        )
    }

    /// Column keys.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by column key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.key_index.get(key).and_then(|&i| self.values.get(i))
    }

    /// Value by column position.
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

// ============================================================================
// QueryResult
// ============================================================================

/// A fully consumed auto-commit result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column keys
    pub keys: Vec<String>,
    /// All records, in stream order
    pub records: Vec<Record>,
}

impl QueryResult {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the result has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// First record, if any.
    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }
}

impl IntoIterator for QueryResult {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
