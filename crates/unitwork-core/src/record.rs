//! Column-name to value mappings used for snapshots and deltas.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of column values for one entity.
///
/// Used both for the current state of an object (as written by a storage map)
/// and for the last-known persisted snapshot. Columns are kept sorted so two
/// records with the same content always iterate identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    columns: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Set a column value, returning the previous one.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.columns.insert(column.into(), value.into())
    }

    /// Builder-style variant of [`Record::set`].
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Remove a column.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.columns.remove(column)
    }

    /// Check whether a column is present.
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay every column of `other` onto this record.
    pub fn merge(&mut self, other: &Record) {
        for (column, value) in &other.columns {
            self.columns.insert(column.clone(), value.clone());
        }
    }

    /// Extract the values of the given columns, in order.
    ///
    /// Returns `None` if any column is missing or NULL.
    pub fn key_values(&self, columns: &[&str]) -> Option<Vec<Value>> {
        columns
            .iter()
            .map(|c| self.get(c).filter(|v| !v.is_null()).cloned())
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// One changed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    /// Column name.
    pub column: String,
    /// Value the column now holds.
    pub value: Value,
}

/// The minimal set of column changes between a snapshot and current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    changes: Vec<ColumnChange>,
}

impl Delta {
    /// Create an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed column.
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.changes.push(ColumnChange {
            column: column.into(),
            value,
        });
    }

    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changed columns.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterate over the changes.
    pub fn iter(&self) -> impl Iterator<Item = &ColumnChange> {
        self.changes.iter()
    }

    /// Names of the changed columns.
    pub fn columns(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.column.as_str()).collect()
    }

    /// New value of a changed column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.changes
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_values_require_every_column() {
        let record = Record::new()
            .with("tenant", 3_i64)
            .with("id", Value::Null)
            .with("name", "x");
        assert_eq!(record.key_values(&["tenant"]), Some(vec![Value::BigInt(3)]));
        assert_eq!(record.key_values(&["tenant", "id"]), None);
        assert_eq!(record.key_values(&["missing"]), None);
    }

    #[test]
    fn merge_overwrites_and_extends() {
        let mut base = Record::new().with("id", Value::Null).with("name", "a");
        let returned = Record::new().with("id", 9_i64).with("version", 1_i64);
        base.merge(&returned);
        assert_eq!(base.get("id"), Some(&Value::BigInt(9)));
        assert_eq!(base.get("name"), Some(&Value::Text("a".into())));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn delta_lookup() {
        let mut delta = Delta::new();
        assert!(delta.is_empty());
        delta.push("name", Value::from("b"));
        assert_eq!(delta.columns(), vec!["name"]);
        assert_eq!(delta.get("name"), Some(&Value::Text("b".into())));
        assert_eq!(delta.get("id"), None);
    }
}
