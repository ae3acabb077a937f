//! Rows returned by a driver.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared by every row of one result.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row: column values keyed by property name.
///
/// Drivers return rows from `find_one` and, for backends with
/// `RETURNING` support, alongside inserts so server-computed
/// columns can be mapped back onto the entity.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    pub fn new(names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::new(names)),
        }
    }

    /// Create a row that shares column metadata with other rows.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Build a row from `(name, value)` pairs.
    pub fn from_pairs<N, I>(pairs: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Value)>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self::new(names, values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .index_of(name)
            .and_then(|i| self.values.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    /// Iterate over `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_access() {
        let row = Row::from_pairs([("id", Value::Int(1)), ("name", Value::from("A"))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_named("name"), Some(&Value::from("A")));
        assert!(row.get_named("missing").is_none());
        assert!(row.contains("id"));
    }

    #[test]
    fn shared_columns() {
        let cols = Arc::new(ColumnInfo::new(vec!["id".into()]));
        let a = Row::with_columns(Arc::clone(&cols), vec![Value::Int(1)]);
        let b = Row::with_columns(cols, vec![Value::Int(2)]);
        assert_eq!(a.get_named("id"), Some(&Value::Int(1)));
        assert_eq!(b.get(0), Some(&Value::Int(2)));
        let pairs: Vec<_> = b.iter().collect();
        assert_eq!(pairs, vec![("id", &Value::Int(2))]);
    }
}
