//! Driver-neutral row representation.
//!
//! Both backends convert their native rows into [`Row`] exactly once; the rest
//! of the workspace reads columns only through the typed getters here.

use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(if v { 1 } else { 0 })
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a parameter list from heterogeneous values.
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::Value>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::Value::from($v)),+] };
}

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: HashMap<String, Value>,
}

impl Row {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn opt_text(&self, column: &str) -> Option<String> {
        match self.values.get(column)? {
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Null => None,
        }
    }

    pub fn text(&self, column: &str) -> StoreResult<String> {
        self.opt_text(column)
            .ok_or_else(|| StoreError::column(column, "expected text, found null or missing"))
    }

    pub fn opt_real(&self, column: &str) -> Option<f64> {
        match self.values.get(column)? {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn real(&self, column: &str) -> StoreResult<f64> {
        self.opt_real(column)
            .ok_or_else(|| StoreError::column(column, "expected number"))
    }

    pub fn opt_integer(&self, column: &str) -> Option<i64> {
        match self.values.get(column)? {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> StoreResult<i64> {
        self.opt_integer(column)
            .ok_or_else(|| StoreError::column(column, "expected integer"))
    }

    /// SQLite has no boolean type; anything non-zero is true.
    pub fn flag(&self, column: &str) -> bool {
        self.opt_integer(column).map(|v| v != 0).unwrap_or(false)
    }

    /// Parse a JSON text column; null, missing and invalid JSON all yield `None`.
    pub fn json(&self, column: &str) -> Option<serde_json::Value> {
        self.opt_text(column)
            .and_then(|s| serde_json::from_str(&s).ok())
    }
}

/// Uniform result of one statement on any backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// `?, ?, ?` for an `IN (...)` clause.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getters_coerce_between_numeric_kinds() {
        let mut row = Row::default();
        row.insert("close", Value::Integer(12));
        row.insert("flag", Value::Integer(1));
        row.insert("note", Value::Null);
        row.insert("blob", Value::Text("{\"a\":1}".into()));

        assert_eq!(row.real("close").unwrap(), 12.0);
        assert!(row.flag("flag"));
        assert!(row.opt_text("note").is_none());
        assert!(row.text("note").is_err());
        assert_eq!(row.json("blob").unwrap()["a"], 1);
        assert!(row.integer("missing").is_err());
    }

    #[test]
    fn params_macro_converts() {
        let p = params!["a", 1i64, 2.5, None::<String>, true];
        assert_eq!(
            p,
            vec![
                Value::Text("a".into()),
                Value::Integer(1),
                Value::Real(2.5),
                Value::Null,
                Value::Integer(1),
            ]
        );
    }
}
