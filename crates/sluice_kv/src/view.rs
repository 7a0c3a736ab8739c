//! View types and JSON collation.
//!
//! Views are the bucket's materialized-index mechanism. A design
//! document carries named map functions; each map function is applied
//! to every (key, value) pair in the bucket and emits zero or more
//! (view key, view value) rows. Query results are sorted by view key
//! under the collation defined by [`collate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A view map function.
///
/// Applied to each stored (key, value) pair; emits `(view_key,
/// view_value)` rows. Values that a map function cannot interpret
/// should produce no rows rather than an error.
pub type MapFn = Box<dyn Fn(&str, &[u8]) -> Vec<(Value, Value)> + Send + Sync>;

/// A design document: a named set of view map functions.
#[derive(Default)]
pub struct DesignDoc {
    views: HashMap<String, MapFn>,
}

impl DesignDoc {
    /// Creates an empty design document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named view, replacing any previous view of that name.
    pub fn add_view(&mut self, name: impl Into<String>, map: MapFn) -> &mut Self {
        self.views.insert(name.into(), map);
        self
    }

    /// Returns the map function for `name`, if defined.
    #[must_use]
    pub fn view(&self, name: &str) -> Option<&MapFn> {
        self.views.get(name)
    }
}

impl std::fmt::Debug for DesignDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.views.keys().collect();
        names.sort();
        f.debug_struct("DesignDoc").field("views", &names).finish()
    }
}

/// Parameters for a view query.
#[derive(Debug, Clone, Default)]
pub struct ViewParams {
    /// Exact-match key filter.
    pub key: Option<Value>,
    /// Inclusive lower bound on the view key.
    pub start_key: Option<Value>,
    /// Inclusive upper bound on the view key.
    pub end_key: Option<Value>,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
}

impl ViewParams {
    /// Parameters selecting exactly one key.
    #[must_use]
    pub fn for_key(key: Value) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Parameters selecting an inclusive key range.
    #[must_use]
    pub fn for_range(start_key: Value, end_key: Value) -> Self {
        Self {
            start_key: Some(start_key),
            end_key: Some(end_key),
            ..Self::default()
        }
    }
}

/// A single row of a view result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// The bucket key of the document that emitted this row.
    pub id: String,
    /// The emitted view key.
    pub key: Value,
    /// The emitted view value.
    pub value: Value,
}

/// The result of a view query: rows sorted by view key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewResult {
    /// Matching rows in collation order.
    pub rows: Vec<ViewRow>,
}

/// Compares two JSON values under CouchDB-style collation.
///
/// Type order: null < bool < number < string < array < object.
/// Within a type: false < true; numbers by value; strings by code
/// point; arrays element-wise then by length; objects by their sorted
/// (key, value) entry lists.
#[must_use]
pub fn collate(a: &Value, b: &Value) -> Ordering {
    fn type_rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(f64::NAN);
            let yf = y.as_f64().unwrap_or(f64::NAN);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = collate(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let xe: Vec<_> = x.iter().collect();
            let ye: Vec<_> = y.iter().collect();
            for ((xk, xv), (yk, yv)) in xe.iter().zip(ye.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = collate(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xe.len().cmp(&ye.len())
        }
        _ => Ordering::Equal,
    }
}
