//! JSON document bodies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};

/// A parsed JSON document body.
///
/// A thin wrapper over a JSON object map. serde_json's map is keyed by
/// a BTreeMap, so serializing a `Body` always produces sorted keys -
/// this is the canonical form revision-ID digests are computed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Body(pub Map<String, Value>);

impl Body {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a body from JSON bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Serializes the body to JSON bytes.
    ///
    /// Keys are emitted in sorted order, so equal bodies always produce
    /// identical bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// The `_rev` property, if present and a string.
    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.0.get("_rev").and_then(Value::as_str)
    }

    /// The `_id` property, if present and a string.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    /// True if the body carries `"_deleted": true`.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.0
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sets the `_rev` property.
    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.0.insert("_rev".to_string(), Value::String(rev.into()));
    }

    /// Sets the `_id` property.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("_id".to_string(), Value::String(id.into()));
    }

    /// Returns a copy with all underscore-prefixed properties removed.
    #[must_use]
    pub fn strip_special(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// The canonical bytes digested into a revision ID: the body with
    /// `_id`, `_rev`, `_revisions`, `_deleted` removed and attachment
    /// entries reduced to their digests.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut stripped: Map<String, Value> = self
            .0
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "_id" | "_rev" | "_revisions" | "_deleted"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(Value::Object(atts)) = stripped.get_mut("_attachments") {
            for meta in atts.values_mut() {
                if let Value::Object(meta) = meta {
                    meta.remove("data");
                }
            }
        }
        serde_json::to_vec(&stripped).unwrap_or_default()
    }
}

impl Deref for Body {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Body {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Body {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Body {
        match value {
            Value::Object(map) => Body(map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn accessors() {
        let b = body(json!({"_id": "doc1", "_rev": "1-abc", "_deleted": true, "x": 1}));
        assert_eq!(b.id(), Some("doc1"));
        assert_eq!(b.rev(), Some("1-abc"));
        assert!(b.is_deleted());
    }

    #[test]
    fn missing_deleted_is_false() {
        assert!(!body(json!({"x": 1})).is_deleted());
    }

    #[test]
    fn strip_special_removes_underscore_keys() {
        let b = body(json!({"_id": "d", "_rev": "1-a", "x": 1}));
        let stripped = b.strip_special();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.get("x"), Some(&json!(1)));
    }

    #[test]
    fn canonical_bytes_ignore_rev_and_key_order() {
        let a = body(json!({"b": 2, "a": 1, "_rev": "1-x"}));
        let b = body(json!({"a": 1, "b": 2, "_rev": "2-y"}));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn canonical_bytes_drop_attachment_data() {
        let a = body(json!({"_attachments": {"f": {"data": "00ff", "digest": "sha256-x"}}}));
        let b = body(json!({"_attachments": {"f": {"digest": "sha256-x"}}}));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }
}
