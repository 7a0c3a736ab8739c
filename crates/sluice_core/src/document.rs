//! The persisted document aggregate.
//!
//! A document couples the revision tree with its derived state: the
//! current winning revision, its tombstone flag, the latest sequence,
//! the channel membership history and the access grants. The winning
//! revision's parsed body lives at the top level for fast reads; a
//! demoted winner's body is stashed back into the tree.

use crate::body::Body;
use crate::channels::{AccessMap, ChannelMap};
use crate::error::{CoreError, CoreResult};
use crate::revtree::RevTree;
use serde::{Deserialize, Serialize};

/// One document and its replication metadata, as stored at the
/// document's KV key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// The document ID.
    #[serde(default)]
    pub id: String,
    /// The current winning leaf revision; empty if the document has
    /// never existed.
    #[serde(default)]
    pub rev: String,
    /// True if the winning revision is a tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// The sequence of the most recent committed write.
    #[serde(default)]
    pub sequence: u64,
    /// The revision tree.
    #[serde(default)]
    pub history: RevTree,
    /// Channel membership history.
    #[serde(default)]
    pub channels: ChannelMap,
    /// Channels this document grants to principals.
    #[serde(default)]
    pub access: AccessMap,
    /// The winning revision's parsed body.
    #[serde(default)]
    pub body: Body,
}

impl Document {
    /// Creates an empty document shell for `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Parses a document from its stored bytes; `None`/empty bytes
    /// produce a fresh shell (the document does not exist yet).
    pub fn unmarshal(id: &str, data: Option<&[u8]>) -> CoreResult<Self> {
        match data {
            None | Some([]) => Ok(Self::new(id)),
            Some(bytes) => {
                let mut doc: Document = serde_json::from_slice(bytes).map_err(|e| {
                    CoreError::internal(format!("corrupt document {id:?}: {e}"))
                })?;
                doc.id = id.to_string();
                Ok(doc)
            }
        }
    }

    /// Serializes the document for storage.
    pub fn marshal(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CoreError::internal(format!("cannot serialize document: {e}")))
    }

    /// True if the document has at least one revision.
    #[must_use]
    pub fn exists(&self) -> bool {
        !self.rev.is_empty()
    }

    /// Stores a revision body: at the top level if `rev` is the
    /// current winner, stashed into the tree otherwise.
    pub fn set_revision(&mut self, rev: &str, body: Body) {
        if rev == self.rev {
            self.history.set_body(rev, None);
            self.body = body;
        } else {
            self.history.set_body(rev, Some(body.to_bytes()));
        }
    }

    /// The parsed body of `rev`, with `_id` and `_rev` filled in;
    /// `None` if the body is no longer retained.
    #[must_use]
    pub fn get_revision(&self, rev: &str) -> Option<Body> {
        let mut body = if rev == self.rev && !self.rev.is_empty() {
            self.body.clone()
        } else {
            Body::from_slice(self.history.get_body(rev)?).ok()?
        };
        body.set_id(self.id.clone());
        body.set_rev(rev);
        Some(body)
    }

    /// The serialized body of `rev`, as handed to mapping functions;
    /// `None` if not retained.
    #[must_use]
    pub fn get_revision_json(&self, rev: &str) -> Option<Vec<u8>> {
        if rev == self.rev && !self.rev.is_empty() {
            Some(self.body.to_bytes())
        } else {
            self.history.get_body(rev).map(<[u8]>::to_vec)
        }
    }

    /// Recomputes `rev` and `deleted` from the tree after revisions
    /// were added, moving bodies so the new winner's parsed body is at
    /// the top level and the demoted winner's body is retained in the
    /// tree. `new_rev` is the revision the current write produced,
    /// whose parsed `new_body` is available.
    pub fn promote_winner(&mut self, new_rev: &str, new_body: Body) {
        let prev_current = self.rev.clone();
        self.rev = self.history.winning_revision();
        self.deleted = self
            .history
            .get(&self.rev)
            .is_some_and(|info| info.deleted);

        if self.rev != prev_current && !prev_current.is_empty() {
            // The old winner was demoted; keep its body in the tree.
            let stashed = self.body.to_bytes();
            self.history.set_body(&prev_current, Some(stashed));
        }

        self.set_revision(new_rev, new_body);

        if self.rev != new_rev && self.rev != prev_current {
            // A third revision won; hoist its stashed body.
            if let Some(parsed) = self
                .history
                .get_body(&self.rev)
                .and_then(|b| Body::from_slice(b).ok())
            {
                self.body = parsed;
                let winner = self.rev.clone();
                self.history.set_body(&winner, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revtree::RevInfo;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Body {
        match value {
            serde_json::Value::Object(map) => Body(map),
            _ => panic!("expected object"),
        }
    }

    fn doc_with_rev1() -> Document {
        let mut doc = Document::new("doc1");
        doc.history.add(RevInfo::new("1-aaa", "", false)).unwrap();
        doc.promote_winner("1-aaa", body(json!({"x": 1})));
        doc
    }

    #[test]
    fn unmarshal_missing_is_fresh_shell() {
        let doc = Document::unmarshal("doc1", None).unwrap();
        assert_eq!(doc.id, "doc1");
        assert!(!doc.exists());
        let doc = Document::unmarshal("doc1", Some(b"")).unwrap();
        assert!(!doc.exists());
    }

    #[test]
    fn marshal_roundtrip() {
        let doc = doc_with_rev1();
        let bytes = doc.marshal().unwrap();
        let back = Document::unmarshal("doc1", Some(&bytes)).unwrap();
        assert_eq!(back.rev, "1-aaa");
        assert_eq!(back.body.get("x"), Some(&json!(1)));
        assert!(back.history.contains("1-aaa"));
    }

    #[test]
    fn promote_winner_linear() {
        let mut doc = doc_with_rev1();
        doc.history
            .add(RevInfo::new("2-bbb", "1-aaa", false))
            .unwrap();
        doc.promote_winner("2-bbb", body(json!({"x": 2})));

        assert_eq!(doc.rev, "2-bbb");
        assert!(!doc.deleted);
        // The demoted rev 1 body is retained in the tree.
        assert!(doc.history.get_body("1-aaa").is_some());
        assert_eq!(doc.body.get("x"), Some(&json!(2)));
    }

    #[test]
    fn promote_winner_losing_branch_stashes_new_body() {
        let mut doc = doc_with_rev1();
        doc.history
            .add(RevInfo::new("2-zzz", "1-aaa", false))
            .unwrap();
        doc.promote_winner("2-zzz", body(json!({"v": "z"})));

        // A losing second branch arrives via replication.
        doc.history
            .add(RevInfo::new("2-abc", "1-aaa", false))
            .unwrap();
        doc.promote_winner("2-abc", body(json!({"v": "a"})));

        // 2-zzz still wins; the new revision's body went into the tree.
        assert_eq!(doc.rev, "2-zzz");
        assert_eq!(doc.body.get("v"), Some(&json!("z")));
        assert!(doc.history.get_body("2-abc").is_some());
    }

    #[test]
    fn get_revision_fills_id_and_rev() {
        let doc = doc_with_rev1();
        let b = doc.get_revision("1-aaa").unwrap();
        assert_eq!(b.id(), Some("doc1"));
        assert_eq!(b.rev(), Some("1-aaa"));
        assert_eq!(b.get("x"), Some(&json!(1)));
    }

    #[test]
    fn get_revision_missing_body_is_none() {
        let mut doc = doc_with_rev1();
        doc.history
            .add(RevInfo::new("2-bbb", "1-aaa", false))
            .unwrap();
        doc.promote_winner("2-bbb", body(json!({"x": 2})));
        // Drop rev 1's retained body, as eviction would.
        doc.history.set_body("1-aaa", None);
        assert!(doc.get_revision("1-aaa").is_none());
    }

    #[test]
    fn tombstone_winner_sets_deleted() {
        let mut doc = doc_with_rev1();
        doc.history
            .add(RevInfo::new("2-bbb", "1-aaa", true))
            .unwrap();
        doc.promote_winner("2-bbb", body(json!({"_deleted": true})));
        assert!(doc.deleted);
        assert_eq!(doc.rev, "2-bbb");
    }
}
