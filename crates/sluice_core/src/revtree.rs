//! The per-document revision tree.
//!
//! A directed tree of revision metadata rooted at the first revision,
//! branching when concurrent writers produce conflicts. Only leaf
//! revisions (and recently superseded leaves) keep bodies; ancestors
//! keep metadata so replication can reason about history.

use crate::error::{CoreError, CoreResult};
use crate::revid::{generation_of, parse_rev_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata for one revision in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevInfo {
    /// The revision ID (`<gen>-<digest>`).
    pub id: String,
    /// The parent revision ID; empty at the root.
    pub parent: String,
    /// True if this revision is a tombstone.
    pub deleted: bool,
    /// Stashed serialized body, kept only for the current winner's
    /// recently superseded predecessor and grafted non-winners.
    pub body: Option<Vec<u8>>,
}

impl RevInfo {
    /// Creates revision metadata with no stashed body.
    #[must_use]
    pub fn new(id: impl Into<String>, parent: impl Into<String>, deleted: bool) -> Self {
        Self {
            id: id.into(),
            parent: parent.into(),
            deleted,
            body: None,
        }
    }
}

/// The revision history of one document.
///
/// # Invariants
///
/// - every non-root revision's parent exists in the tree
/// - revision IDs are unique
/// - a revision's generation is its parent's + 1 (1 at a root)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "RevTreeList", try_from = "RevTreeList")]
pub struct RevTree {
    revs: BTreeMap<String, RevInfo>,
}

impl RevTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of revisions in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revs.len()
    }

    /// True if the tree has no revisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// True if `rev` is in the tree.
    #[must_use]
    pub fn contains(&self, rev: &str) -> bool {
        self.revs.contains_key(rev)
    }

    /// The metadata for `rev`, if present.
    #[must_use]
    pub fn get(&self, rev: &str) -> Option<&RevInfo> {
        self.revs.get(rev)
    }

    /// The parent of `rev` (`None` if `rev` is absent or a root).
    #[must_use]
    pub fn parent(&self, rev: &str) -> Option<&str> {
        self.revs
            .get(rev)
            .map(|info| info.parent.as_str())
            .filter(|p| !p.is_empty())
    }

    /// True if `rev` is present and has no children.
    #[must_use]
    pub fn is_leaf(&self, rev: &str) -> bool {
        self.contains(rev) && !self.revs.values().any(|info| info.parent == rev)
    }

    /// Iterates over all revision IDs.
    pub fn rev_ids(&self) -> impl Iterator<Item = &str> {
        self.revs.keys().map(String::as_str)
    }

    /// All leaf revisions.
    pub fn leaves(&self) -> impl Iterator<Item = &RevInfo> {
        self.revs.values().filter(|info| self.is_leaf(&info.id))
    }

    /// Adds a revision to the tree.
    ///
    /// # Errors
    ///
    /// Returns a 400 error if the revision is already present or names
    /// a parent the tree does not contain.
    pub fn add(&mut self, info: RevInfo) -> CoreResult<()> {
        if info.id.is_empty() {
            return Err(CoreError::bad_request("empty revision ID"));
        }
        if self.contains(&info.id) {
            return Err(CoreError::bad_request(format!(
                "revision {} already exists",
                info.id
            )));
        }
        if !info.parent.is_empty() && !self.contains(&info.parent) {
            return Err(CoreError::bad_request(format!(
                "parent revision {} not found",
                info.parent
            )));
        }
        self.revs.insert(info.id.clone(), info);
        Ok(())
    }

    /// The chain of revision IDs from `rev` back to the root,
    /// starting with `rev` itself.
    #[must_use]
    pub fn ancestry(&self, rev: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = rev;
        while let Some(info) = self.revs.get(current) {
            chain.push(info.id.clone());
            if info.parent.is_empty() {
                break;
            }
            current = &info.parent;
        }
        chain
    }

    /// The first member of `ancestry(rev)` that appears in
    /// `candidates`, if any.
    #[must_use]
    pub fn find_ancestor_in(&self, rev: &str, candidates: &[String]) -> Option<String> {
        self.ancestry(rev)
            .into_iter()
            .find(|ancestor| candidates.iter().any(|c| c == ancestor))
    }

    /// The winning leaf revision.
    ///
    /// Of all non-deleted leaves, the one with the greatest generation,
    /// tiebroken by the lexicographically greatest revision ID. If all
    /// leaves are deleted, the same rule applies to deleted leaves. The
    /// result is a pure function of the tree contents, so replicas
    /// converge regardless of insertion order. Empty if the tree is
    /// empty.
    #[must_use]
    pub fn winning_revision(&self) -> String {
        let mut winner = "";
        let mut winner_deleted = true;
        let mut winner_generation = 0u64;

        for leaf in self.leaves() {
            let generation = generation_of(&leaf.id);
            let preferred = if winner.is_empty() {
                true
            } else if winner_deleted != leaf.deleted {
                // A live leaf always beats a tombstone.
                winner_deleted && !leaf.deleted
            } else {
                (generation, leaf.id.as_str()) > (winner_generation, winner)
            };
            if preferred {
                winner = &leaf.id;
                winner_deleted = leaf.deleted;
                winner_generation = generation;
            }
        }
        winner.to_string()
    }

    /// Stashes (or clears) the serialized body of `rev`.
    pub fn set_body(&mut self, rev: &str, body: Option<Vec<u8>>) {
        if let Some(info) = self.revs.get_mut(rev) {
            info.body = body;
        }
    }

    /// The stashed serialized body of `rev`, if retained.
    #[must_use]
    pub fn get_body(&self, rev: &str) -> Option<&[u8]> {
        self.revs.get(rev).and_then(|info| info.body.as_deref())
    }
}

/// CouchDB-style `_revisions` encoding of an ancestry chain: the
/// starting generation plus the bare digests, newest first.
#[must_use]
pub fn encode_revisions(history: &[String]) -> Value {
    let start = history.first().map_or(0, |rev| generation_of(rev));
    let ids: Vec<Value> = history
        .iter()
        .map(|rev| {
            let digest = parse_rev_id(rev).map(|(_, d)| d).unwrap_or("");
            Value::String(digest.to_string())
        })
        .collect();
    serde_json::json!({ "start": start, "ids": ids })
}

/// Persisted form of a [`RevTree`]: parallel arrays, parents as
/// indexes (-1 for roots), tombstones as an index list, stashed bodies
/// as nullable strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevTreeList {
    /// Revision IDs.
    pub revs: Vec<String>,
    /// Index of each revision's parent in `revs`, or -1.
    pub parents: Vec<i64>,
    /// Indexes of tombstone revisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<usize>,
    /// Stashed serialized bodies, aligned with `revs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bodies: Option<Vec<Option<String>>>,
}

impl From<RevTree> for RevTreeList {
    fn from(tree: RevTree) -> Self {
        let revs: Vec<String> = tree.revs.keys().cloned().collect();
        let index_of = |rev: &str| revs.iter().position(|r| r == rev);

        let mut parents = Vec::with_capacity(revs.len());
        let mut deleted = Vec::new();
        let mut bodies: Vec<Option<String>> = Vec::with_capacity(revs.len());
        let mut any_body = false;

        for (i, rev) in revs.iter().enumerate() {
            let info = &tree.revs[rev];
            parents.push(
                index_of(&info.parent)
                    .map(|p| p as i64)
                    .unwrap_or(-1),
            );
            if info.deleted {
                deleted.push(i);
            }
            let body = info
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned());
            any_body |= body.is_some();
            bodies.push(body);
        }

        Self {
            revs,
            parents,
            deleted,
            bodies: any_body.then_some(bodies),
        }
    }
}

impl TryFrom<RevTreeList> for RevTree {
    type Error = String;

    fn try_from(list: RevTreeList) -> Result<Self, Self::Error> {
        if list.parents.len() != list.revs.len() {
            return Err("history parents/revs length mismatch".to_string());
        }
        let mut tree = RevTree::new();
        for (i, rev) in list.revs.iter().enumerate() {
            let parent = match list.parents[i] {
                -1 => String::new(),
                p => list
                    .revs
                    .get(p as usize)
                    .cloned()
                    .ok_or_else(|| format!("history parent index {p} out of range"))?,
            };
            let body = list
                .bodies
                .as_ref()
                .and_then(|bodies| bodies.get(i).cloned().flatten())
                .map(String::into_bytes);
            tree.revs.insert(
                rev.clone(),
                RevInfo {
                    id: rev.clone(),
                    parent,
                    deleted: list.deleted.contains(&i),
                    body,
                },
            );
        }
        // Every named parent must resolve within the same tree.
        for info in tree.revs.values() {
            if !info.parent.is_empty() && !tree.revs.contains_key(&info.parent) {
                return Err(format!("dangling parent {} in history", info.parent));
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_tree() -> RevTree {
        let mut tree = RevTree::new();
        tree.add(RevInfo::new("1-aaa", "", false)).unwrap();
        tree.add(RevInfo::new("2-bbb", "1-aaa", false)).unwrap();
        tree.add(RevInfo::new("3-ccc", "2-bbb", false)).unwrap();
        tree
    }

    #[test]
    fn add_and_query() {
        let tree = linear_tree();
        assert_eq!(tree.len(), 3);
        assert!(tree.contains("2-bbb"));
        assert!(!tree.is_leaf("2-bbb"));
        assert!(tree.is_leaf("3-ccc"));
        assert_eq!(tree.parent("2-bbb"), Some("1-aaa"));
        assert_eq!(tree.parent("1-aaa"), None);
    }

    #[test]
    fn add_rejects_duplicates_and_orphans() {
        let mut tree = linear_tree();
        assert!(tree.add(RevInfo::new("1-aaa", "", false)).is_err());
        assert!(tree.add(RevInfo::new("4-ddd", "3-zzz", false)).is_err());
    }

    #[test]
    fn ancestry_runs_to_root() {
        let tree = linear_tree();
        assert_eq!(tree.ancestry("3-ccc"), vec!["3-ccc", "2-bbb", "1-aaa"]);
        assert_eq!(tree.ancestry("1-aaa"), vec!["1-aaa"]);
        assert!(tree.ancestry("9-nope").is_empty());
    }

    #[test]
    fn find_ancestor_in_candidates() {
        let tree = linear_tree();
        let candidates = vec!["1-aaa".to_string(), "9-zzz".to_string()];
        assert_eq!(
            tree.find_ancestor_in("3-ccc", &candidates),
            Some("1-aaa".to_string())
        );
        assert_eq!(tree.find_ancestor_in("3-ccc", &[]), None);
    }

    #[test]
    fn winner_is_deepest_leaf() {
        let tree = linear_tree();
        assert_eq!(tree.winning_revision(), "3-ccc");
    }

    #[test]
    fn winner_tiebreak_is_lexicographic() {
        let mut tree = RevTree::new();
        tree.add(RevInfo::new("1-aaa", "", false)).unwrap();
        tree.add(RevInfo::new("2-abc", "1-aaa", false)).unwrap();
        tree.add(RevInfo::new("2-xyz", "1-aaa", false)).unwrap();
        assert_eq!(tree.winning_revision(), "2-xyz");
    }

    #[test]
    fn live_leaf_beats_deeper_tombstone() {
        let mut tree = RevTree::new();
        tree.add(RevInfo::new("1-aaa", "", false)).unwrap();
        tree.add(RevInfo::new("2-ddd", "1-aaa", true)).unwrap();
        tree.add(RevInfo::new("2-bbb", "1-aaa", false)).unwrap();
        tree.add(RevInfo::new("3-eee", "2-ddd", true)).unwrap();
        assert_eq!(tree.winning_revision(), "2-bbb");
    }

    #[test]
    fn all_deleted_picks_deleted_winner() {
        let mut tree = RevTree::new();
        tree.add(RevInfo::new("1-aaa", "", false)).unwrap();
        tree.add(RevInfo::new("2-bbb", "1-aaa", true)).unwrap();
        assert_eq!(tree.winning_revision(), "2-bbb");
    }

    #[test]
    fn winner_independent_of_insertion_order() {
        let mut forward = RevTree::new();
        forward.add(RevInfo::new("1-aaa", "", false)).unwrap();
        forward.add(RevInfo::new("2-abc", "1-aaa", false)).unwrap();
        forward.add(RevInfo::new("2-xyz", "1-aaa", false)).unwrap();

        let mut reverse = RevTree::new();
        reverse.add(RevInfo::new("1-aaa", "", false)).unwrap();
        reverse.add(RevInfo::new("2-xyz", "1-aaa", false)).unwrap();
        reverse.add(RevInfo::new("2-abc", "1-aaa", false)).unwrap();

        assert_eq!(forward.winning_revision(), reverse.winning_revision());
    }

    #[test]
    fn body_stash() {
        let mut tree = linear_tree();
        tree.set_body("2-bbb", Some(b"{\"x\":1}".to_vec()));
        assert_eq!(tree.get_body("2-bbb"), Some(b"{\"x\":1}".as_slice()));
        tree.set_body("2-bbb", None);
        assert!(tree.get_body("2-bbb").is_none());
    }

    #[test]
    fn persisted_roundtrip() {
        let mut tree = linear_tree();
        tree.add(RevInfo::new("2-ddd", "1-aaa", true)).unwrap();
        tree.set_body("2-bbb", Some(b"{\"x\":1}".to_vec()));

        let json = serde_json::to_string(&tree).unwrap();
        let back: RevTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
        assert!(back.get("2-ddd").unwrap().deleted);
        assert_eq!(back.get_body("2-bbb"), Some(b"{\"x\":1}".as_slice()));
    }

    #[test]
    fn persisted_rejects_dangling_parent() {
        let list = RevTreeList {
            revs: vec!["2-b".to_string()],
            parents: vec![5],
            deleted: vec![],
            bodies: None,
        };
        assert!(RevTree::try_from(list).is_err());
    }

    #[test]
    fn encode_revisions_format() {
        let history = vec!["3-ccc".to_string(), "2-bbb".to_string(), "1-aaa".to_string()];
        let encoded = encode_revisions(&history);
        assert_eq!(encoded["start"], 3);
        assert_eq!(encoded["ids"][0], "ccc");
        assert_eq!(encoded["ids"][2], "aaa");
    }
}
