//! In-memory bucket implementation.

use crate::bucket::{Bucket, UpdateAction, UpdateFn};
use crate::error::{KvError, KvResult};
use crate::view::{collate, DesignDoc, ViewParams, ViewResult, ViewRow};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A stored value together with its CAS generation.
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    cas: u64,
}

/// A thread-safe in-memory bucket.
///
/// Suitable for unit and integration tests and for embedded,
/// non-persistent deployments. Views are evaluated eagerly at query
/// time over a snapshot of the bucket contents, so they are never
/// stale.
///
/// # Example
///
/// ```rust
/// use sluice_kv::{Bucket, MemoryBucket};
///
/// let bucket = MemoryBucket::new("db");
/// bucket.set("greeting", 0, b"hello").unwrap();
/// assert_eq!(bucket.get("greeting").unwrap(), b"hello");
/// ```
pub struct MemoryBucket {
    name: String,
    entries: RwLock<HashMap<String, Entry>>,
    designs: RwLock<HashMap<String, DesignDoc>>,
    next_cas: RwLock<u64>,
}

impl MemoryBucket {
    /// Creates a new empty bucket with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            designs: RwLock::new(HashMap::new()),
            next_cas: RwLock::new(1),
        }
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the bucket holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn bump_cas(&self) -> u64 {
        let mut next = self.next_cas.write();
        let cas = *next;
        *next += 1;
        cas
    }
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        self.entries
            .read()
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| KvError::not_found(key))
    }

    fn set(&self, key: &str, _exp: u32, value: &[u8]) -> KvResult<()> {
        let cas = self.bump_cas();
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                cas,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.entries
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| KvError::not_found(key))
    }

    fn update(&self, key: &str, _exp: u32, callback: &mut UpdateFn<'_>) -> KvResult<()> {
        const MAX_ATTEMPTS: u32 = 100;

        for _ in 0..MAX_ATTEMPTS {
            // Snapshot the current value and its CAS outside the write lock
            // so the callback never runs while the bucket is locked.
            let snapshot = self.entries.read().get(key).cloned();
            let (current, cas) = match &snapshot {
                Some(e) => (Some(e.value.clone()), Some(e.cas)),
                None => (None, None),
            };

            let action = callback(current).map_err(KvError::Callback)?;

            let mut entries = self.entries.write();
            let unchanged = match (entries.get(key), cas) {
                (Some(e), Some(c)) => e.cas == c,
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                continue; // Lost the race; re-run the callback.
            }

            match action {
                UpdateAction::Replace(value) => {
                    let cas = self.bump_cas();
                    entries.insert(key.to_string(), Entry { value, cas });
                }
                UpdateAction::Delete => {
                    entries.remove(key);
                }
                UpdateAction::Cancel => {}
            }
            return Ok(());
        }

        Err(KvError::CasContention {
            key: key.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    fn view(&self, ddoc: &str, view: &str, params: &ViewParams) -> KvResult<ViewResult> {
        let designs = self.designs.read();
        let design = designs.get(ddoc).ok_or_else(|| KvError::ViewNotFound {
            ddoc: ddoc.to_string(),
            view: view.to_string(),
        })?;
        let map = design.view(view).ok_or_else(|| KvError::ViewNotFound {
            ddoc: ddoc.to_string(),
            view: view.to_string(),
        })?;

        let snapshot: Vec<(String, Vec<u8>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();

        let mut rows = Vec::new();
        for (key, value) in &snapshot {
            for (view_key, view_value) in map(key, value) {
                let selected = match (&params.key, &params.start_key, &params.end_key) {
                    (Some(exact), _, _) => collate(&view_key, exact).is_eq(),
                    (None, start, end) => {
                        start.as_ref().map_or(true, |s| !collate(&view_key, s).is_lt())
                            && end.as_ref().map_or(true, |e| !collate(&view_key, e).is_gt())
                    }
                };
                if selected {
                    rows.push(ViewRow {
                        id: key.clone(),
                        key: view_key,
                        value: view_value,
                    });
                }
            }
        }
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = params.limit {
            rows.truncate(limit);
        }
        Ok(ViewResult { rows })
    }

    fn put_design_doc(&self, ddoc: &str, design: DesignDoc) -> KvResult<()> {
        self.designs.write().insert(ddoc.to_string(), design);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_delete() {
        let bucket = MemoryBucket::new("test");
        bucket.set("k", 0, b"v").unwrap();
        assert_eq!(bucket.get("k").unwrap(), b"v");

        bucket.delete("k").unwrap();
        assert!(bucket.get("k").unwrap_err().is_not_found());
        assert!(bucket.delete("k").unwrap_err().is_not_found());
    }

    #[test]
    fn update_creates_missing_key() {
        let bucket = MemoryBucket::new("test");
        bucket
            .update("counter", 0, &mut |current| {
                assert!(current.is_none());
                Ok(UpdateAction::Replace(b"1".to_vec()))
            })
            .unwrap();
        assert_eq!(bucket.get("counter").unwrap(), b"1");
    }

    #[test]
    fn update_sees_current_value() {
        let bucket = MemoryBucket::new("test");
        bucket.set("counter", 0, b"41").unwrap();
        bucket
            .update("counter", 0, &mut |current| {
                let n: u64 = String::from_utf8(current.unwrap())
                    .unwrap()
                    .parse()
                    .unwrap();
                Ok(UpdateAction::Replace((n + 1).to_string().into_bytes()))
            })
            .unwrap();
        assert_eq!(bucket.get("counter").unwrap(), b"42");
    }

    #[test]
    fn update_cancel_leaves_value() {
        let bucket = MemoryBucket::new("test");
        bucket.set("k", 0, b"v").unwrap();
        bucket
            .update("k", 0, &mut |_| Ok(UpdateAction::Cancel))
            .unwrap();
        assert_eq!(bucket.get("k").unwrap(), b"v");
    }

    #[test]
    fn update_delete_removes_key() {
        let bucket = MemoryBucket::new("test");
        bucket.set("k", 0, b"v").unwrap();
        bucket
            .update("k", 0, &mut |_| Ok(UpdateAction::Delete))
            .unwrap();
        assert!(bucket.get("k").unwrap_err().is_not_found());
    }

    #[test]
    fn update_callback_error_tunnels_out() {
        let bucket = MemoryBucket::new("test");
        let err = bucket
            .update("k", 0, &mut |_| {
                Err(Box::from(std::io::Error::other("boom")))
            })
            .unwrap_err();
        assert!(matches!(err, KvError::Callback(_)));
    }

    #[test]
    fn concurrent_updates_all_apply() {
        use std::sync::Arc;
        let bucket = Arc::new(MemoryBucket::new("test"));
        bucket.set("counter", 0, b"0").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = Arc::clone(&bucket);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    bucket
                        .update("counter", 0, &mut |current| {
                            let n: u64 = String::from_utf8(current.unwrap())
                                .unwrap()
                                .parse()
                                .unwrap();
                            Ok(UpdateAction::Replace((n + 1).to_string().into_bytes()))
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bucket.get("counter").unwrap(), b"400");
    }

    #[test]
    fn view_query_with_key_filter() {
        let bucket = MemoryBucket::new("test");
        bucket.set("a", 0, br#"{"group":"x"}"#).unwrap();
        bucket.set("b", 0, br#"{"group":"y"}"#).unwrap();
        bucket.set("c", 0, br#"{"group":"x"}"#).unwrap();

        let mut design = DesignDoc::new();
        design.add_view(
            "by_group",
            Box::new(|key, value| {
                let parsed: serde_json::Value = match serde_json::from_slice(value) {
                    Ok(v) => v,
                    Err(_) => return vec![],
                };
                match parsed.get("group") {
                    Some(g) => vec![(g.clone(), json!(key))],
                    None => vec![],
                }
            }),
        );
        bucket.put_design_doc("app", design).unwrap();

        let result = bucket
            .view("app", "by_group", &ViewParams::for_key(json!("x")))
            .unwrap();
        let ids: Vec<&str> = result.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn view_query_with_range() {
        let bucket = MemoryBucket::new("test");
        for (key, seq) in [("d1", 1), ("d2", 5), ("d3", 9)] {
            bucket
                .set(key, 0, format!(r#"{{"seq":{seq}}}"#).as_bytes())
                .unwrap();
        }
        let mut design = DesignDoc::new();
        design.add_view(
            "by_seq",
            Box::new(|_key, value| {
                let parsed: serde_json::Value = match serde_json::from_slice(value) {
                    Ok(v) => v,
                    Err(_) => return vec![],
                };
                vec![(parsed["seq"].clone(), json!(null))]
            }),
        );
        bucket.put_design_doc("app", design).unwrap();

        let result = bucket
            .view(
                "app",
                "by_seq",
                &ViewParams::for_range(json!(2), json!(9)),
            )
            .unwrap();
        let ids: Vec<&str> = result.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
    }

    #[test]
    fn view_missing_is_an_error() {
        let bucket = MemoryBucket::new("test");
        let err = bucket
            .view("nope", "nothing", &ViewParams::default())
            .unwrap_err();
        assert!(matches!(err, KvError::ViewNotFound { .. }));
    }
}
