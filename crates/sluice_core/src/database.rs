//! The shared per-database context.

use crate::auth::{strip_star, Authenticator, ChannelComputer};
use crate::changes::ChangeFeed;
use crate::channels::ChannelSet;
use crate::error::CoreResult;
use crate::mapper::{ChannelMapper, DefaultChannelMapper, Validator};
use crate::sequence::SequenceAllocator;
use parking_lot::RwLock;
use serde_json::{json, Value};
use sluice_kv::{Bucket, DesignDoc, MapFn, ViewParams};
use std::sync::Arc;
use tracing::debug;

/// The design document holding the gateway's views.
pub const DESIGN_DOC: &str = "sync_gateway";

/// Shared, long-lived state for one database.
///
/// One context exists per configured database and is shared by every
/// request handler. The mapper and validator slots are the only
/// mutable configuration; each sits behind its own lock, and no lock
/// is held across bucket or evaluator calls.
pub struct DatabaseContext {
    name: String,
    bucket: Arc<dyn Bucket>,
    sequences: SequenceAllocator,
    mapper: RwLock<Arc<dyn ChannelMapper>>,
    validator: RwLock<Option<Arc<dyn Validator>>>,
    feed: ChangeFeed,
}

impl DatabaseContext {
    /// Creates a context over `bucket`, installing the gateway design
    /// document and the default channel mapper.
    pub fn new(name: impl Into<String>, bucket: Arc<dyn Bucket>) -> CoreResult<Arc<Self>> {
        bucket.put_design_doc(DESIGN_DOC, gateway_design_doc())?;
        Ok(Arc::new(Self {
            name: name.into(),
            sequences: SequenceAllocator::new(Arc::clone(&bucket)),
            bucket,
            mapper: RwLock::new(Arc::new(DefaultChannelMapper::new())),
            validator: RwLock::new(None),
            feed: ChangeFeed::new(),
        }))
    }

    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying bucket.
    #[must_use]
    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// The sequence allocator.
    #[must_use]
    pub fn sequences(&self) -> &SequenceAllocator {
        &self.sequences
    }

    /// The commit notification feed.
    #[must_use]
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// The configured channel mapper.
    #[must_use]
    pub fn channel_mapper(&self) -> Arc<dyn ChannelMapper> {
        Arc::clone(&self.mapper.read())
    }

    /// Replaces the channel mapper.
    pub fn set_channel_mapper(&self, mapper: Arc<dyn ChannelMapper>) {
        *self.mapper.write() = mapper;
    }

    /// The configured validator, if any.
    #[must_use]
    pub fn validator(&self) -> Option<Arc<dyn Validator>> {
        self.validator.read().clone()
    }

    /// Replaces (or clears) the validator.
    pub fn set_validator(&self, validator: Option<Arc<dyn Validator>>) {
        *self.validator.write() = validator;
    }

    /// An authenticator whose document-granted channels resolve
    /// through this context's access view.
    #[must_use]
    pub fn authenticator(self: &Arc<Self>) -> Authenticator {
        Authenticator::new(
            Arc::clone(&self.bucket),
            Some(Arc::clone(self) as Arc<dyn ChannelComputer>),
        )
    }
}

impl ChannelComputer for DatabaseContext {
    /// Recomputes the channels granted to a principal by documents'
    /// access maps: the union over the access view's rows for the
    /// principal's key, with `*` stripped.
    fn compute_channels(&self, access_view_key: &str) -> CoreResult<ChannelSet> {
        let result = self.bucket.view(
            DESIGN_DOC,
            "access",
            &ViewParams::for_key(json!(access_view_key)),
        )?;
        let mut channels = ChannelSet::new();
        for row in result.rows {
            if let Value::Array(items) = row.value {
                channels.extend(items.into_iter().filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                }));
            }
        }
        let channels = strip_star(channels);
        debug!(
            principal = access_view_key,
            count = channels.len(),
            "computed document-granted channels"
        );
        Ok(channels)
    }
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("name", &self.name)
            .field("bucket", &self.bucket.name())
            .finish_non_exhaustive()
    }
}

/// True for keys outside the replicated document namespace.
fn is_internal_key(key: &str) -> bool {
    key.starts_with("_sync:") || key.starts_with("user:") || key.starts_with("role:")
}

/// Parses a stored value as a gateway document, or `None` for
/// principals, special documents and foreign data.
fn parse_doc_record(key: &str, value: &[u8]) -> Option<Value> {
    if is_internal_key(key) {
        return None;
    }
    let parsed: Value = serde_json::from_slice(value).ok()?;
    if parsed.get("history").is_some() && parsed.get("rev").is_some() {
        Some(parsed)
    } else {
        None
    }
}

/// Builds the gateway design document.
///
/// - `access`: emits `(principal key, granted channels)` per document
///   access entry; drives principal channel recomputation.
/// - `channels`: emits `([channel, seq], {rev, deleted?})` for current
///   members and `([channel, seq], {rev, removed})` for removals;
///   drives the incremental changes query.
pub fn gateway_design_doc() -> DesignDoc {
    let mut design = DesignDoc::new();

    let access: MapFn = Box::new(|key, value| {
        let Some(doc) = parse_doc_record(key, value) else {
            return vec![];
        };
        let Some(Value::Object(access)) = doc.get("access") else {
            return vec![];
        };
        access
            .iter()
            .map(|(principal, channels)| (json!(principal), channels.clone()))
            .collect()
    });
    design.add_view("access", access);

    let channels: MapFn = Box::new(|key, value| {
        let Some(doc) = parse_doc_record(key, value) else {
            return vec![];
        };
        let Some(Value::Object(channel_map)) = doc.get("channels") else {
            return vec![];
        };
        let sequence = doc.get("sequence").and_then(Value::as_u64).unwrap_or(0);
        let rev = doc.get("rev").and_then(Value::as_str).unwrap_or("");
        let deleted = doc.get("deleted").and_then(Value::as_bool).unwrap_or(false);

        let mut rows = Vec::new();
        for (channel, state) in channel_map {
            match state {
                Value::Null => {
                    let mut value = json!({ "rev": rev });
                    if deleted {
                        value["deleted"] = json!(true);
                    }
                    rows.push((json!([channel, sequence]), value));
                }
                Value::Object(removal) => {
                    let seq = removal.get("seq").and_then(Value::as_u64).unwrap_or(0);
                    let removed_rev =
                        removal.get("rev").and_then(Value::as_str).unwrap_or("");
                    rows.push((
                        json!([channel, seq]),
                        json!({ "rev": removed_rev, "removed": true }),
                    ));
                }
                _ => {}
            }
        }
        rows
    });
    design.add_view("channels", channels);

    design
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_kv::MemoryBucket;

    fn context() -> Arc<DatabaseContext> {
        DatabaseContext::new("db", Arc::new(MemoryBucket::new("db"))).unwrap()
    }

    #[test]
    fn views_skip_internal_and_foreign_records() {
        let ctx = context();
        let bucket = ctx.bucket();
        bucket.set("user:snej", 0, br#"{"name": "snej"}"#).unwrap();
        bucket.set("_sync:seq", 0, b"7").unwrap();
        bucket.set("plain", 0, b"not json at all").unwrap();
        bucket
            .set(
                "doc1",
                0,
                br#"{"rev": "1-a", "sequence": 1, "history": {"revs": ["1-a"], "parents": [-1]},
                     "channels": {"c": null}, "access": {"snej": ["c"]}, "body": {}}"#,
            )
            .unwrap();

        let access = bucket
            .view(DESIGN_DOC, "access", &ViewParams::default())
            .unwrap();
        assert_eq!(access.rows.len(), 1);
        assert_eq!(access.rows[0].key, json!("snej"));

        let channels = bucket
            .view(DESIGN_DOC, "channels", &ViewParams::default())
            .unwrap();
        assert_eq!(channels.rows.len(), 1);
        assert_eq!(channels.rows[0].key, json!(["c", 1]));
        assert_eq!(channels.rows[0].value["rev"], json!("1-a"));
    }

    #[test]
    fn channels_view_emits_removals() {
        let ctx = context();
        ctx.bucket()
            .set(
                "doc1",
                0,
                br#"{"rev": "2-b", "sequence": 4, "history": {"revs": ["2-b"], "parents": [-1]},
                     "channels": {"new": null, "old": {"seq": 4, "rev": "2-b"}},
                     "access": {}, "body": {}}"#,
            )
            .unwrap();

        let result = ctx
            .bucket()
            .view(DESIGN_DOC, "channels", &ViewParams::default())
            .unwrap();
        assert_eq!(result.rows.len(), 2);
        let removed: Vec<_> = result
            .rows
            .iter()
            .filter(|r| r.value.get("removed").is_some())
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, json!(["old", 4]));
    }

    #[test]
    fn compute_channels_unions_and_strips_star() {
        let ctx = context();
        ctx.bucket()
            .set(
                "d1",
                0,
                br#"{"rev": "1-a", "sequence": 1, "history": {"revs": ["1-a"], "parents": [-1]},
                     "channels": {}, "access": {"snej": ["a", "*"]}, "body": {}}"#,
            )
            .unwrap();
        ctx.bucket()
            .set(
                "d2",
                0,
                br#"{"rev": "1-b", "sequence": 2, "history": {"revs": ["1-b"], "parents": [-1]},
                     "channels": {}, "access": {"snej": ["b"], "role:hipster": ["r"]}, "body": {}}"#,
            )
            .unwrap();

        let computed = ctx.compute_channels("snej").unwrap();
        assert_eq!(computed, ["a".to_string(), "b".to_string()].into());

        let role_computed = ctx.compute_channels("role:hipster").unwrap();
        assert_eq!(role_computed, ["r".to_string()].into());

        assert!(ctx.compute_channels("nobody").unwrap().is_empty());
    }
}
