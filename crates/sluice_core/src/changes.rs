//! The change feed and the incremental changes query.
//!
//! Committed writes fan out in-process through [`ChangeFeed`] (one
//! notification per commit, after the CAS succeeds). Catch-up and
//! filtered replication go through [`DatabaseContext::changes_since`],
//! which reads the gateway's channels view: one row per (channel,
//! membership or removal), keyed `[channel, seq]`, so a replicator can
//! resume from any sequence.

use crate::channels::{ChannelSet, STAR_CHANNEL};
use crate::database::DatabaseContext;
use crate::error::CoreResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sluice_kv::ViewParams;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// One entry of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Sequence of the commit.
    pub seq: u64,
    /// Document ID.
    pub id: String,
    /// The document's winning revision at that sequence.
    pub rev: String,
    /// True if the winning revision is a tombstone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Channels in which this entry announces membership.
    #[serde(default, skip_serializing_if = "ChannelSet::is_empty")]
    pub channels: ChannelSet,
    /// Channels this entry announces the document was removed from.
    #[serde(default, skip_serializing_if = "ChannelSet::is_empty")]
    pub removed: ChannelSet,
}

/// Distributes committed changes to in-process subscribers.
///
/// Notifications are emitted exactly once per committed write, after
/// the CAS update succeeds. Subscribers needing strict sequence order
/// catch up through [`DatabaseContext::changes_since`]; the feed is
/// the wakeup signal. Disconnected subscribers are dropped on the next
/// emit.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEntry>>>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future change entries.
    pub fn subscribe(&self) -> Receiver<ChangeEntry> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an entry to all subscribers.
    pub fn emit(&self, entry: ChangeEntry) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// The number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Options for [`DatabaseContext::changes_since`].
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Return only entries with sequence strictly greater than this.
    pub since: u64,
    /// Maximum number of entries.
    pub limit: Option<usize>,
}

impl DatabaseContext {
    /// The incremental changes query: entries for every document that
    /// entered or left one of `channels` after `options.since`, in
    /// ascending sequence order, one entry per document (the latest
    /// wins when a document changed in several of the channels).
    ///
    /// A channel set containing `*` matches every channel.
    pub fn changes_since(
        &self,
        channels: &ChannelSet,
        options: &ChangesOptions,
    ) -> CoreResult<Vec<ChangeEntry>> {
        let star = channels.contains(STAR_CHANNEL);

        let mut rows: Vec<(String, u64, String, Value)> = Vec::new();
        if star {
            let result = self.bucket().view("sync_gateway", "channels", &ViewParams::default())?;
            rows.extend(result.rows.into_iter().filter_map(row_parts));
        } else {
            for channel in channels {
                let params = ViewParams::for_range(
                    json!([channel, options.since + 1]),
                    json!([channel, u64::MAX]),
                );
                let result = self.bucket().view("sync_gateway", "channels", &params)?;
                rows.extend(result.rows.into_iter().filter_map(row_parts));
            }
        }

        let mut merged: BTreeMap<String, ChangeEntry> = BTreeMap::new();
        for (channel, seq, doc_id, value) in rows {
            if seq <= options.since {
                continue;
            }
            let rev = value
                .get("rev")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let deleted = value
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let removal = value
                .get("removed")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let entry = merged.entry(doc_id.clone()).or_insert_with(|| ChangeEntry {
                id: doc_id.clone(),
                ..ChangeEntry::default()
            });
            if seq > entry.seq {
                entry.seq = seq;
                entry.rev = rev;
                entry.deleted = deleted;
            }
            if removal {
                entry.removed.insert(channel);
            } else {
                entry.channels.insert(channel);
            }
        }

        let mut entries: Vec<ChangeEntry> = merged.into_values().collect();
        entries.sort_by_key(|e| e.seq);
        if let Some(limit) = options.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

/// Splits a channels-view row into (channel, seq, doc id, value).
fn row_parts(row: sluice_kv::ViewRow) -> Option<(String, u64, String, Value)> {
    let parts = row.key.as_array()?;
    let channel = parts.first()?.as_str()?.to_string();
    let seq = parts.get(1)?.as_u64()?;
    Some((channel, seq, row.id, row.value))
}
