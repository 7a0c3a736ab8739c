//! Document reading, writing, and replication queries.

use crate::attachments::{load_body_attachments, store_attachments};
use crate::auth::{Authenticator, User};
use crate::body::Body;
use crate::changes::ChangeEntry;
use crate::channels::{
    current_channels, is_valid_channel_name, validate_access_map, AccessMap, ChannelMap,
    ChannelRemoval, ChannelSet, STAR_CHANNEL,
};
use crate::database::DatabaseContext;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::mapper::make_user_ctx;
use crate::revid::{create_rev_id, create_uuid, generation_of, parse_rev_id};
use crate::revtree::{encode_revisions, RevInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_kv::UpdateAction;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A per-request handle: the shared database context plus the
/// requesting user. `None` means access control is disabled (the admin
/// interface).
pub struct Database {
    ctx: Arc<DatabaseContext>,
    user: Option<User>,
}

/// What one committed write changed; drives post-commit effects.
struct CommitInfo {
    sequence: u64,
    winning_rev: String,
    deleted: bool,
    channels: ChannelSet,
    invalidate: Vec<String>,
}

/// The input of a revs-diff query: doc ID to the revisions the client
/// holds or wants.
pub type RevsDiffInput = BTreeMap<String, Vec<String>>;

/// One document's entry in a revs-diff response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Requested revisions this database does not have.
    pub missing: Vec<String>,
    /// Revisions this database has that could be ancestors of the
    /// missing ones; omitted when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possible_ancestors: Option<Vec<String>>,
}

/// Validates a client-facing document ID.
fn real_doc_id(docid: &str) -> CoreResult<&str> {
    if docid.is_empty() || docid.len() > 250 || docid.starts_with('_') {
        return Err(CoreError::bad_request("invalid doc ID"));
    }
    Ok(docid)
}

/// Fails with 403 (or 401 for the anonymous user) unless the user may
/// see at least one of the document's current channels. A `None` user
/// means access control is disabled.
pub fn authorize_any_doc_channels(
    user: Option<&User>,
    channels: &ChannelMap,
) -> CoreResult<()> {
    let Some(user) = user else {
        return Ok(());
    };
    for channel in user.effective_channels() {
        if channel == STAR_CHANNEL {
            return Ok(());
        }
        if matches!(channels.get(channel), Some(None)) {
            return Ok(()); // currently a member of this channel
        }
    }
    Err(user.unauth_error("you are not allowed to see this"))
}

impl Database {
    /// Creates a request handle over `ctx` for `user`.
    #[must_use]
    pub fn new(ctx: Arc<DatabaseContext>, user: Option<User>) -> Self {
        Self { ctx, user }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<DatabaseContext> {
        &self.ctx
    }

    /// The requesting user, if access control is enabled.
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    fn get_doc(&self, docid: &str) -> CoreResult<Document> {
        let key = real_doc_id(docid)?;
        let raw = self.ctx.bucket().get(key).map_err(|err| {
            if err.is_not_found() {
                CoreError::not_found("missing")
            } else {
                err.into()
            }
        })?;
        Document::unmarshal(docid, Some(&raw))
    }

    //////// READING:

    /// Returns the body of the current winning revision.
    pub fn get(&self, docid: &str) -> CoreResult<Body> {
        self.get_rev(docid, "", false, None)
    }

    /// Returns the body of a revision of a document.
    ///
    /// With an empty `revid` the winning revision is used, and a
    /// tombstone winner fails with 404 "deleted". With
    /// `list_revisions` the result carries a `_revisions` history.
    /// With `attachments_since`, attachments introduced after the
    /// nearest common ancestor with that list are inlined; the rest
    /// stay stubs.
    pub fn get_rev(
        &self,
        docid: &str,
        revid: &str,
        list_revisions: bool,
        attachments_since: Option<&[String]>,
    ) -> CoreResult<Body> {
        let doc = self.get_doc(docid)?;
        // This authorizes against the current revision's channels even
        // when an older revision is requested; see the access view
        // design for why per-revision channel snapshots do not exist.
        authorize_any_doc_channels(self.user.as_ref(), &doc.channels)?;

        let revid = if revid.is_empty() {
            if doc.deleted {
                return Err(CoreError::not_found("deleted"));
            }
            doc.rev.as_str()
        } else {
            revid
        };

        let mut body = doc
            .get_revision(revid)
            .ok_or_else(|| CoreError::not_found("missing"))?;
        if doc.history.get(revid).is_some_and(|info| info.deleted) {
            body.insert("_deleted".to_string(), Value::Bool(true));
        }
        if list_revisions {
            let history = doc.history.ancestry(revid);
            body.insert("_revisions".to_string(), encode_revisions(&history));
        }

        if let Some(since) = attachments_since {
            let mut min_revpos = 1;
            if !since.is_empty() {
                if let Some(ancestor) = doc.history.find_ancestor_in(revid, since) {
                    min_revpos = generation_of(&ancestor) + 1;
                }
            }
            load_body_attachments(self.ctx.bucket().as_ref(), &mut body, min_revpos)?;
        }
        Ok(body)
    }

    //////// WRITING:

    /// Updates or creates a document. The body's `_rev` must match the
    /// current winning leaf (or be absent iff no live leaf exists).
    /// Returns the new revision ID.
    pub fn put(&self, docid: &str, body: Body) -> CoreResult<String> {
        let match_rev = body.rev().unwrap_or("").to_string();
        if !match_rev.is_empty() {
            parse_rev_id(&match_rev)?;
        }
        let deleted = body.is_deleted();
        let bucket = Arc::clone(self.ctx.bucket());
        let mut body = body;

        let committed = self.update_doc(docid, &mut |doc| {
            // This block can run more than once if writers race.
            let mut match_rev = match_rev.clone();
            let mut generation = generation_of(&match_rev) + 1;
            if match_rev.is_empty() {
                match_rev = doc.rev.clone();
                if !match_rev.is_empty() {
                    // No parent given, but the document exists. Allowed
                    // only when the current revision is a tombstone.
                    if !doc.history.get(&match_rev).is_some_and(|i| i.deleted) {
                        return Err(CoreError::conflict("document exists"));
                    }
                    generation = generation_of(&match_rev) + 1;
                }
            } else if !doc.history.is_leaf(&match_rev) {
                return Err(CoreError::conflict("document revision conflict"));
            }

            // Attachments alter the body, so they are resolved before
            // the revision ID is digested from it.
            store_attachments(bucket.as_ref(), &mut body, generation)?;
            let new_rev = create_rev_id(generation, &match_rev, &body);
            body.set_rev(new_rev.clone());
            doc.history
                .add(RevInfo::new(new_rev, match_rev, deleted))?;
            Ok(Some(body.clone()))
        })?;

        committed.ok_or_else(|| CoreError::internal("write cancelled unexpectedly"))
    }

    /// Adds an existing revision and its ancestry, as produced by
    /// another replica. `history[0]` is the new revision, followed by
    /// its ancestors newest-first. Only the prefix not already present
    /// is grafted; if everything is known the write is a no-op.
    pub fn put_existing_rev(
        &self,
        docid: &str,
        body: Body,
        history: &[String],
    ) -> CoreResult<()> {
        let new_rev = history
            .first()
            .ok_or_else(|| CoreError::bad_request("empty revision history"))?
            .clone();
        let (generation, _) = parse_rev_id(&new_rev)?;
        let deleted = body.is_deleted();
        let bucket = Arc::clone(self.ctx.bucket());
        let mut body = body;

        self.update_doc(docid, &mut |doc| {
            // Find where this history branches from what we know.
            let mut graft_end = history.len();
            let mut parent = String::new();
            for (i, rev) in history.iter().enumerate() {
                if doc.history.contains(rev) {
                    graft_end = i;
                    parent = rev.clone();
                    break;
                }
            }
            if graft_end == 0 {
                return Ok(None); // nothing new to add
            }

            for i in (0..graft_end).rev() {
                doc.history.add(RevInfo::new(
                    history[i].clone(),
                    parent.clone(),
                    i == 0 && deleted,
                ))?;
                parent = history[i].clone();
            }

            store_attachments(bucket.as_ref(), &mut body, generation)?;
            body.set_rev(new_rev.clone());
            Ok(Some(body.clone()))
        })?;
        Ok(())
    }

    /// Creates a new document under a freshly minted random ID.
    /// Returns `(doc_id, rev_id)`.
    pub fn post(&self, body: Body) -> CoreResult<(String, String)> {
        if body.rev().is_some() {
            return Err(CoreError::not_found("no previous revision to replace"));
        }
        let docid = create_uuid();
        let rev = self.put(&docid, body)?;
        Ok((docid, rev))
    }

    /// Deletes a document by writing a tombstone revision on top of
    /// `revid`. Returns the tombstone's revision ID.
    pub fn delete_doc(&self, docid: &str, revid: &str) -> CoreResult<String> {
        let mut body = Body::new();
        body.insert("_deleted".to_string(), Value::Bool(true));
        if !revid.is_empty() {
            body.set_rev(revid);
        }
        self.put(docid, body)
    }

    /// The shared write path: loads the document inside the bucket's
    /// CAS loop, lets `callback` graft revisions and produce the new
    /// revision body, recomputes the winner, assigns a sequence, runs
    /// the validator and channel mapper, and stores the result. The
    /// callback returns `Ok(None)` to cancel cleanly.
    ///
    /// Returns the new revision ID, or `None` if the write was
    /// cancelled.
    fn update_doc(
        &self,
        docid: &str,
        callback: &mut dyn FnMut(&mut Document) -> CoreResult<Option<Body>>,
    ) -> CoreResult<Option<String>> {
        let key = real_doc_id(docid)?.to_string();
        let mut new_rev = String::new();
        let mut committed: Option<CommitInfo> = None;

        self.ctx
            .bucket()
            .update(&key, 0, &mut |current| {
                // This block can run more than once if writers race; it
                // must stay pure with respect to caller-visible state.
                committed = None;
                let mut doc = Document::unmarshal(docid, current.as_deref())
                    .map_err(boxed)?;

                let body = match callback(&mut doc).map_err(boxed)? {
                    Some(body) => body,
                    None => return Ok(UpdateAction::Cancel),
                };
                new_rev = body.rev().unwrap_or("").to_string();

                // The winner is not necessarily the new revision.
                doc.promote_winner(&new_rev, body.clone());

                // Each retry burns a sequence; sequences are only
                // approximately dense.
                doc.sequence = self.ctx.sequences().next_sequence().map_err(boxed)?;

                let parent = doc
                    .history
                    .get(&new_rev)
                    .map(|info| info.parent.clone())
                    .unwrap_or_default();
                let (channels, access) = self
                    .get_channels_and_access(&doc, &body, &parent)
                    .map_err(boxed)?;
                update_doc_channels(&mut doc, &channels);
                let invalidate = update_doc_access(&mut doc, access);

                committed = Some(CommitInfo {
                    sequence: doc.sequence,
                    winning_rev: doc.rev.clone(),
                    deleted: doc.deleted,
                    channels: current_channels(&doc.channels),
                    invalidate,
                });
                Ok(UpdateAction::Replace(doc.marshal().map_err(boxed)?))
            })
            .map_err(CoreError::from_kv)?;

        let Some(info) = committed else {
            return Ok(None); // cancelled
        };

        // Post-commit effects, exactly once per committed write.
        if !info.invalidate.is_empty() {
            let auth = Authenticator::new(Arc::clone(self.ctx.bucket()), None);
            for principal in &info.invalidate {
                auth.invalidate_channels(principal)?;
            }
        }
        debug!(doc = docid, rev = %new_rev, seq = info.sequence, "added revision");
        self.ctx.feed().emit(ChangeEntry {
            seq: info.sequence,
            id: docid.to_string(),
            rev: info.winning_rev,
            deleted: info.deleted,
            channels: info.channels,
            removed: ChannelSet::new(),
        });
        Ok(Some(new_rev))
    }

    /// Runs the validator and channel mapper over a new revision.
    fn get_channels_and_access(
        &self,
        doc: &Document,
        body: &Body,
        parent_rev: &str,
    ) -> CoreResult<(ChannelSet, AccessMap)> {
        let mut mapped = body.clone();
        mapped.set_id(doc.id.clone());
        let new_json = String::from_utf8(mapped.to_bytes())
            .map_err(|_| CoreError::internal("non-UTF-8 document body"))?;
        let old_json = if parent_rev.is_empty() {
            String::new()
        } else {
            doc.get_revision_json(parent_rev)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default()
        };
        let user_ctx = make_user_ctx(
            self.user.as_ref().map(|u| u.name.as_str()),
            self.user
                .as_ref()
                .map(User::effective_channels)
                .unwrap_or(&ChannelSet::new()),
        );

        if let Some(validator) = self.ctx.validator() {
            let (status, message) = validator
                .validate(&new_json, &old_json, &user_ctx)
                .map_err(|err| {
                    warn!(doc = %doc.id, error = %err, "validator exception");
                    CoreError::internal("exception in validation function")
                })?;
            if status >= 300 {
                debug!(doc = %doc.id, status, "validator rejected revision");
                return Err(CoreError::rejected(
                    status,
                    message.unwrap_or_else(|| "invalid document".to_string()),
                ));
            }
        }

        let output = self
            .ctx
            .channel_mapper()
            .map_to_channels_and_access(&new_json, &old_json, &user_ctx)
            .map_err(|err| {
                warn!(doc = %doc.id, error = %err, "channel mapper exception");
                CoreError::internal("exception in channel mapper function")
            })?;
        if let Some((status, message)) = output.rejection {
            debug!(doc = %doc.id, status, "channel mapper rejected revision");
            return Err(CoreError::rejected(status, message));
        }
        if !output.channels.iter().all(|ch| is_valid_channel_name(ch))
            || !validate_access_map(&output.access)
        {
            warn!(doc = %doc.id, "invalid names in channel mapper output");
            return Err(CoreError::internal("error in channel mapper function"));
        }
        Ok((output.channels, output.access))
    }

    //////// REVS_DIFF:

    /// For each input document, reports which of the given revisions
    /// this database does not have, plus plausible ancestors the
    /// client could send deltas against. Documents whose revisions are
    /// all known produce no entry.
    pub fn revs_diff(
        &self,
        input: &RevsDiffInput,
    ) -> CoreResult<BTreeMap<String, RevsDiffEntry>> {
        let mut output = BTreeMap::new();
        for (docid, revs) in input {
            if let Some((missing, possible_ancestors)) = self.rev_diff(docid, revs) {
                output.insert(
                    docid.clone(),
                    RevsDiffEntry {
                        missing,
                        possible_ancestors,
                    },
                );
            }
        }
        Ok(output)
    }

    /// One document's diff; `None` when every requested revision is
    /// known.
    fn rev_diff(&self, docid: &str, revids: &[String]) -> Option<(Vec<String>, Option<Vec<String>>)> {
        let doc = match self.get_doc(docid) {
            Ok(doc) => doc,
            Err(err) => {
                if !err.is_not_found() {
                    // Treat an unreadable document as nonexistent.
                    warn!(doc = docid, error = %err, "revs_diff document load failed");
                }
                return Some((revids.to_vec(), None));
            }
        };

        let mut missing = Vec::new();
        let mut max_missing_generation = 0;
        for revid in revids {
            if !doc.history.contains(revid) {
                // Unparseable revision IDs are silently dropped.
                let generation = generation_of(revid);
                if generation > 0 {
                    missing.push(revid.clone());
                    max_missing_generation = max_missing_generation.max(generation);
                }
            }
        }
        if missing.is_empty() {
            return None;
        }

        let possible: Vec<String> = doc
            .history
            .rev_ids()
            .filter(|rev| generation_of(rev) < max_missing_generation)
            .map(str::to_string)
            .collect();
        Some((missing, (!possible.is_empty()).then_some(possible)))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.ctx.name())
            .field("user", &self.user.as_ref().map(|u| u.name.as_str()))
            .finish()
    }
}

/// Merges a revision's computed channels into the document's channel
/// map: members no longer in the set become removal records at the
/// current sequence, new members become the membership sentinel.
fn update_doc_channels(doc: &mut Document, new_channels: &ChannelSet) -> bool {
    let mut changed = false;
    let sequence = doc.sequence;
    let rev = doc.rev.clone();

    for (channel, state) in doc.channels.iter_mut() {
        if state.is_none() && !new_channels.contains(channel) {
            *state = Some(ChannelRemoval {
                seq: sequence,
                rev: rev.clone(),
            });
            changed = true;
        }
    }
    for channel in new_channels {
        let state = doc.channels.entry(channel.clone()).or_insert_with(|| {
            changed = true;
            None
        });
        if state.is_some() {
            *state = None;
            changed = true;
        }
    }
    if changed {
        debug!(doc = %doc.id, channels = ?new_channels, "assigned channels");
    }
    changed
}

/// Replaces the document's access map wholesale; returns the
/// principals whose grant entry changed and whose computed channels
/// must be invalidated.
fn update_doc_access(doc: &mut Document, new_access: AccessMap) -> Vec<String> {
    if doc.access == new_access {
        return Vec::new();
    }
    let mut affected: Vec<String> = doc
        .access
        .keys()
        .chain(new_access.keys())
        .filter(|name| doc.access.get(*name) != new_access.get(*name))
        .cloned()
        .collect();
    affected.sort_unstable();
    affected.dedup();
    debug!(doc = %doc.id, access = ?new_access, "document access grants changed");
    doc.access = new_access;
    affected
}

fn boxed(err: CoreError) -> sluice_kv::BoxError {
    Box::new(err)
}
