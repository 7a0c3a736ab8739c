//! Attachment metadata handling.
//!
//! Revision bodies may carry an `_attachments` object. On write, each
//! entry with inline `data` (lowercase hex) is persisted to the KV
//! store under `_sync:att:<digest>` and the entry becomes a stub
//! recording the digest, length and the generation (`revpos`) that
//! introduced it. On read, entries newer than the client's known
//! ancestry are re-inlined; older ones stay stubs the client already
//! holds.

use crate::body::Body;
use crate::error::{CoreError, CoreResult};
use crate::revid::{from_hex, to_hex};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sluice_kv::Bucket;

/// Key prefix for attachment blobs.
const ATTACHMENT_KEY_PREFIX: &str = "_sync:att:";

fn attachment_key(digest: &str) -> String {
    format!("{ATTACHMENT_KEY_PREFIX}{digest}")
}

fn digest_of(data: &[u8]) -> String {
    format!("sha256-{}", to_hex(&Sha256::digest(data)))
}

/// Persists inline attachment data out of `body`, replacing each
/// data-bearing entry with a stub whose `revpos` is `generation`.
/// Entries already in stub form must carry a `revpos`; stubs without
/// one are invalid.
pub fn store_attachments(
    bucket: &dyn Bucket,
    body: &mut Body,
    generation: u64,
) -> CoreResult<()> {
    let Some(Value::Object(atts)) = body.get_mut("_attachments") else {
        return Ok(());
    };

    for (name, meta) in atts.iter_mut() {
        let Value::Object(meta) = meta else {
            return Err(CoreError::bad_request(format!(
                "invalid attachment {name:?}"
            )));
        };
        match meta.remove("data") {
            Some(Value::String(hex)) => {
                let data = from_hex(&hex).ok_or_else(|| {
                    CoreError::bad_request(format!("invalid data for attachment {name:?}"))
                })?;
                let digest = digest_of(&data);
                bucket.set(&attachment_key(&digest), 0, &data)?;
                meta.insert("stub".to_string(), Value::Bool(true));
                meta.insert("digest".to_string(), Value::String(digest));
                meta.insert("length".to_string(), Value::from(data.len()));
                meta.insert("revpos".to_string(), Value::from(generation));
            }
            Some(_) => {
                return Err(CoreError::bad_request(format!(
                    "invalid data for attachment {name:?}"
                )));
            }
            None => {
                // A stub referencing an earlier revision; it must say which.
                if !meta.get("revpos").is_some_and(Value::is_u64) {
                    return Err(CoreError::bad_request(format!(
                        "attachment {name:?} has no data and no revpos"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Re-inlines attachment data for entries with `revpos >=
/// min_revpos`; older entries stay stubs.
pub fn load_body_attachments(
    bucket: &dyn Bucket,
    body: &mut Body,
    min_revpos: u64,
) -> CoreResult<()> {
    let Some(Value::Object(atts)) = body.get_mut("_attachments") else {
        return Ok(());
    };

    for (name, meta) in atts.iter_mut() {
        let Value::Object(meta) = meta else { continue };
        let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(0);
        if revpos < min_revpos {
            continue;
        }
        let digest = meta
            .get("digest")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::internal(format!("attachment {name:?} stub has no digest"))
            })?
            .to_string();
        let data = bucket.get(&attachment_key(&digest)).map_err(|err| {
            if err.is_not_found() {
                CoreError::not_found(format!("attachment {name:?} missing"))
            } else {
                err.into()
            }
        })?;
        meta.remove("stub");
        meta.insert("data".to_string(), Value::String(to_hex(&data)));
    }
    Ok(())
}

/// A convenience for tests and callers building attachment entries.
#[must_use]
pub fn inline_attachment(data: &[u8], content_type: &str) -> Value {
    let mut meta = Map::new();
    meta.insert("content_type".to_string(), Value::String(content_type.to_string()));
    meta.insert("data".to_string(), Value::String(to_hex(data)));
    Value::Object(meta)
}
