//! Special (gateway-metadata) documents.
//!
//! Special documents live at `_sync:<type>:<id>` keys, outside the
//! replicated document namespace. They carry no revision tree; their
//! `_rev` is a degenerate `0-<n>` counter used only for optimistic
//! concurrency on the admin interface.

use crate::body::Body;
use crate::error::{CoreError, CoreResult};
use sluice_kv::{Bucket, UpdateAction};

fn special_key(doctype: &str, docid: &str) -> CoreResult<String> {
    if doctype.is_empty() || docid.is_empty() {
        return Err(CoreError::bad_request("invalid doc ID"));
    }
    Ok(format!("_sync:{doctype}:{docid}"))
}

fn parse_special_rev(rev: &str) -> u64 {
    rev.strip_prefix("0-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Reads a special document.
pub fn get_special(bucket: &dyn Bucket, doctype: &str, docid: &str) -> CoreResult<Body> {
    let key = special_key(doctype, docid)?;
    let raw = bucket.get(&key).map_err(|err| {
        if err.is_not_found() {
            CoreError::not_found("missing")
        } else {
            err.into()
        }
    })?;
    Body::from_slice(&raw)
        .map_err(|e| CoreError::internal(format!("corrupt special document {key:?}: {e}")))
}

/// Creates or updates a special document. The body's `_rev` must
/// match the stored revision (and be absent on create); all
/// underscore-prefixed properties are stripped before storing.
/// Returns the new revision.
pub fn put_special(
    bucket: &dyn Bucket,
    doctype: &str,
    docid: &str,
    body: &Body,
) -> CoreResult<String> {
    let match_rev = body.rev().map(str::to_string);
    let stripped = body.strip_special();
    update_special(bucket, doctype, docid, match_rev.as_deref(), Some(stripped))
}

/// Deletes a special document; `rev` must match the stored revision.
pub fn delete_special(
    bucket: &dyn Bucket,
    doctype: &str,
    docid: &str,
    rev: &str,
) -> CoreResult<()> {
    update_special(bucket, doctype, docid, Some(rev), None).map(|_| ())
}

fn update_special(
    bucket: &dyn Bucket,
    doctype: &str,
    docid: &str,
    match_rev: Option<&str>,
    new_body: Option<Body>,
) -> CoreResult<String> {
    let key = special_key(doctype, docid)?;
    let mut new_rev = String::new();

    bucket
        .update(&key, 0, &mut |current| {
            let stored_rev: Option<String> = match &current {
                Some(bytes) if !bytes.is_empty() => {
                    let prev: Body = serde_json::from_slice(bytes).map_err(|e| {
                        Box::<dyn std::error::Error + Send + Sync>::from(CoreError::internal(
                            format!("corrupt special document {key:?}: {e}"),
                        ))
                    })?;
                    Some(prev.rev().unwrap_or("").to_string())
                }
                _ => None,
            };

            match (&stored_rev, match_rev) {
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(Box::from(CoreError::not_found(
                        "no previous revision to replace",
                    )));
                }
                (Some(stored), provided) => {
                    if provided != Some(stored.as_str()) {
                        return Err(Box::from(CoreError::conflict("document update conflict")));
                    }
                }
            }

            match &new_body {
                Some(body) => {
                    let generation = match_rev.map(parse_special_rev).unwrap_or(0);
                    new_rev = format!("0-{}", generation + 1);
                    let mut stored = body.clone();
                    stored.set_rev(new_rev.clone());
                    Ok(UpdateAction::Replace(stored.to_bytes()))
                }
                None if stored_rev.is_some() => Ok(UpdateAction::Delete),
                None => Err(Box::from(CoreError::not_found(
                    "no previous revision to replace",
                ))),
            }
        })
        .map_err(CoreError::from_kv)?;
    Ok(new_rev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_kv::MemoryBucket;

    fn body(value: serde_json::Value) -> Body {
        match value {
            serde_json::Value::Object(map) => Body(map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn create_read_update_delete() {
        let bucket = MemoryBucket::new("db");

        assert_eq!(
            get_special(&bucket, "design", "foo").unwrap_err().status(),
            404
        );

        let rev1 = put_special(&bucket, "design", "foo", &body(json!({"hi": "there"}))).unwrap();
        assert_eq!(rev1, "0-1");

        let fetched = get_special(&bucket, "design", "foo").unwrap();
        assert_eq!(fetched.get("hi"), Some(&json!("there")));
        assert_eq!(fetched.rev(), Some("0-1"));

        let rev2 = put_special(
            &bucket,
            "design",
            "foo",
            &body(json!({"_rev": "0-1", "hi": "again"})),
        )
        .unwrap();
        assert_eq!(rev2, "0-2");

        delete_special(&bucket, "design", "foo", "0-2").unwrap();
        assert_eq!(
            get_special(&bucket, "design", "foo").unwrap_err().status(),
            404
        );
    }

    #[test]
    fn rev_mismatch_is_conflict() {
        let bucket = MemoryBucket::new("db");
        put_special(&bucket, "local", "x", &body(json!({"a": 1}))).unwrap();

        let err = put_special(
            &bucket,
            "local",
            "x",
            &body(json!({"_rev": "0-9", "a": 2})),
        )
        .unwrap_err();
        assert_eq!(err.status(), 409);

        // Update with no _rev against an existing doc also conflicts.
        let err = put_special(&bucket, "local", "x", &body(json!({"a": 2}))).unwrap_err();
        assert_eq!(err.status(), 409);

        let err = delete_special(&bucket, "local", "x", "0-3").unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn update_of_missing_doc_is_404() {
        let bucket = MemoryBucket::new("db");
        let err = put_special(
            &bucket,
            "local",
            "ghost",
            &body(json!({"_rev": "0-1", "a": 1})),
        )
        .unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(
            delete_special(&bucket, "local", "ghost", "0-1")
                .unwrap_err()
                .status(),
            404
        );
    }

    #[test]
    fn underscore_properties_are_stripped() {
        let bucket = MemoryBucket::new("db");
        put_special(
            &bucket,
            "local",
            "y",
            &body(json!({"_id": "sneaky", "_extra": true, "keep": 1})),
        )
        .unwrap();
        let fetched = get_special(&bucket, "local", "y").unwrap();
        assert!(fetched.get("_id").is_none());
        assert!(fetched.get("_extra").is_none());
        assert_eq!(fetched.get("keep"), Some(&json!(1)));
        // The stored _rev is the only underscore property.
        assert_eq!(fetched.rev(), Some("0-1"));
    }

    #[test]
    fn empty_type_or_id_is_bad_request() {
        let bucket = MemoryBucket::new("db");
        assert_eq!(get_special(&bucket, "", "x").unwrap_err().status(), 400);
        assert_eq!(
            put_special(&bucket, "t", "", &Body::new()).unwrap_err().status(),
            400
        );
    }
}
