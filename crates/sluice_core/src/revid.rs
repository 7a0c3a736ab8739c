//! Revision ID and UUID utilities.
//!
//! Revision IDs have the wire form `<generation>-<digest>` where the
//! generation is a positive decimal and the digest is 32 lowercase hex
//! characters: the first 16 bytes of SHA-256 over the generation, the
//! parent revision ID and the canonical body JSON. Identical inputs
//! produce identical IDs on every replica.

use crate::body::Body;
use crate::error::{CoreError, CoreResult};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mints the revision ID for a new revision.
///
/// `generation` must be the parent's generation + 1 (or 1 for a root
/// revision, with an empty `parent_rev`).
#[must_use]
pub fn create_rev_id(generation: u64, parent_rev: &str, body: &Body) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(parent_rev.as_bytes());
    hasher.update(b":");
    hasher.update(&body.canonical_bytes());
    let digest = hasher.finalize();
    format!("{generation}-{}", to_hex(&digest[..16]))
}

/// Parses a revision ID into (generation, digest).
///
/// # Errors
///
/// Returns a 400 error for malformed IDs or a generation < 1.
pub fn parse_rev_id(rev: &str) -> CoreResult<(u64, &str)> {
    let (gen_str, digest) = rev
        .split_once('-')
        .ok_or_else(|| CoreError::bad_request(format!("invalid revision ID {rev:?}")))?;
    let generation: u64 = gen_str
        .parse()
        .map_err(|_| CoreError::bad_request(format!("invalid revision ID {rev:?}")))?;
    if generation < 1 || digest.is_empty() {
        return Err(CoreError::bad_request(format!(
            "invalid revision ID {rev:?}"
        )));
    }
    Ok((generation, digest))
}

/// The generation of a revision ID, or 0 if the ID is empty or
/// malformed.
///
/// The write path uses this for "parent may be absent" handling where
/// a hard parse error is not wanted.
#[must_use]
pub fn generation_of(rev: &str) -> u64 {
    parse_rev_id(rev).map(|(generation, _)| generation).unwrap_or(0)
}

/// Returns a random 128-bit ID as 32 lowercase hex characters.
#[must_use]
pub fn create_uuid() -> String {
    to_hex(Uuid::new_v4().as_bytes())
}

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Decodes a lowercase hex string; `None` on malformed input.
#[must_use]
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
