//! Channel names, channel sets, channel maps and access maps.

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// The wildcard channel granting access to every channel.
pub const STAR_CHANNEL: &str = "*";

/// A set of channel names.
pub type ChannelSet = BTreeSet<String>;

/// The channels a document grants to each principal. Role grants are
/// keyed with a `role:` prefix.
pub type AccessMap = BTreeMap<String, ChannelSet>;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-+.@\w]*$").expect("invalid principal name pattern"))
}

/// Is this a valid user/role name? Valid characters are alphanumerics
/// and any of `_-+.@`. The empty name is the anonymous user.
#[must_use]
pub fn is_valid_principal_name(name: &str) -> bool {
    name_regex().is_match(name)
}

/// Is this a valid channel name?
///
/// Channel names follow the principal-name character set, must be
/// nonempty, and additionally admit the `*` wildcard.
#[must_use]
pub fn is_valid_channel_name(name: &str) -> bool {
    name == STAR_CHANNEL || (!name.is_empty() && name_regex().is_match(name))
}

/// How [`channel_set_from_array`] treats the `*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarMode {
    /// Keep `*` in the resulting set (explicitly granted channels).
    Keep,
    /// Drop `*` from the resulting set (computed channels).
    Remove,
}

/// Builds a validated channel set from a list of names.
///
/// # Errors
///
/// Returns a 500 error on an invalid channel name, matching the
/// treatment of invalid evaluator output.
pub fn channel_set_from_array<I, S>(names: I, star_mode: StarMode) -> CoreResult<ChannelSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = ChannelSet::new();
    for name in names {
        let name = name.as_ref();
        if !is_valid_channel_name(name) {
            return Err(CoreError::internal(format!(
                "invalid channel name {name:?}"
            )));
        }
        if name == STAR_CHANNEL && star_mode == StarMode::Remove {
            continue;
        }
        set.insert(name.to_string());
    }
    Ok(set)
}

/// Checks that every principal and role name in an access map is valid.
#[must_use]
pub fn validate_access_map(access: &AccessMap) -> bool {
    access.keys().all(|name| {
        let name = name.strip_prefix("role:").unwrap_or(name);
        is_valid_principal_name(name)
    })
}

/// Record of a document leaving a channel.
///
/// Kept in the channel map so the change feed can tell replicators to
/// drop the document from clients filtering on that channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRemoval {
    /// The sequence at which the document left the channel.
    pub seq: u64,
    /// The winning revision at the time of removal.
    pub rev: String,
}

/// Per-document channel membership history.
///
/// One entry per channel the document has ever belonged to. `None` is
/// the membership sentinel (serialized as JSON `null`); a
/// [`ChannelRemoval`] records when the document left.
pub type ChannelMap = BTreeMap<String, Option<ChannelRemoval>>;

/// The channels a document currently belongs to.
#[must_use]
pub fn current_channels(map: &ChannelMap) -> ChannelSet {
    map.iter()
        .filter(|(_, state)| state.is_none())
        .map(|(name, _)| name.clone())
        .collect()
}
