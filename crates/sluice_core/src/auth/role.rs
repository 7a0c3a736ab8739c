//! Roles: groups of users with shared channel permissions.

use crate::channels::{is_valid_principal_name, ChannelSet, STAR_CHANNEL};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// A group that users can belong to, with associated channel
/// permissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// The role name.
    #[serde(default)]
    pub name: String,
    /// Channels granted explicitly by an administrator.
    #[serde(default, rename = "admin_channels")]
    pub explicit_channels: ChannelSet,
    /// Cached effective channel set; absent means the cache is dirty
    /// and must be recomputed before use.
    #[serde(default, rename = "all_channels", skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelSet>,
}

impl Role {
    /// Creates a role with explicit channels.
    pub fn new(name: impl Into<String>, explicit_channels: ChannelSet) -> CoreResult<Self> {
        let role = Self {
            name: name.into(),
            explicit_channels,
            channels: None,
        };
        role.validate()?;
        Ok(role)
    }

    /// The KV key this role persists under.
    #[must_use]
    pub fn doc_key(&self) -> String {
        doc_key_for_role(&self.name)
    }

    /// The key identifying this role in the access view.
    #[must_use]
    pub fn access_view_key(&self) -> String {
        format!("role:{}", self.name)
    }

    /// Checks the role's data for validity.
    pub fn validate(&self) -> CoreResult<()> {
        if !is_valid_principal_name(&self.name) {
            return Err(CoreError::bad_request(format!(
                "invalid name {:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// The effective channel set: the computed cache if fresh,
    /// otherwise the explicit channels.
    #[must_use]
    pub fn effective_channels(&self) -> &ChannelSet {
        self.channels.as_ref().unwrap_or(&self.explicit_channels)
    }

    /// True if the role may access `channel`.
    #[must_use]
    pub fn can_see_channel(&self, channel: &str) -> bool {
        let channels = self.effective_channels();
        channels.contains(channel) || channels.contains(STAR_CHANNEL)
    }

    /// Marks the computed channel cache dirty.
    pub fn invalidate_channels(&mut self) {
        self.channels = None;
    }

    /// The error for a denied read: 401 for the nameless role, 403
    /// otherwise.
    #[must_use]
    pub fn unauth_error(&self, message: &str) -> CoreError {
        if self.name.is_empty() {
            CoreError::unauthorized("login required")
        } else {
            CoreError::forbidden(message)
        }
    }

    /// Fails unless the role can see every channel in `channels`; the
    /// message names the denied channels.
    pub fn authorize_all_channels(&self, channels: &ChannelSet) -> CoreResult<()> {
        let denied: Vec<&str> = channels
            .iter()
            .filter(|ch| !self.can_see_channel(ch))
            .map(String::as_str)
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(self.unauth_error(&format!(
                "you are not allowed to see channels {denied:?}"
            )))
        }
    }
}

/// The KV key for a role record.
#[must_use]
pub fn doc_key_for_role(name: &str) -> String {
    format!("role:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_and_invalid_names() {
        assert!(Role::new("hipster", ChannelSet::new()).is_ok());
        assert!(Role::new("bad name", ChannelSet::new()).is_err());
    }

    #[test]
    fn keys() {
        let role = Role::new("hipster", ChannelSet::new()).unwrap();
        assert_eq!(role.doc_key(), "role:hipster");
        assert_eq!(role.access_view_key(), "role:hipster");
    }

    #[test]
    fn can_see_channel_uses_cache_then_explicit() {
        let mut role = Role::new("r", ["a".to_string()].into()).unwrap();
        assert!(role.can_see_channel("a"));
        assert!(!role.can_see_channel("b"));

        role.channels = Some(["b".to_string()].into());
        assert!(role.can_see_channel("b"));
        assert!(!role.can_see_channel("a"));
    }

    #[test]
    fn star_grants_everything() {
        let role = Role::new("r", [STAR_CHANNEL.to_string()].into()).unwrap();
        assert!(role.can_see_channel("anything"));
    }

    #[test]
    fn authorize_all_channels_names_denied() {
        let role = Role::new("r", ["a".to_string()].into()).unwrap();
        let wanted: ChannelSet = ["a".to_string(), "b".to_string()].into();
        let err = role.authorize_all_channels(&wanted).unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(err.to_string().contains('b'));
    }

    #[test]
    fn serialization_hides_dirty_cache() {
        let role = Role::new("r", ["a".to_string()].into()).unwrap();
        let json = serde_json::to_string(&role).unwrap();
        assert!(!json.contains("all_channels"));
        assert!(json.contains("admin_channels"));
    }
}
