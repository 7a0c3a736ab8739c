//! Users: the authenticatable principals.

use crate::auth::password::{hash_password, verify_password};
use crate::channels::{is_valid_principal_name, ChannelSet, STAR_CHANNEL};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// An authenticatable principal.
///
/// The empty name is the anonymous (guest) user: it cannot present
/// credentials, and restricted reads fail for it with 401 rather than
/// 403. The `password` property is write-only: accepted on input,
/// hashed on save, never serialized back out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    /// The user name; empty for the anonymous user.
    #[serde(default)]
    pub name: String,
    /// Write-only plaintext password, pending hashing on save.
    #[serde(default, skip_serializing, rename = "password")]
    pub plaintext_password: Option<String>,
    /// Stored Argon2id PHC hash.
    #[serde(default, rename = "password_hash", skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Channels granted explicitly by an administrator.
    #[serde(default, rename = "admin_channels")]
    pub explicit_channels: ChannelSet,
    /// Names of roles this user holds.
    #[serde(default, rename = "admin_roles")]
    pub roles: Vec<String>,
    /// Cached effective channel set; absent means dirty.
    #[serde(default, rename = "all_channels", skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelSet>,
    /// True if the account is disabled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl User {
    /// Creates a user with explicit channels and an optional plaintext
    /// password (hashed when the user is saved).
    pub fn new(
        name: impl Into<String>,
        password: Option<String>,
        explicit_channels: ChannelSet,
    ) -> CoreResult<Self> {
        let user = Self {
            name: name.into(),
            plaintext_password: password,
            explicit_channels,
            ..Self::default()
        };
        user.validate()?;
        Ok(user)
    }

    /// The anonymous user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// True if this is the anonymous user.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// The KV key this user persists under.
    #[must_use]
    pub fn doc_key(&self) -> String {
        doc_key_for_user(&self.name)
    }

    /// The key identifying this user in the access view.
    #[must_use]
    pub fn access_view_key(&self) -> String {
        self.name.clone()
    }

    /// Checks the user's data for validity.
    pub fn validate(&self) -> CoreResult<()> {
        if !is_valid_principal_name(&self.name) {
            return Err(CoreError::bad_request(format!(
                "invalid name {:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// Hashes a pending plaintext password into `password_hash`.
    pub fn absorb_password(&mut self) -> CoreResult<()> {
        if let Some(plaintext) = self.plaintext_password.take() {
            self.password_hash = Some(hash_password(&plaintext)?);
        }
        Ok(())
    }

    /// True if `password` matches this user's credentials.
    ///
    /// A user with no stored hash accepts only an empty password (the
    /// anonymous user and open-access accounts).
    #[must_use]
    pub fn authenticate(&self, password: &str) -> bool {
        if self.disabled {
            return false;
        }
        match &self.password_hash {
            Some(hash) => verify_password(password, hash),
            None => password.is_empty(),
        }
    }

    /// The effective channel set: the computed cache if fresh,
    /// otherwise the explicit channels.
    #[must_use]
    pub fn effective_channels(&self) -> &ChannelSet {
        self.channels.as_ref().unwrap_or(&self.explicit_channels)
    }

    /// True if the user may access `channel`.
    #[must_use]
    pub fn can_see_channel(&self, channel: &str) -> bool {
        let channels = self.effective_channels();
        channels.contains(channel) || channels.contains(STAR_CHANNEL)
    }

    /// Marks the computed channel cache dirty.
    pub fn invalidate_channels(&mut self) {
        self.channels = None;
    }

    /// The error for a denied read: 401 for the anonymous user, 403
    /// for a named one.
    #[must_use]
    pub fn unauth_error(&self, message: &str) -> CoreError {
        if self.is_anonymous() {
            CoreError::unauthorized("login required")
        } else {
            CoreError::forbidden(message)
        }
    }

    /// Fails with 403 (or 401) unless the user can see every channel
    /// in `channels`; the message names the denied channels.
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

/// The KV key for a user record.
#[must_use]
pub fn doc_key_for_user(name: &str) -> String {
    format!("user:{name}")
}
