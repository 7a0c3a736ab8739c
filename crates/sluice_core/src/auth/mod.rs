//! Principal store and access resolver.
//!
//! Users and roles persist one per key (`user:<name>`, `role:<name>`)
//! in the same bucket as the documents. A principal's effective
//! channel set is derived: explicit admin channels, plus the channels
//! of every role it holds, plus whatever documents grant it through
//! their access maps. The document-granted part comes from a view
//! query, so the principal records only carry a cache of the result;
//! grant changes invalidate the cache by name and the next read
//! recomputes it.

pub mod password;
mod role;
mod user;

pub use role::{doc_key_for_role, Role};
pub use user::{doc_key_for_user, User};

use crate::channels::{ChannelSet, STAR_CHANNEL};
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use sluice_kv::{BoxError, Bucket, UpdateAction};
use std::sync::Arc;
use tracing::debug;

/// Computes the channels documents grant to a principal.
///
/// Implemented by the database context over the gateway's access
/// view; results never include `*` (it is stripped from computed
/// sets).
pub trait ChannelComputer: Send + Sync {
    /// The document-granted channels for the principal identified by
    /// `access_view_key` (the bare name for users, `role:<name>` for
    /// roles).
    fn compute_channels(&self, access_view_key: &str) -> CoreResult<ChannelSet>;
}

/// A user or role record.
#[derive(Debug, Clone)]
pub enum Principal {
    /// A user record.
    User(User),
    /// A role record.
    Role(Role),
}

impl Principal {
    /// The principal's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::User(u) => &u.name,
            Self::Role(r) => &r.name,
        }
    }

    /// The principal's effective channel set.
    #[must_use]
    pub fn effective_channels(&self) -> &ChannelSet {
        match self {
            Self::User(u) => u.effective_channels(),
            Self::Role(r) => r.effective_channels(),
        }
    }

    /// True if the principal may access `channel`.
    #[must_use]
    pub fn can_see_channel(&self, channel: &str) -> bool {
        match self {
            Self::User(u) => u.can_see_channel(channel),
            Self::Role(r) => r.can_see_channel(channel),
        }
    }

    /// Fails unless the principal can see every channel in `channels`.
    pub fn authorize_all_channels(&self, channels: &ChannelSet) -> CoreResult<()> {
        match self {
            Self::User(u) => u.authorize_all_channels(channels),
            Self::Role(r) => r.authorize_all_channels(channels),
        }
    }
}

/// The persistent store of users and roles.
pub struct Authenticator {
    bucket: Arc<dyn Bucket>,
    computer: Option<Arc<dyn ChannelComputer>>,
}

impl Authenticator {
    /// Creates an authenticator over `bucket`.
    ///
    /// Without a `computer`, document-granted channels are not folded
    /// into principals' channel sets (enough for invalidation-only
    /// call sites).
    #[must_use]
    pub fn new(bucket: Arc<dyn Bucket>, computer: Option<Arc<dyn ChannelComputer>>) -> Self {
        Self { bucket, computer }
    }

    /// Fetches a user, recomputing its channel cache if dirty.
    ///
    /// The empty name resolves to the anonymous user even when no
    /// record exists for it.
    pub fn get_user(&self, name: &str) -> CoreResult<Option<User>> {
        let raw = match self.bucket.get(&doc_key_for_user(name)) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                if name.is_empty() {
                    let mut anon = User::anonymous();
                    self.rebuild_user_channels(&mut anon)?;
                    return Ok(Some(anon));
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let mut user: User = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::internal(format!("corrupt user record {name:?}: {e}")))?;
        if user.name.is_empty() {
            user.name = name.to_string();
        }
        if user.channels.is_none() {
            self.rebuild_user_channels(&mut user)?;
            self.store_user(&user)?;
        }
        Ok(Some(user))
    }

    /// Fetches a role, recomputing its channel cache if dirty.
    pub fn get_role(&self, name: &str) -> CoreResult<Option<Role>> {
        let raw = match self.bucket.get(&doc_key_for_role(name)) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut role: Role = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::internal(format!("corrupt role record {name:?}: {e}")))?;
        if role.name.is_empty() {
            role.name = name.to_string();
        }
        if role.channels.is_none() {
            self.rebuild_role_channels(&mut role)?;
            self.store_role(&role)?;
        }
        Ok(Some(role))
    }

    /// Fetches a principal by access-map key: a bare name is a user,
    /// a `role:`-prefixed name a role.
    pub fn get_principal(&self, name: &str) -> CoreResult<Option<Principal>> {
        match name.strip_prefix("role:") {
            Some(role_name) => Ok(self.get_role(role_name)?.map(Principal::Role)),
            None => Ok(self.get_user(name)?.map(Principal::User)),
        }
    }

    /// Saves a user: validates the name, hashes any pending plaintext
    /// password, refreshes the channel cache and stores the record.
    pub fn save_user(&self, user: &mut User) -> CoreResult<()> {
        user.validate()?;
        user.absorb_password()?;
        self.rebuild_user_channels(user)?;
        self.store_user(user)
    }

    /// Saves a role.
    pub fn save_role(&self, role: &mut Role) -> CoreResult<()> {
        role.validate()?;
        self.rebuild_role_channels(role)?;
        self.store_role(role)
    }

    /// Deletes a user record.
    pub fn delete_user(&self, name: &str) -> CoreResult<()> {
        self.bucket
            .delete(&doc_key_for_user(name))
            .map_err(|err| match err {
                err if err.is_not_found() => CoreError::not_found(format!("no such user {name:?}")),
                err => err.into(),
            })
    }

    /// Deletes a role record.
    pub fn delete_role(&self, name: &str) -> CoreResult<()> {
        self.bucket
            .delete(&doc_key_for_role(name))
            .map_err(|err| match err {
                err if err.is_not_found() => CoreError::not_found(format!("no such role {name:?}")),
                err => err.into(),
            })
    }

    /// Looks up `name` and verifies `password`; `None` on unknown
    /// name or wrong credentials.
    pub fn authenticate(&self, name: &str, password: &str) -> CoreResult<Option<User>> {
        match self.get_user(name)? {
            Some(user) if user.authenticate(password) => Ok(Some(user)),
            _ => Ok(None),
        }
    }

    /// Marks the named principal's channel cache dirty in place.
    ///
    /// A missing record is not an error - the grant may name a
    /// principal that does not exist yet.
    pub fn invalidate_channels(&self, access_view_key: &str) -> CoreResult<()> {
        let key = match access_view_key.strip_prefix("role:") {
            Some(role_name) => doc_key_for_role(role_name),
            None => doc_key_for_user(access_view_key),
        };
        debug!(principal = access_view_key, "invalidating computed channels");
        self.bucket
            .update(&key, 0, &mut |current| {
                let Some(bytes) = current else {
                    return Ok(UpdateAction::Cancel);
                };
                let mut record: Value =
                    serde_json::from_slice(&bytes).map_err(BoxError::from)?;
                if let Some(obj) = record.as_object_mut() {
                    if obj.remove("all_channels").is_none() {
                        return Ok(UpdateAction::Cancel); // already dirty
                    }
                }
                let bytes = serde_json::to_vec(&record).map_err(BoxError::from)?;
                Ok(UpdateAction::Replace(bytes))
            })
            .map_err(CoreError::from_kv)
    }

    /// Recomputes a user's effective channel set: explicit channels,
    /// plus document-granted channels, plus the channels of every role
    /// held. `*` survives only from explicit grants.
    pub fn rebuild_user_channels(&self, user: &mut User) -> CoreResult<()> {
        let mut channels = user.explicit_channels.clone();
        if let Some(computer) = &self.computer {
            channels.extend(computer.compute_channels(&user.access_view_key())?);
        }
        for role_name in user.roles.clone() {
            if let Some(role) = self.get_role(&role_name)? {
                channels.extend(role.effective_channels().iter().cloned());
            }
        }
        debug!(user = %user.name, count = channels.len(), "rebuilt channel set");
        user.channels = Some(channels);
        Ok(())
    }

    /// Recomputes a role's effective channel set.
    pub fn rebuild_role_channels(&self, role: &mut Role) -> CoreResult<()> {
        let mut channels = role.explicit_channels.clone();
        if let Some(computer) = &self.computer {
            channels.extend(computer.compute_channels(&role.access_view_key())?);
        }
        role.channels = Some(channels);
        Ok(())
    }

    fn store_user(&self, user: &User) -> CoreResult<()> {
        let bytes = serde_json::to_vec(user)
            .map_err(|e| CoreError::internal(format!("cannot serialize user: {e}")))?;
        self.bucket.set(&user.doc_key(), 0, &bytes)?;
        Ok(())
    }

    fn store_role(&self, role: &Role) -> CoreResult<()> {
        let bytes = serde_json::to_vec(role)
            .map_err(|e| CoreError::internal(format!("cannot serialize role: {e}")))?;
        self.bucket.set(&role.doc_key(), 0, &bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("bucket", &self.bucket.name())
            .field("has_computer", &self.computer.is_some())
            .finish()
    }
}

/// Ensure `*` never leaks out of a computed channel set.
#[must_use]
pub(crate) fn strip_star(mut channels: ChannelSet) -> ChannelSet {
    channels.remove(STAR_CHANNEL);
    channels
}
