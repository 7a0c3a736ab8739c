//! Bucket trait definition.

use crate::error::{BoxError, KvResult};
use crate::view::{DesignDoc, ViewParams, ViewResult};

/// The action an [`UpdateFn`] callback tells the bucket to take.
#[derive(Debug)]
pub enum UpdateAction {
    /// Store the returned bytes as the key's new value.
    Replace(Vec<u8>),
    /// Remove the key.
    Delete,
    /// Leave the stored value untouched and report success.
    Cancel,
}

/// What an update callback returns: the action to take, or an opaque
/// error that aborts the update.
pub type UpdateResult = Result<UpdateAction, BoxError>;

/// Callback type for [`Bucket::update`].
///
/// The callback receives the current value (or `None` if the key does
/// not exist) and decides what to write. It may be invoked more than
/// once if another writer races the update, so it must be pure with
/// respect to caller-visible state until the update commits.
///
/// Callback errors abort the update and surface as
/// [`KvError::Callback`](crate::KvError::Callback) with the original
/// error boxed inside.
pub type UpdateFn<'a> = dyn FnMut(Option<Vec<u8>>) -> UpdateResult + 'a;

/// A key-value bucket with compare-and-swap updates and views.
///
/// # Invariants
///
/// - `get` returns exactly the bytes most recently committed for the key
/// - `update` applies its callback's result atomically with respect to
///   other `update` and `set` calls on the same key
/// - view results reflect every committed write (no staleness in the
///   in-memory implementation; a remote implementation may lag)
/// - Buckets must be `Send + Sync` for concurrent request handlers
pub trait Bucket: Send + Sync {
    /// Returns the bucket's name.
    fn name(&self) -> &str;

    /// Reads the value stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`](crate::KvError::NotFound) if the
    /// key does not exist.
    fn get(&self, key: &str) -> KvResult<Vec<u8>>;

    /// Stores `value` at `key`, unconditionally.
    ///
    /// `exp` is an expiry in seconds; 0 means no expiry. The in-memory
    /// bucket ignores expiry.
    fn set(&self, key: &str, exp: u32, value: &[u8]) -> KvResult<()>;

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`](crate::KvError::NotFound) if the
    /// key does not exist.
    fn delete(&self, key: &str) -> KvResult<()>;

    /// Atomically updates `key` through a compare-and-swap loop.
    ///
    /// The callback is invoked with the current value and its returned
    /// [`UpdateAction`] is applied only if the value is unchanged since
    /// the read; otherwise the callback runs again against the fresh
    /// value.
    fn update(&self, key: &str, exp: u32, callback: &mut UpdateFn<'_>) -> KvResult<()>;

    /// Queries a view previously installed with [`put_design_doc`].
    ///
    /// [`put_design_doc`]: Bucket::put_design_doc
    fn view(&self, ddoc: &str, view: &str, params: &ViewParams) -> KvResult<ViewResult>;

    /// Installs (or replaces) a design document of named views.
    fn put_design_doc(&self, ddoc: &str, design: DesignDoc) -> KvResult<()>;
}
