//! The [`RefBackend`] trait defining the reference storage interface.
//!
//! Any backend (in-memory, filesystem, database) implements this trait to
//! provide named references, transactions, pseudorefs, and reflogs. The
//! instrumented [`TracedRefStore`](crate::traced::TracedRefStore) implements
//! it as well, by forwarding to the backend it wraps.

use refscope_types::ObjectId;

use crate::error::Result;
use crate::types::{
    BackendId, ExpireFlags, IterFlags, PackFlags, RawRef, RefEntry, ReflogEntry, Transaction,
    UpdateFlags,
};

/// Iterator over refs produced by [`RefBackend::iterator_begin`] and
/// [`RefBackend::reflog_iterator_begin`].
pub type RefIter = Box<dyn Iterator<Item = RefEntry> + Send>;

/// Callback invoked once per reflog entry.
///
/// Returning `0` continues the enumeration; any other value stops it and
/// becomes the result of the enumeration call.
pub type ReflogFn<'a> = dyn FnMut(&ReflogEntry) -> i32 + 'a;

/// Decides which reflog entries [`RefBackend::reflog_expire`] removes.
pub trait ReflogExpiryPolicy {
    /// Called once before any entry is examined.
    fn prepare(&mut self, _refname: &str, _oid: &ObjectId) {}

    /// Returns `true` if `entry` should be removed.
    fn should_prune(&mut self, entry: &ReflogEntry) -> bool;

    /// Called once after every entry has been examined.
    fn cleanup(&mut self) {}
}

/// Storage backend for named references.
///
/// Implementations must be thread-safe (`Send + Sync`). The namespace follows
/// a hierarchical layout:
///
/// - `HEAD` and other one-level root refs
/// - `refs/heads/*` for branches
/// - `refs/tags/*` for tags
/// - `refs/remotes/{remote}/*` for remote tracking refs
///
/// Pseudorefs (`FETCH_HEAD`, `ORIG_HEAD`, ...) live beside the ref namespace
/// and are written without transactions.
pub trait RefBackend: Send + Sync {
    /// Short name of the backend kind (e.g. "memory").
    fn name(&self) -> &'static str;

    /// Identity of this backend instance.
    fn id(&self) -> BackendId;

    /// Create whatever the backend needs before first use.
    fn init_db(&self) -> Result<()>;

    /// Check and lock every update of `transaction`.
    fn transaction_prepare(&self, transaction: &mut Transaction) -> Result<()>;

    /// Apply a prepared transaction.
    fn transaction_finish(&self, transaction: &mut Transaction) -> Result<()>;

    /// Release a transaction without applying it.
    fn transaction_abort(&self, transaction: &mut Transaction) -> Result<()>;

    /// Apply a transaction that only creates refs in an empty store.
    fn initial_transaction_commit(&self, transaction: &mut Transaction) -> Result<()>;

    /// Move loose refs into the packed set.
    fn pack_refs(&self, flags: PackFlags) -> Result<()>;

    /// Point `name` at the ref `target`.
    fn create_symref(&self, name: &str, target: &str, logmsg: &str) -> Result<()>;

    /// Delete every ref in `names`.
    fn delete_refs(&self, msg: &str, names: &[String], flags: UpdateFlags) -> Result<()>;

    /// Rename `old` to `new`, carrying its reflog along.
    fn rename_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()>;

    /// Copy `old` to `new`, copying its reflog.
    fn copy_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()>;

    /// Set a pseudoref, checking its current value against `old` if given.
    fn write_pseudoref(&self, name: &str, oid: &ObjectId, old: Option<&ObjectId>) -> Result<()>;

    /// Remove a pseudoref, checking its current value against `old` if given.
    fn delete_pseudoref(&self, name: &str, old: Option<&ObjectId>) -> Result<()>;

    /// Iterate refs whose names start with `prefix`.
    fn iterator_begin(&self, prefix: &str, flags: IterFlags) -> Result<RefIter>;

    /// Read the raw value of one ref into `out` without following symrefs.
    fn read_raw_ref(&self, name: &str, out: &mut RawRef) -> Result<()>;

    /// Iterate every ref that has a reflog.
    fn reflog_iterator_begin(&self) -> Result<RefIter>;

    /// Feed the reflog of `name` to `f`, oldest entry first.
    fn for_each_reflog_ent(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32>;

    /// Feed the reflog of `name` to `f`, newest entry first.
    fn for_each_reflog_ent_reverse(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32>;

    fn reflog_exists(&self, name: &str) -> bool;

    /// Create an empty reflog for `name`. Without `force_create` only names
    /// that are logged by default get one.
    fn create_reflog(&self, name: &str, force_create: bool) -> Result<()>;

    fn delete_reflog(&self, name: &str) -> Result<()>;

    /// Prune the reflog of `name` according to `policy`.
    fn reflog_expire(
        &self,
        name: &str,
        oid: &ObjectId,
        flags: ExpireFlags,
        policy: &mut dyn ReflogExpiryPolicy,
    ) -> Result<()>;
}
