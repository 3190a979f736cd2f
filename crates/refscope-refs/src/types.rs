//! Core reference types: updates, transactions, reflog entries, and the
//! flag sets that travel with them.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use refscope_types::ObjectId;
use serde::{Deserialize, Serialize};

use crate::traits::RefBackend;

bitflags! {
    /// Per-update flags of a [`RefUpdate`].
    ///
    /// Only the bits in [`UpdateFlags::TRACED`] are meaningful to callers.
    /// The remaining named bits are set by backends while processing a
    /// transaction; unknown bits are retained as given.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateFlags: u32 {
        /// Update a symbolic ref itself instead of the ref it points at.
        const NO_DEREF = 1 << 0;
        /// Create the reflog for this ref even if it would not be auto-created.
        const FORCE_CREATE_REFLOG = 1 << 1;
        /// The update carries a new value.
        const HAVE_NEW = 1 << 2;
        /// The update carries an expected old value.
        const HAVE_OLD = 1 << 3;
        /// The ref is being pruned.
        const IS_PRUNING = 1 << 4;
        /// The ref is being deleted.
        const DELETING = 1 << 5;
        /// The new value differs from the current one and must be written.
        const NEEDS_COMMIT = 1 << 6;
        /// Only write a reflog entry, leave the ref alone.
        const LOG_ONLY = 1 << 7;
        /// The update reached its ref through a symbolic ref.
        const UPDATE_VIA_HEAD = 1 << 8;
        /// The loose copy of the ref has already been removed.
        const DELETED_LOOSE = 1 << 9;

        const _ = !0;
    }
}

impl UpdateFlags {
    /// The caller-visible bits that appear in traces.
    pub const TRACED: UpdateFlags = UpdateFlags::HAVE_NEW
        .union(UpdateFlags::HAVE_OLD)
        .union(UpdateFlags::NO_DEREF)
        .union(UpdateFlags::FORCE_CREATE_REFLOG)
        .union(UpdateFlags::LOG_ONLY);

    /// Only the caller-visible bits.
    pub fn traced(self) -> UpdateFlags {
        self & UpdateFlags::TRACED
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// What kind of ref a value was read from. Only the low four bits are
    /// defined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RefType: u32 {
        /// The ref is symbolic; its referent names another ref.
        const SYMREF = 0x01;
        /// The value came from the packed set.
        const PACKED = 0x02;
        /// The ref exists but does not resolve to an object.
        const BROKEN = 0x04;
        /// The ref name is malformed.
        const BAD_NAME = 0x08;

        const _ = !0;
    }
}

impl RefType {
    /// Bits of the type field that carry meaning.
    pub const MASK: u32 = 0xf;

    /// The type with every bit above [`RefType::MASK`] cleared.
    pub fn traced(self) -> RefType {
        RefType::from_bits_retain(self.bits() & Self::MASK)
    }
}

impl Default for RefType {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Flags for prefix iteration over refs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterFlags: u32 {
        /// Also yield refs that do not resolve to an object.
        const INCLUDE_BROKEN = 0x01;
    }
}

bitflags! {
    /// Flags for packing loose refs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PackFlags: u32 {
        /// Pack every direct ref, not only tags.
        const ALL = 0x01;
        /// Remove the loose copy of each packed ref.
        const PRUNE = 0x02;
    }
}

bitflags! {
    /// Flags for reflog expiry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExpireFlags: u32 {
        /// Evaluate the policy without changing anything.
        const DRY_RUN = 1 << 0;
        /// Point the ref at the newest surviving entry.
        const UPDATE_REF = 1 << 1;
        /// Relink each surviving entry's old value to its predecessor.
        const REWRITE = 1 << 2;
        /// Log each pruning decision.
        const VERBOSE = 1 << 3;
    }
}

/// Process-unique identity of one backend instance.
///
/// Transactions carry the id of the backend they are bound to; backends use
/// it to refuse transactions that were routed to them by mistake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendId(u64);

impl BackendId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One entry of a [`Transaction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefUpdate {
    /// Full ref name.
    pub name: String,
    /// Expected current value; `Some(null)` means "must not exist".
    pub old: Option<ObjectId>,
    /// Value to store; `Some(null)` deletes the ref.
    pub new: Option<ObjectId>,
    pub flags: UpdateFlags,
    /// Kind of ref found when the update was prepared.
    pub kind: RefType,
    /// Reflog message.
    pub message: String,
}

impl RefUpdate {
    /// Build an update, deriving `HAVE_NEW`/`HAVE_OLD` from the values given.
    pub fn new(
        name: impl Into<String>,
        new: Option<ObjectId>,
        old: Option<ObjectId>,
        flags: UpdateFlags,
        message: impl Into<String>,
    ) -> Self {
        let mut flags = flags - (UpdateFlags::HAVE_NEW | UpdateFlags::HAVE_OLD);
        flags.set(UpdateFlags::HAVE_NEW, new.is_some());
        flags.set(UpdateFlags::HAVE_OLD, old.is_some());
        Self {
            name: name.into(),
            old,
            new,
            flags,
            kind: RefType::empty(),
            message: message.into(),
        }
    }

    /// Returns `true` if applying this update removes the ref.
    pub fn is_deletion(&self) -> bool {
        matches!(self.new, Some(id) if id.is_null())
    }
}

/// Lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Open,
    Prepared,
    Finished,
    Aborted,
}

/// An atomic batch of ref updates.
#[derive(Debug)]
pub struct Transaction {
    updates: Vec<RefUpdate>,
    state: TransactionState,
    backend: Option<BackendId>,
}

impl Transaction {
    /// Start an unbound transaction.
    pub fn new() -> Self {
        Self {
            updates: Vec::new(),
            state: TransactionState::Open,
            backend: None,
        }
    }

    /// Start a transaction bound to `store`, the store the caller will hand
    /// it to.
    pub fn begin(store: &dyn RefBackend) -> Self {
        let mut tx = Self::new();
        tx.bind(store.id());
        tx
    }

    /// Queue an update.
    pub fn push(&mut self, update: RefUpdate) {
        self.updates.push(update);
    }

    /// Queue setting `name` to `new`, optionally checking `old` first.
    pub fn update(
        &mut self,
        name: impl Into<String>,
        new: ObjectId,
        old: Option<ObjectId>,
        flags: UpdateFlags,
        message: impl Into<String>,
    ) {
        self.push(RefUpdate::new(name, Some(new), old, flags, message));
    }

    /// Queue deleting `name`, optionally checking `old` first.
    pub fn delete(
        &mut self,
        name: impl Into<String>,
        old: Option<ObjectId>,
        flags: UpdateFlags,
        message: impl Into<String>,
    ) {
        self.push(RefUpdate::new(
            name,
            Some(ObjectId::null()),
            old,
            flags,
            message,
        ));
    }

    pub fn updates(&self) -> &[RefUpdate] {
        &self.updates
    }

    pub fn updates_mut(&mut self) -> &mut Vec<RefUpdate> {
        &mut self.updates
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// The backend this transaction is currently bound to.
    pub fn backend(&self) -> Option<BackendId> {
        self.backend
    }

    /// Bind the transaction to the backend with the given id.
    pub fn bind(&mut self, backend: BackendId) {
        self.backend = Some(backend);
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// One transition recorded in a ref's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflogEntry {
    pub old: ObjectId,
    pub new: ObjectId,
    /// Identity of whoever made the change, `Name <email>`.
    pub committer: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Offset from UTC in minutes.
    pub tz_offset: i32,
    pub message: String,
}

/// Output slots filled by `read_raw_ref`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRef {
    /// Resolved value of a direct ref.
    pub oid: ObjectId,
    /// Target name of a symbolic ref.
    pub referent: String,
    pub kind: RefType,
}

/// A ref yielded by iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub oid: ObjectId,
    pub kind: RefType,
}
