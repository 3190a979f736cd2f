//! In-memory reference store for testing and ephemeral use.
//!
//! [`MemoryRefStore`] keeps loose refs, packed refs, pseudorefs, and reflogs
//! in ordered maps behind a single `RwLock`. It implements the full
//! [`RefBackend`] trait and is suitable for unit tests, scripted sessions, and
//! short-lived processes. Data is lost when the store is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use refscope_types::ObjectId;
use tracing::{debug, warn};

use crate::error::{RefError, Result};
use crate::names::{
    check_pseudoref_name, check_ref_update_name, check_refname_format, should_autocreate_reflog,
};
use crate::traits::{RefBackend, RefIter, ReflogExpiryPolicy, ReflogFn};
use crate::types::{
    BackendId, ExpireFlags, IterFlags, PackFlags, RawRef, RefEntry, RefType, RefUpdate,
    ReflogEntry, Transaction, TransactionState, UpdateFlags,
};

/// Committer recorded in reflog entries unless configured otherwise.
pub const DEFAULT_COMMITTER: &str = "refscope <refscope@localhost>";

/// Maximum number of symbolic refs followed while resolving a name.
const SYMREF_MAX_DEPTH: usize = 5;

/// Ref that `init_db` points `HEAD` at.
const DEFAULT_BRANCH: &str = "refs/heads/main";

/// The stored value of a loose ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// Points directly at an object.
    Direct(ObjectId),
    /// Points at another ref by name.
    Symbolic(String),
}

#[derive(Clone, Copy, Debug)]
enum Clock {
    System,
    Fixed(i64),
}

#[derive(Debug, Default)]
struct RefsState {
    loose: BTreeMap<String, RefValue>,
    packed: BTreeMap<String, ObjectId>,
    pseudorefs: BTreeMap<String, ObjectId>,
    reflogs: BTreeMap<String, Vec<ReflogEntry>>,
}

impl RefsState {
    /// The raw value of `name` and where it was found.
    fn lookup(&self, name: &str) -> Option<(RefValue, RefType)> {
        if let Some(value) = self.loose.get(name) {
            let kind = match value {
                RefValue::Direct(_) => RefType::empty(),
                RefValue::Symbolic(_) => RefType::SYMREF,
            };
            return Some((value.clone(), kind));
        }
        if let Some(oid) = self.packed.get(name) {
            return Some((RefValue::Direct(*oid), RefType::PACKED));
        }
        self.pseudorefs
            .get(name)
            .map(|oid| (RefValue::Direct(*oid), RefType::empty()))
    }

    /// Follow symbolic refs from `name` to the object it names, if any.
    fn resolve(&self, name: &str) -> Option<ObjectId> {
        let mut current = name.to_string();
        for _ in 0..=SYMREF_MAX_DEPTH {
            match self.lookup(&current)? {
                (RefValue::Direct(oid), _) => return Some(oid),
                (RefValue::Symbolic(target), _) => current = target,
            }
        }
        None
    }

    /// Follow symbolic refs from `name` to the last name in the chain,
    /// whether or not that ref exists.
    fn final_referent(&self, name: &str) -> String {
        let mut current = name.to_string();
        for _ in 0..=SYMREF_MAX_DEPTH {
            match self.loose.get(&current) {
                Some(RefValue::Symbolic(target)) => current = target.clone(),
                _ => break,
            }
        }
        current
    }

    fn exists(&self, name: &str) -> bool {
        self.loose.contains_key(name) || self.packed.contains_key(name)
    }

    fn remove_ref(&mut self, name: &str) -> bool {
        let loose = self.loose.remove(name).is_some();
        let packed = self.packed.remove(name).is_some();
        loose || packed
    }

    fn is_logged(&self, name: &str, force: bool) -> bool {
        force || self.reflogs.contains_key(name) || should_autocreate_reflog(name)
    }

    fn append_reflog(&mut self, name: &str, entry: ReflogEntry, force: bool) {
        if self.is_logged(name, force) {
            self.reflogs.entry(name.to_string()).or_default().push(entry);
        }
    }

    /// Check an update's expected old value against the current state.
    fn check_old(&self, update: &RefUpdate) -> Result<()> {
        let Some(expected) = update.old else {
            return Ok(());
        };
        let current = self.resolve(&update.name);
        let matches = if expected.is_null() {
            current.is_none()
        } else {
            current == Some(expected)
        };
        if matches {
            Ok(())
        } else {
            Err(RefError::mismatch(
                &update.name,
                Some(&expected),
                current.as_ref(),
            ))
        }
    }

    /// Check a pseudoref's current value against `expected`; a null
    /// expectation requires the pseudoref to be absent.
    fn check_pseudoref_old(&self, name: &str, expected: Option<&ObjectId>) -> Result<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let current = self.pseudorefs.get(name);
        let matches = match current {
            Some(current) => current == expected,
            None => expected.is_null(),
        };
        if matches {
            Ok(())
        } else {
            Err(RefError::mismatch(name, Some(expected), current))
        }
    }

    /// Validate one update and record what applying it will do.
    fn prepare_update(&self, update: &mut RefUpdate) -> Result<()> {
        self.check_old(update)?;
        if let Some(new) = update.new {
            let current = self.resolve(&update.name);
            if new.is_null() {
                update.flags |= UpdateFlags::DELETING;
                if current.is_some() {
                    update.flags |= UpdateFlags::NEEDS_COMMIT;
                }
            } else if current != Some(new) {
                update.flags |= UpdateFlags::NEEDS_COMMIT;
            }
        }
        Ok(())
    }

    fn ref_entry(&self, name: &str, include_broken: bool) -> Option<RefEntry> {
        let (value, kind) = self.lookup(name)?;
        match value {
            RefValue::Direct(oid) => Some(RefEntry {
                name: name.to_string(),
                oid,
                kind,
            }),
            RefValue::Symbolic(_) => match self.resolve(name) {
                Some(oid) => Some(RefEntry {
                    name: name.to_string(),
                    oid,
                    kind,
                }),
                None if include_broken => Some(RefEntry {
                    name: name.to_string(),
                    oid: ObjectId::null(),
                    kind: kind | RefType::BROKEN,
                }),
                None => None,
            },
        }
    }
}

/// An in-memory implementation of [`RefBackend`].
#[derive(Debug)]
pub struct MemoryRefStore {
    state: RwLock<RefsState>,
    id: BackendId,
    committer: String,
    clock: Clock,
}

impl MemoryRefStore {
    /// Create a new empty ref store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RefsState::default()),
            id: BackendId::next(),
            committer: DEFAULT_COMMITTER.to_string(),
            clock: Clock::System,
        }
    }

    /// Record `committer` (`Name <email>`) in new reflog entries.
    pub fn with_committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = committer.into();
        self
    }

    /// Stamp every new reflog entry with `timestamp` instead of the current
    /// time.
    pub fn with_fixed_time(mut self, timestamp: i64) -> Self {
        self.clock = Clock::Fixed(timestamp);
        self
    }

    /// The value `name` resolves to after following symbolic refs.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.read()?.resolve(name))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RefsState>> {
        self.state
            .read()
            .map_err(|e| RefError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RefsState>> {
        self.state
            .write()
            .map_err(|e| RefError::Poisoned(e.to_string()))
    }

    fn now(&self) -> i64 {
        match self.clock {
            Clock::System => chrono::Utc::now().timestamp(),
            Clock::Fixed(ts) => ts,
        }
    }

    fn log_entry(&self, old: Option<ObjectId>, new: Option<ObjectId>, msg: &str) -> ReflogEntry {
        ReflogEntry {
            old: old.unwrap_or_default(),
            new: new.unwrap_or_default(),
            committer: self.committer.clone(),
            timestamp: self.now(),
            tz_offset: 0,
            message: msg.to_string(),
        }
    }

    /// Bind an unbound transaction to this store; refuse one bound elsewhere.
    fn claim(&self, transaction: &mut Transaction) -> Result<()> {
        match transaction.backend() {
            None => {
                transaction.bind(self.id);
                Ok(())
            }
            Some(id) if id == self.id => Ok(()),
            Some(_) => {
                warn!(store = self.name(), "refusing transaction bound to another store");
                Err(RefError::ForeignTransaction)
            }
        }
    }

    fn prepare_updates(&self, transaction: &mut Transaction) -> Result<()> {
        let state = self.read()?;
        let mut seen = BTreeSet::new();
        let mut via_symref = Vec::new();

        for update in transaction.updates_mut().iter_mut() {
            check_ref_update_name(&update.name)?;
            if !seen.insert(update.name.clone()) {
                return Err(RefError::DuplicateUpdate {
                    name: update.name.clone(),
                });
            }

            let current = state.lookup(&update.name);
            update.kind = current.as_ref().map(|(_, kind)| *kind).unwrap_or_default();

            let is_symref = matches!(current, Some((RefValue::Symbolic(_), _)));
            if is_symref && !update.flags.contains(UpdateFlags::NO_DEREF) {
                let referent = state.final_referent(&update.name);
                let mut split = update.clone();
                split.name = referent;
                split.flags = (split.flags - UpdateFlags::LOG_ONLY) | UpdateFlags::UPDATE_VIA_HEAD;
                split.kind = state
                    .lookup(&split.name)
                    .map(|(_, kind)| kind)
                    .unwrap_or_default();
                via_symref.push(split);

                update.flags |= UpdateFlags::LOG_ONLY | UpdateFlags::NO_DEREF;
                state.check_old(update)?;
                continue;
            }

            if !update.flags.contains(UpdateFlags::LOG_ONLY) {
                state.prepare_update(update)?;
            }
        }

        for mut split in via_symref {
            if !seen.insert(split.name.clone()) {
                return Err(RefError::DuplicateUpdate { name: split.name });
            }
            state.prepare_update(&mut split)?;
            transaction.push(split);
        }
        Ok(())
    }

    fn apply_updates(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.write()?;
        for update in transaction.updates() {
            if !update.flags.contains(UpdateFlags::LOG_ONLY) {
                state.check_old(update)?;
            }
        }

        let before: Vec<Option<ObjectId>> = transaction
            .updates()
            .iter()
            .map(|u| state.resolve(&u.name))
            .collect();

        for (update, old) in transaction.updates().iter().zip(before) {
            let Some(new) = update.new else {
                continue;
            };
            let force = update.flags.contains(UpdateFlags::FORCE_CREATE_REFLOG);

            if update.flags.contains(UpdateFlags::LOG_ONLY) {
                if !new.is_null() {
                    let entry = self.log_entry(old, Some(new), &update.message);
                    state.append_reflog(&update.name, entry, force);
                }
                continue;
            }

            if new.is_null() {
                state.remove_ref(&update.name);
                state.reflogs.remove(&update.name);
                debug!(refname = %update.name, "deleted ref");
            } else {
                state
                    .loose
                    .insert(update.name.clone(), RefValue::Direct(new));
                let entry = self.log_entry(old, Some(new), &update.message);
                state.append_reflog(&update.name, entry, force);
                debug!(refname = %update.name, new = %new.short_hex(), "updated ref");
            }
        }
        Ok(())
    }

    fn commit_initial(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.write()?;
        let mut seen = BTreeSet::new();
        for update in transaction.updates() {
            check_ref_update_name(&update.name)?;
            if !seen.insert(update.name.as_str()) {
                return Err(RefError::DuplicateUpdate {
                    name: update.name.clone(),
                });
            }
            match update.new {
                Some(new) if !new.is_null() => {}
                _ => {
                    return Err(RefError::InvalidUpdate {
                        name: update.name.clone(),
                        reason: "initial commit may only create refs".into(),
                    })
                }
            }
            if matches!(update.old, Some(old) if !old.is_null()) {
                return Err(RefError::InvalidUpdate {
                    name: update.name.clone(),
                    reason: "initial commit cannot expect an existing value".into(),
                });
            }
            if state.exists(&update.name) {
                return Err(RefError::AlreadyExists {
                    name: update.name.clone(),
                });
            }
        }

        for update in transaction.updates() {
            if let Some(new) = update.new {
                state.packed.insert(update.name.clone(), new);
            }
        }
        debug!(count = transaction.len(), "initial commit written to packed refs");
        Ok(())
    }

    /// Shared body of `rename_ref` and `copy_ref`.
    fn duplicate_ref(&self, old: &str, new: &str, logmsg: &str, keep_source: bool) -> Result<()> {
        check_refname_format(old)?;
        check_ref_update_name(new)?;

        let mut state = self.write()?;
        let oid = match state.lookup(old) {
            Some((RefValue::Direct(oid), _)) => oid,
            Some((RefValue::Symbolic(_), _)) => {
                return Err(RefError::Symbolic {
                    name: old.to_string(),
                })
            }
            None => {
                return Err(RefError::NotFound {
                    name: old.to_string(),
                })
            }
        };
        if state.exists(new) {
            return Err(RefError::AlreadyExists {
                name: new.to_string(),
            });
        }

        let history = if keep_source {
            state.reflogs.get(old).cloned()
        } else {
            state.remove_ref(old);
            state.reflogs.remove(old)
        };
        if let Some(history) = history {
            state.reflogs.insert(new.to_string(), history);
        }

        state.loose.insert(new.to_string(), RefValue::Direct(oid));
        let entry = self.log_entry(Some(oid), Some(oid), logmsg);
        state.append_reflog(new, entry, false);

        if !keep_source {
            for value in state.loose.values_mut() {
                if matches!(value, RefValue::Symbolic(target) if target == old) {
                    *value = RefValue::Symbolic(new.to_string());
                }
            }
        }
        debug!(old, new, keep_source, "duplicated ref");
        Ok(())
    }

    fn reflog_snapshot(&self, name: &str) -> Result<Vec<ReflogEntry>> {
        self.read()?
            .reflogs
            .get(name)
            .cloned()
            .ok_or_else(|| RefError::NotFound {
                name: name.to_string(),
            })
    }
}

impl Default for MemoryRefStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_state(transaction: &Transaction, expected: TransactionState) -> Result<()> {
    if transaction.state() == expected {
        Ok(())
    } else {
        Err(RefError::TransactionState {
            expected,
            actual: transaction.state(),
        })
    }
}

fn feed_entries<'e>(
    entries: impl Iterator<Item = &'e ReflogEntry>,
    f: &mut ReflogFn<'_>,
) -> i32 {
    for entry in entries {
        let ret = f(entry);
        if ret != 0 {
            return ret;
        }
    }
    0
}

impl RefBackend for MemoryRefStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn id(&self) -> BackendId {
        self.id
    }

    fn init_db(&self) -> Result<()> {
        let mut state = self.write()?;
        if !state.loose.contains_key("HEAD") {
            state.loose.insert(
                "HEAD".to_string(),
                RefValue::Symbolic(DEFAULT_BRANCH.to_string()),
            );
            debug!(head = DEFAULT_BRANCH, "initialized ref store");
        }
        Ok(())
    }

    fn transaction_prepare(&self, transaction: &mut Transaction) -> Result<()> {
        self.claim(transaction)?;
        expect_state(transaction, TransactionState::Open)?;
        match self.prepare_updates(transaction) {
            Ok(()) => {
                transaction.set_state(TransactionState::Prepared);
                Ok(())
            }
            Err(e) => {
                transaction.set_state(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    fn transaction_finish(&self, transaction: &mut Transaction) -> Result<()> {
        self.claim(transaction)?;
        expect_state(transaction, TransactionState::Prepared)?;
        match self.apply_updates(transaction) {
            Ok(()) => {
                transaction.set_state(TransactionState::Finished);
                Ok(())
            }
            Err(e) => {
                transaction.set_state(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    fn transaction_abort(&self, transaction: &mut Transaction) -> Result<()> {
        self.claim(transaction)?;
        match transaction.state() {
            TransactionState::Open | TransactionState::Prepared => {
                transaction.set_state(TransactionState::Aborted);
                Ok(())
            }
            actual => Err(RefError::TransactionState {
                expected: TransactionState::Prepared,
                actual,
            }),
        }
    }

    fn initial_transaction_commit(&self, transaction: &mut Transaction) -> Result<()> {
        self.claim(transaction)?;
        expect_state(transaction, TransactionState::Open)?;
        match self.commit_initial(transaction) {
            Ok(()) => {
                transaction.set_state(TransactionState::Finished);
                Ok(())
            }
            Err(e) => {
                transaction.set_state(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    fn pack_refs(&self, flags: PackFlags) -> Result<()> {
        let mut state = self.write()?;
        let candidates: Vec<(String, ObjectId)> = state
            .loose
            .iter()
            .filter(|(name, _)| {
                name.starts_with("refs/")
                    && (flags.contains(PackFlags::ALL) || name.starts_with("refs/tags/"))
            })
            .filter_map(|(name, value)| match value {
                RefValue::Direct(oid) => Some((name.clone(), *oid)),
                RefValue::Symbolic(_) => None,
            })
            .collect();

        for (name, oid) in &candidates {
            state.packed.insert(name.clone(), *oid);
            if flags.contains(PackFlags::PRUNE) {
                state.loose.remove(name);
            }
        }
        debug!(count = candidates.len(), "packed refs");
        Ok(())
    }

    fn create_symref(&self, name: &str, target: &str, logmsg: &str) -> Result<()> {
        check_ref_update_name(name)?;
        check_refname_format(target)?;

        let mut state = self.write()?;
        let before = state.resolve(name);
        state
            .loose
            .insert(name.to_string(), RefValue::Symbolic(target.to_string()));
        let after = state.resolve(name);
        let entry = self.log_entry(before, after, logmsg);
        state.append_reflog(name, entry, false);
        debug!(refname = name, referent = target, "created symref");
        Ok(())
    }

    fn delete_refs(&self, msg: &str, names: &[String], _flags: UpdateFlags) -> Result<()> {
        let mut state = self.write()?;
        let mut first_err = None;
        for name in names {
            if state.remove_ref(name) {
                state.reflogs.remove(name);
                debug!(refname = %name, msg, "deleted ref");
            } else {
                warn!(refname = %name, "could not delete missing ref");
                if first_err.is_none() {
                    first_err = Some(RefError::NotFound { name: name.clone() });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn rename_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()> {
        self.duplicate_ref(old, new, logmsg, false)
    }

    fn copy_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()> {
        self.duplicate_ref(old, new, logmsg, true)
    }

    fn write_pseudoref(&self, name: &str, oid: &ObjectId, old: Option<&ObjectId>) -> Result<()> {
        check_pseudoref_name(name)?;
        let mut state = self.write()?;
        state.check_pseudoref_old(name, old)?;
        state.pseudorefs.insert(name.to_string(), *oid);
        debug!(refname = name, oid = %oid.short_hex(), "wrote pseudoref");
        Ok(())
    }

    fn delete_pseudoref(&self, name: &str, old: Option<&ObjectId>) -> Result<()> {
        check_pseudoref_name(name)?;
        let mut state = self.write()?;
        state.check_pseudoref_old(name, old)?;
        state.pseudorefs.remove(name);
        debug!(refname = name, "deleted pseudoref");
        Ok(())
    }

    fn iterator_begin(&self, prefix: &str, flags: IterFlags) -> Result<RefIter> {
        let state = self.read()?;
        let include_broken = flags.contains(IterFlags::INCLUDE_BROKEN);
        let names: BTreeSet<&String> = state
            .loose
            .keys()
            .chain(state.packed.keys())
            .filter(|name| name.starts_with(prefix))
            .collect();
        let entries: Vec<RefEntry> = names
            .into_iter()
            .filter_map(|name| state.ref_entry(name, include_broken))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn read_raw_ref(&self, name: &str, out: &mut RawRef) -> Result<()> {
        let state = self.read()?;
        let (value, kind) = state.lookup(name).ok_or_else(|| RefError::NotFound {
            name: name.to_string(),
        })?;
        out.referent.clear();
        match value {
            RefValue::Direct(oid) => out.oid = oid,
            RefValue::Symbolic(target) => out.referent = target,
        }
        out.kind = kind;
        Ok(())
    }

    fn reflog_iterator_begin(&self) -> Result<RefIter> {
        let state = self.read()?;
        let entries: Vec<RefEntry> = state
            .reflogs
            .keys()
            .map(|name| RefEntry {
                name: name.clone(),
                oid: state.resolve(name).unwrap_or_default(),
                kind: state.lookup(name).map(|(_, kind)| kind).unwrap_or_default(),
            })
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn for_each_reflog_ent(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        let entries = self.reflog_snapshot(name)?;
        Ok(feed_entries(entries.iter(), f))
    }

    fn for_each_reflog_ent_reverse(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        let entries = self.reflog_snapshot(name)?;
        Ok(feed_entries(entries.iter().rev(), f))
    }

    fn reflog_exists(&self, name: &str) -> bool {
        self.read()
            .map(|state| state.reflogs.contains_key(name))
            .unwrap_or(false)
    }

    fn create_reflog(&self, name: &str, force_create: bool) -> Result<()> {
        check_refname_format(name)?;
        if !force_create && !should_autocreate_reflog(name) {
            return Ok(());
        }
        self.write()?.reflogs.entry(name.to_string()).or_default();
        Ok(())
    }

    fn delete_reflog(&self, name: &str) -> Result<()> {
        self.write()?.reflogs.remove(name);
        Ok(())
    }

    fn reflog_expire(
        &self,
        name: &str,
        oid: &ObjectId,
        flags: ExpireFlags,
        policy: &mut dyn ReflogExpiryPolicy,
    ) -> Result<()> {
        // The policy runs without the lock held so it may call back into the
        // store. Entries appended meanwhile are kept unexamined.
        let snapshot = self.reflog_snapshot(name)?;

        policy.prepare(name, oid);
        let mut kept: Vec<ReflogEntry> = Vec::with_capacity(snapshot.len());
        for entry in &snapshot {
            if policy.should_prune(entry) {
                if flags.contains(ExpireFlags::VERBOSE) {
                    debug!(refname = name, old = %entry.old.short_hex(), new = %entry.new.short_hex(), "prune");
                }
                continue;
            }
            kept.push(entry.clone());
        }
        policy.cleanup();

        if flags.contains(ExpireFlags::DRY_RUN) {
            return Ok(());
        }

        let mut state = self.write()?;
        let current = state.reflogs.get(name).ok_or_else(|| RefError::NotFound {
            name: name.to_string(),
        })?;
        if !current.starts_with(&snapshot) {
            warn!(refname = name, "reflog rewritten during expiry");
            return Err(RefError::InvalidUpdate {
                name: name.to_string(),
                reason: "reflog changed while it was being expired".into(),
            });
        }
        kept.extend_from_slice(&current[snapshot.len()..]);

        if flags.contains(ExpireFlags::REWRITE) {
            let mut prev = ObjectId::null();
            for entry in &mut kept {
                entry.old = prev;
                prev = entry.new;
            }
        }
        if flags.contains(ExpireFlags::UPDATE_REF) {
            let last = kept.last().and_then(|e| e.new.non_null());
            let symbolic = matches!(state.loose.get(name), Some(RefValue::Symbolic(_)));
            if let (Some(last), false) = (last, symbolic) {
                state.loose.insert(name.to_string(), RefValue::Direct(last));
            }
        }
        debug!(refname = name, kept = kept.len(), "expired reflog");
        state.reflogs.insert(name.to_string(), kept);
        Ok(())
    }
}
