//! An instrumented [`RefBackend`] that records every call it forwards.
//!
//! [`TracedRefStore`] owns exactly one backend and reproduces each of its
//! operations unchanged: same arguments in, same result out. Around the
//! forwarded call it writes a line-oriented trace to a [`TraceSink`]:
//!
//! ```text
//! create_symref: HEAD -> refs/heads/main "init": 0
//! transaction {
//! 0: refs/heads/x null -> 5f0c... (F=0x4, T=0x0) "update"
//! }
//! finish: 0
//! ```
//!
//! Two rules keep the wrapper transparent:
//!
//! - Transaction lifecycle calls rebind the transaction to the wrapped
//!   backend before delegating, so the backend sees a transaction it owns
//!   and never routes work back through the wrapper.
//! - Reflog enumeration hands the backend an adapter callback that traces
//!   each entry but returns the caller's callback value untouched, so the
//!   caller still decides when enumeration stops.
//!
//! `init_db`, `pack_refs`, `delete_refs`, `iterator_begin`, `create_reflog`,
//! `delete_reflog`, `reflog_expire`, and the lifecycle calls other than
//! `transaction_finish` are forwarded without a trace.

use std::sync::Arc;

use refscope_types::ObjectId;

use crate::error::{result_code, Result};
use crate::trace::{hex_or_null, StdoutSink, TraceSink};
use crate::traits::{RefBackend, RefIter, ReflogExpiryPolicy, ReflogFn};
use crate::types::{
    BackendId, ExpireFlags, IterFlags, PackFlags, RawRef, RefUpdate, ReflogEntry, Transaction,
    UpdateFlags,
};

/// A [`RefBackend`] wrapper that traces the calls it forwards.
pub struct TracedRefStore {
    refs: Box<dyn RefBackend>,
    sink: Arc<dyn TraceSink>,
    id: BackendId,
}

impl TracedRefStore {
    /// Wrap `refs`, writing traces to `sink`.
    pub fn wrap(refs: Box<dyn RefBackend>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            refs,
            sink,
            id: BackendId::next(),
        }
    }

    /// Wrap `refs`, writing traces to standard output.
    pub fn wrap_stdout(refs: Box<dyn RefBackend>) -> Self {
        Self::wrap(refs, Arc::new(StdoutSink))
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &dyn RefBackend {
        self.refs.as_ref()
    }

    /// Unwrap, giving the backend back.
    pub fn into_inner(self) -> Box<dyn RefBackend> {
        self.refs
    }

    fn emit(&self, line: String) {
        self.sink.append_line(&line);
    }

    fn rebind(&self, transaction: &mut Transaction) {
        transaction.bind(self.refs.id());
    }

    fn trace_transaction(&self, transaction: &Transaction, res: i32) {
        let mut block = Vec::with_capacity(transaction.len() + 3);
        block.push("transaction {".to_string());
        block.extend(
            transaction
                .updates()
                .iter()
                .enumerate()
                .map(|(i, update)| format_update(i, update)),
        );
        block.push("}".to_string());
        block.push(format!("finish: {res}"));
        self.sink.append_block(&block);
    }
}

fn format_update(index: usize, update: &RefUpdate) -> String {
    format!(
        "{index}: {} {} -> {} (F=0x{:x}, T=0x{:x}) \"{}\"",
        update.name,
        hex_or_null(update.old.as_ref()),
        hex_or_null(update.new.as_ref()),
        update.flags.traced().bits(),
        update.kind.traced().bits(),
        update.message,
    )
}

/// Stands in for a caller's reflog callback during enumeration.
struct ReflogAdapter<'a, 'f> {
    refname: &'a str,
    f: &'a mut ReflogFn<'f>,
    sink: &'a dyn TraceSink,
}

impl ReflogAdapter<'_, '_> {
    fn on_entry(&mut self, entry: &ReflogEntry) -> i32 {
        let ret = (self.f)(entry);
        self.sink.append_line(&format!(
            "reflog_ent {} (ret {ret}): {} -> {}, {} {} \"{}\"",
            self.refname,
            hex_or_null(Some(&entry.old)),
            hex_or_null(Some(&entry.new)),
            entry.committer,
            entry.timestamp,
            entry.message,
        ));
        ret
    }
}

fn enumeration_code(res: &Result<i32>) -> i32 {
    match res {
        Ok(ret) => *ret,
        Err(e) => e.code(),
    }
}

impl RefBackend for TracedRefStore {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn id(&self) -> BackendId {
        self.id
    }

    fn init_db(&self) -> Result<()> {
        self.refs.init_db()
    }

    fn transaction_prepare(&self, transaction: &mut Transaction) -> Result<()> {
        self.rebind(transaction);
        self.refs.transaction_prepare(transaction)
    }

    fn transaction_finish(&self, transaction: &mut Transaction) -> Result<()> {
        self.rebind(transaction);
        let res = self.refs.transaction_finish(transaction);
        self.trace_transaction(transaction, result_code(&res));
        res
    }

    fn transaction_abort(&self, transaction: &mut Transaction) -> Result<()> {
        self.rebind(transaction);
        self.refs.transaction_abort(transaction)
    }

    fn initial_transaction_commit(&self, transaction: &mut Transaction) -> Result<()> {
        self.rebind(transaction);
        self.refs.initial_transaction_commit(transaction)
    }

    fn pack_refs(&self, flags: PackFlags) -> Result<()> {
        self.refs.pack_refs(flags)
    }

    fn create_symref(&self, name: &str, target: &str, logmsg: &str) -> Result<()> {
        let res = self.refs.create_symref(name, target, logmsg);
        self.emit(format!(
            "create_symref: {name} -> {target} \"{logmsg}\": {}",
            result_code(&res)
        ));
        res
    }

    fn delete_refs(&self, msg: &str, names: &[String], flags: UpdateFlags) -> Result<()> {
        self.refs.delete_refs(msg, names, flags)
    }

    fn rename_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()> {
        let res = self.refs.rename_ref(old, new, logmsg);
        self.emit(format!(
            "rename_ref: {old} -> {new} \"{logmsg}\": {}",
            result_code(&res)
        ));
        res
    }

    fn copy_ref(&self, old: &str, new: &str, logmsg: &str) -> Result<()> {
        let res = self.refs.copy_ref(old, new, logmsg);
        self.emit(format!(
            "copy_ref: {old} -> {new} \"{logmsg}\": {}",
            result_code(&res)
        ));
        res
    }

    fn write_pseudoref(&self, name: &str, oid: &ObjectId, old: Option<&ObjectId>) -> Result<()> {
        let res = self.refs.write_pseudoref(name, oid, old);
        let err = res.as_ref().err().map(ToString::to_string).unwrap_or_default();
        self.emit(format!(
            "write_pseudoref: {name}, {} => {}, err {err}: {}",
            hex_or_null(Some(oid)),
            hex_or_null(old),
            result_code(&res)
        ));
        res
    }

    fn delete_pseudoref(&self, name: &str, old: Option<&ObjectId>) -> Result<()> {
        let res = self.refs.delete_pseudoref(name, old);
        self.emit(format!(
            "delete_pseudoref: {name} ({}): {}",
            hex_or_null(old),
            result_code(&res)
        ));
        res
    }

    fn iterator_begin(&self, prefix: &str, flags: IterFlags) -> Result<RefIter> {
        self.refs.iterator_begin(prefix, flags)
    }

    fn read_raw_ref(&self, name: &str, out: &mut RawRef) -> Result<()> {
        out.oid = ObjectId::null();
        let res = self.refs.read_raw_ref(name, out);
        match &res {
            Ok(()) => self.emit(format!(
                "read_raw_ref: {name}: {} (=> {}) type {:x}: 0",
                out.oid.to_hex(),
                out.referent,
                out.kind.bits()
            )),
            Err(e) => self.emit(format!("read_raw_ref: {name} err {}", e.code())),
        }
        res
    }

    fn reflog_iterator_begin(&self) -> Result<RefIter> {
        let res = self.refs.reflog_iterator_begin();
        self.emit("for_each_reflog_iterator_begin".to_string());
        res
    }

    fn for_each_reflog_ent(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        let mut adapter = ReflogAdapter {
            refname: name,
            f,
            sink: self.sink.as_ref(),
        };
        let res = self
            .refs
            .for_each_reflog_ent(name, &mut |entry| adapter.on_entry(entry));
        self.emit(format!("for_each_reflog: {name}: {}", enumeration_code(&res)));
        res
    }

    fn for_each_reflog_ent_reverse(&self, name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        let mut adapter = ReflogAdapter {
            refname: name,
            f,
            sink: self.sink.as_ref(),
        };
        let res = self
            .refs
            .for_each_reflog_ent_reverse(name, &mut |entry| adapter.on_entry(entry));
        self.emit(format!(
            "for_each_reflog_reverse: {name}: {}",
            enumeration_code(&res)
        ));
        res
    }

    fn reflog_exists(&self, name: &str) -> bool {
        let res = self.refs.reflog_exists(name);
        self.emit(format!("reflog_exists: {name}: {}", i32::from(res)));
        res
    }

    fn create_reflog(&self, name: &str, force_create: bool) -> Result<()> {
        self.refs.create_reflog(name, force_create)
    }

    fn delete_reflog(&self, name: &str) -> Result<()> {
        self.refs.delete_reflog(name)
    }

    fn reflog_expire(
        &self,
        name: &str,
        oid: &ObjectId,
        flags: ExpireFlags,
        policy: &mut dyn ReflogExpiryPolicy,
    ) -> Result<()> {
        self.refs.reflog_expire(name, oid, flags, policy)
    }
}
