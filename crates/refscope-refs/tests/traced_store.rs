//! Behaviour of `TracedRefStore` against a scripted backend and against the
//! in-memory backend.

use std::sync::{Arc, Mutex};

use refscope_refs::{
    BackendId, ExpireFlags, IterFlags, MemoryRefStore, MemorySink, PackFlags, RawRef, RefBackend,
    RefEntry, RefError, RefIter, RefType, RefUpdate, ReflogEntry, ReflogExpiryPolicy, ReflogFn,
    Result, TracedRefStore, Transaction, TransactionState, UpdateFlags,
};
use refscope_types::ObjectId;

fn oid(seed: &str) -> ObjectId {
    ObjectId::from_bytes(seed.as_bytes())
}

/// State shared between a [`Scripted`] backend and the test driving it.
#[derive(Default)]
struct Shared {
    fail: bool,
    calls: Mutex<Vec<&'static str>>,
    bindings: Mutex<Vec<Option<BackendId>>>,
    reflog: Vec<ReflogEntry>,
    callback_returns: Mutex<Vec<i32>>,
}

impl Shared {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

/// A backend that records what it was asked and answers from a script.
struct Scripted {
    id: BackendId,
    shared: Arc<Shared>,
}

impl Scripted {
    fn new(shared: Shared) -> (Self, Arc<Shared>) {
        let shared = Arc::new(shared);
        let backend = Self {
            id: BackendId::next(),
            shared: Arc::clone(&shared),
        };
        (backend, shared)
    }

    fn record(&self, call: &'static str) -> Result<()> {
        self.shared.calls.lock().unwrap().push(call);
        if self.shared.fail {
            Err(RefError::NotFound {
                name: call.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn record_tx(&self, call: &'static str, tx: &Transaction) -> Result<()> {
        self.shared.bindings.lock().unwrap().push(tx.backend());
        self.record(call)
    }

    fn walk<'e>(
        &self,
        entries: impl Iterator<Item = &'e ReflogEntry>,
        f: &mut ReflogFn<'_>,
    ) -> i32 {
        for entry in entries {
            let ret = f(entry);
            self.shared.callback_returns.lock().unwrap().push(ret);
            if ret != 0 {
                return ret;
            }
        }
        0
    }
}

impl RefBackend for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn id(&self) -> BackendId {
        self.id
    }

    fn init_db(&self) -> Result<()> {
        self.record("init_db")
    }

    fn transaction_prepare(&self, tx: &mut Transaction) -> Result<()> {
        self.record_tx("prepare", tx)
    }

    fn transaction_finish(&self, tx: &mut Transaction) -> Result<()> {
        self.record_tx("finish", tx)
    }

    fn transaction_abort(&self, tx: &mut Transaction) -> Result<()> {
        self.record_tx("abort", tx)
    }

    fn initial_transaction_commit(&self, tx: &mut Transaction) -> Result<()> {
        self.record_tx("initial_commit", tx)
    }

    fn pack_refs(&self, _flags: PackFlags) -> Result<()> {
        self.record("pack_refs")
    }

    fn create_symref(&self, _name: &str, _target: &str, _logmsg: &str) -> Result<()> {
        self.record("create_symref")
    }

    fn delete_refs(&self, _msg: &str, _names: &[String], _flags: UpdateFlags) -> Result<()> {
        self.record("delete_refs")
    }

    fn rename_ref(&self, _old: &str, _new: &str, _logmsg: &str) -> Result<()> {
        self.record("rename_ref")
    }

    fn copy_ref(&self, _old: &str, _new: &str, _logmsg: &str) -> Result<()> {
        self.record("copy_ref")
    }

    fn write_pseudoref(&self, _name: &str, _oid: &ObjectId, _old: Option<&ObjectId>) -> Result<()> {
        self.record("write_pseudoref")
    }

    fn delete_pseudoref(&self, _name: &str, _old: Option<&ObjectId>) -> Result<()> {
        self.record("delete_pseudoref")
    }

    fn iterator_begin(&self, _prefix: &str, _flags: IterFlags) -> Result<RefIter> {
        self.record("iterator_begin")?;
        let entry = RefEntry {
            name: "refs/heads/main".into(),
            oid: oid("main"),
            kind: RefType::empty(),
        };
        Ok(Box::new(vec![entry].into_iter()))
    }

    fn read_raw_ref(&self, _name: &str, out: &mut RawRef) -> Result<()> {
        self.record("read_raw_ref")?;
        out.oid = oid("resolved");
        out.referent.clear();
        out.kind = RefType::PACKED;
        Ok(())
    }

    fn reflog_iterator_begin(&self) -> Result<RefIter> {
        self.record("reflog_iterator_begin")?;
        Ok(Box::new(std::iter::empty()))
    }

    fn for_each_reflog_ent(&self, _name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        self.record("for_each_reflog_ent")?;
        Ok(self.walk(self.shared.reflog.iter(), f))
    }

    fn for_each_reflog_ent_reverse(&self, _name: &str, f: &mut ReflogFn<'_>) -> Result<i32> {
        self.record("for_each_reflog_ent_reverse")?;
        Ok(self.walk(self.shared.reflog.iter().rev(), f))
    }

    fn reflog_exists(&self, _name: &str) -> bool {
        self.record("reflog_exists").is_ok()
    }

    fn create_reflog(&self, _name: &str, _force_create: bool) -> Result<()> {
        self.record("create_reflog")
    }

    fn delete_reflog(&self, _name: &str) -> Result<()> {
        self.record("delete_reflog")
    }

    fn reflog_expire(
        &self,
        _name: &str,
        _oid: &ObjectId,
        _flags: ExpireFlags,
        _policy: &mut dyn ReflogExpiryPolicy,
    ) -> Result<()> {
        self.record("reflog_expire")
    }
}

fn traced(shared: Shared) -> (TracedRefStore, Arc<Shared>, Arc<MemorySink>, BackendId) {
    let (backend, shared) = Scripted::new(shared);
    let inner_id = backend.id();
    let sink = Arc::new(MemorySink::new());
    let store = TracedRefStore::wrap(Box::new(backend), sink.clone());
    (store, shared, sink, inner_id)
}

fn two_entry_log() -> Vec<ReflogEntry> {
    vec![
        ReflogEntry {
            old: ObjectId::null(),
            new: oid("first"),
            committer: "A U Thor <author@example.com>".into(),
            timestamp: 100,
            tz_offset: 60,
            message: "create".into(),
        },
        ReflogEntry {
            old: oid("first"),
            new: oid("second"),
            committer: "A U Thor <author@example.com>".into(),
            timestamp: 200,
            tz_offset: 60,
            message: "advance".into(),
        },
    ]
}

struct KeepAll;

impl ReflogExpiryPolicy for KeepAll {
    fn should_prune(&mut self, _entry: &ReflogEntry) -> bool {
        false
    }
}

#[test]
fn create_symref_is_traced() {
    let (store, _, sink, _) = traced(Shared::default());
    store
        .create_symref("HEAD", "refs/heads/main", "init")
        .unwrap();
    assert_eq!(
        sink.lines(),
        vec!["create_symref: HEAD -> refs/heads/main \"init\": 0"]
    );
}

#[test]
fn finish_traces_whole_transaction() {
    let (store, _, sink, _) = traced(Shared::default());
    let h = oid("H");
    let mut tx = Transaction::begin(&store);
    let mut update = RefUpdate::new("refs/heads/x", Some(h), None, UpdateFlags::empty(), "update");
    update.kind = RefType::SYMREF;
    tx.push(update);

    store.transaction_prepare(&mut tx).unwrap();
    assert!(sink.lines().is_empty());
    store.transaction_finish(&mut tx).unwrap();

    assert_eq!(
        sink.lines(),
        vec![
            "transaction {".to_string(),
            format!("0: refs/heads/x null -> {h} (F=0x4, T=0x1) \"update\""),
            "}".to_string(),
            "finish: 0".to_string(),
        ]
    );
}

#[test]
fn finish_masks_internal_bits() {
    let (store, _, sink, _) = traced(Shared::default());
    let mut tx = Transaction::begin(&store);
    let mut update = RefUpdate::new(
        "refs/heads/x",
        Some(oid("n")),
        Some(oid("o")),
        UpdateFlags::empty(),
        "m",
    );
    update.flags = UpdateFlags::from_bits_retain(0xff3);
    update.kind = RefType::from_bits_retain(0x17);
    tx.push(update);
    store.transaction_finish(&mut tx).unwrap();

    let lines = sink.lines();
    assert!(lines[1].ends_with("(F=0x83, T=0x7) \"m\""), "{}", lines[1]);
}

#[test]
fn failed_finish_reports_backend_code() {
    let (store, _, sink, _) = traced(Shared {
        fail: true,
        ..Default::default()
    });
    let mut tx = Transaction::begin(&store);
    let err = store.transaction_finish(&mut tx).unwrap_err();
    assert!(matches!(err, RefError::NotFound { .. }));
    assert_eq!(sink.lines(), vec!["transaction {", "}", "finish: -1"]);
}

#[test]
fn lifecycle_operations_rebind_before_delegating() {
    let (store, shared, _, inner_id) = traced(Shared::default());
    assert_ne!(store.id(), inner_id);

    type Op = fn(&TracedRefStore, &mut Transaction) -> Result<()>;
    let ops: [Op; 4] = [
        |s, tx| s.transaction_prepare(tx),
        |s, tx| s.transaction_finish(tx),
        |s, tx| s.transaction_abort(tx),
        |s, tx| s.initial_transaction_commit(tx),
    ];
    for op in ops {
        let mut tx = Transaction::begin(&store);
        assert_eq!(tx.backend(), Some(store.id()));
        op(&store, &mut tx).unwrap();
        assert_eq!(tx.backend(), Some(inner_id));
    }

    let bindings = shared.bindings.lock().unwrap().clone();
    assert_eq!(bindings, vec![Some(inner_id); 4]);
    assert_eq!(
        shared.calls(),
        vec!["prepare", "finish", "abort", "initial_commit"]
    );
}

#[test]
fn read_raw_ref_failure_leaves_null_sentinel() {
    let (store, _, sink, _) = traced(Shared {
        fail: true,
        ..Default::default()
    });
    let mut out = RawRef {
        oid: oid("garbage"),
        ..Default::default()
    };
    let res = store.read_raw_ref("refs/heads/missing", &mut out);
    assert!(res.is_err());
    assert!(out.oid.is_null());
    assert_eq!(sink.lines(), vec!["read_raw_ref: refs/heads/missing err -1"]);
}

#[test]
fn read_raw_ref_success_is_traced() {
    let (store, _, sink, _) = traced(Shared::default());
    let mut out = RawRef::default();
    store.read_raw_ref("refs/heads/main", &mut out).unwrap();
    assert_eq!(out.oid, oid("resolved"));
    assert_eq!(
        sink.lines(),
        vec![format!(
            "read_raw_ref: refs/heads/main: {} (=> ) type 2: 0",
            oid("resolved")
        )]
    );
}

#[test]
fn reflog_callback_value_reaches_backend_unchanged() {
    let (store, shared, sink, _) = traced(Shared {
        reflog: two_entry_log(),
        ..Default::default()
    });

    let mut seen = 0;
    let ret = store
        .for_each_reflog_ent("refs/heads/main", &mut |_| {
            seen += 1;
            1
        })
        .unwrap();

    assert_eq!(ret, 1);
    assert_eq!(seen, 1);
    assert_eq!(*shared.callback_returns.lock().unwrap(), vec![1]);
    assert_eq!(
        sink.lines(),
        vec![
            format!(
                "reflog_ent refs/heads/main (ret 1): null -> {}, A U Thor <author@example.com> 100 \"create\"",
                oid("first")
            ),
            "for_each_reflog: refs/heads/main: 1".to_string(),
        ]
    );
}

#[test]
fn reverse_reflog_walk_traces_each_entry() {
    let (store, shared, sink, _) = traced(Shared {
        reflog: two_entry_log(),
        ..Default::default()
    });

    let mut messages = Vec::new();
    let ret = store
        .for_each_reflog_ent_reverse("refs/heads/main", &mut |e| {
            messages.push(e.message.clone());
            0
        })
        .unwrap();

    assert_eq!(ret, 0);
    assert_eq!(messages, vec!["advance", "create"]);
    assert_eq!(*shared.callback_returns.lock().unwrap(), vec![0, 0]);
    let lines = sink.lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("reflog_ent refs/heads/main (ret 0): "));
    assert!(lines[0].ends_with(" 200 \"advance\""));
    assert_eq!(lines[2], "for_each_reflog_reverse: refs/heads/main: 0");
}

#[test]
fn failed_reflog_walk_reports_code() {
    let (store, _, sink, _) = traced(Shared {
        fail: true,
        ..Default::default()
    });
    assert!(store
        .for_each_reflog_ent("refs/heads/none", &mut |_| 0)
        .is_err());
    assert_eq!(sink.lines(), vec!["for_each_reflog: refs/heads/none: -1"]);
}

#[test]
fn pseudoref_operations_are_traced() {
    let (store, _, sink, _) = traced(Shared::default());
    let new = oid("new");
    let old = oid("old");
    store.write_pseudoref("ORIG_HEAD", &new, Some(&old)).unwrap();
    store.write_pseudoref("FETCH_HEAD", &new, None).unwrap();
    store.delete_pseudoref("ORIG_HEAD", None).unwrap();
    store.delete_pseudoref("FETCH_HEAD", Some(&new)).unwrap();

    assert_eq!(
        sink.lines(),
        vec![
            format!("write_pseudoref: ORIG_HEAD, {new} => {old}, err : 0"),
            format!("write_pseudoref: FETCH_HEAD, {new} => null, err : 0"),
            "delete_pseudoref: ORIG_HEAD (null): 0".to_string(),
            format!("delete_pseudoref: FETCH_HEAD ({new}): 0"),
        ]
    );
}

#[test]
fn failed_pseudoref_write_carries_error_text() {
    let (store, _, sink, _) = traced(Shared {
        fail: true,
        ..Default::default()
    });
    let new = oid("new");
    assert!(store.write_pseudoref("ORIG_HEAD", &new, None).is_err());
    assert_eq!(
        sink.lines(),
        vec![format!(
            "write_pseudoref: ORIG_HEAD, {new} => null, err ref not found: write_pseudoref: -1"
        )]
    );
}

#[test]
fn rename_copy_and_reflog_queries_are_traced() {
    let (store, _, sink, _) = traced(Shared::default());
    store.rename_ref("refs/heads/a", "refs/heads/b", "mv").unwrap();
    store.copy_ref("refs/heads/b", "refs/heads/c", "cp").unwrap();
    assert!(store.reflog_exists("refs/heads/c"));
    let _ = store.reflog_iterator_begin().unwrap();

    assert_eq!(
        sink.lines(),
        vec![
            "rename_ref: refs/heads/a -> refs/heads/b \"mv\": 0",
            "copy_ref: refs/heads/b -> refs/heads/c \"cp\": 0",
            "reflog_exists: refs/heads/c: 1",
            "for_each_reflog_iterator_begin",
        ]
    );
}

#[test]
fn maintenance_operations_are_forwarded_silently() {
    let (store, shared, sink, _) = traced(Shared::default());
    store.init_db().unwrap();
    store.pack_refs(PackFlags::ALL).unwrap();
    store
        .delete_refs("bulk", &["refs/heads/a".to_string()], UpdateFlags::empty())
        .unwrap();
    let refs: Vec<RefEntry> = store
        .iterator_begin("refs/", IterFlags::empty())
        .unwrap()
        .collect();
    store.create_reflog("refs/heads/a", true).unwrap();
    store.delete_reflog("refs/heads/a").unwrap();
    store
        .reflog_expire("refs/heads/a", &oid("a"), ExpireFlags::DRY_RUN, &mut KeepAll)
        .unwrap();
    let mut tx = Transaction::begin(&store);
    store.transaction_prepare(&mut tx).unwrap();
    store.transaction_abort(&mut tx).unwrap();
    store.initial_transaction_commit(&mut tx).unwrap();

    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].oid, oid("main"));
    assert!(sink.lines().is_empty());
    assert_eq!(
        shared.calls(),
        vec![
            "init_db",
            "pack_refs",
            "delete_refs",
            "iterator_begin",
            "create_reflog",
            "delete_reflog",
            "reflog_expire",
            "prepare",
            "abort",
            "initial_commit",
        ]
    );
}

#[test]
fn into_inner_returns_wrapped_backend() {
    let (store, _, _, inner_id) = traced(Shared::default());
    assert_eq!(store.inner().id(), inner_id);
    assert_eq!(store.inner().name(), "scripted");
    let backend = store.into_inner();
    assert_eq!(backend.id(), inner_id);
}

fn memory_traced() -> (TracedRefStore, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let backend = MemoryRefStore::new().with_fixed_time(1_000);
    (TracedRefStore::wrap(Box::new(backend), sink.clone()), sink)
}

#[test]
fn memory_backend_accepts_rebound_transactions() {
    let (store, sink) = memory_traced();
    store.init_db().unwrap();

    let a = oid("a");
    let mut tx = Transaction::begin(&store);
    tx.update("HEAD", a, None, UpdateFlags::empty(), "first commit");
    store.transaction_prepare(&mut tx).unwrap();
    store.transaction_finish(&mut tx).unwrap();
    assert_eq!(tx.state(), TransactionState::Finished);
    assert_eq!(tx.backend(), Some(store.inner().id()));

    assert_eq!(
        sink.take(),
        vec![
            "transaction {".to_string(),
            "0: HEAD null -> ".to_string() + &a.to_hex() + " (F=0x85, T=0x1) \"first commit\"",
            "1: refs/heads/main null -> ".to_string() + &a.to_hex() + " (F=0x4, T=0x0) \"first commit\"",
            "}".to_string(),
            "finish: 0".to_string(),
        ]
    );

    let mut out = RawRef::default();
    store.read_raw_ref("HEAD", &mut out).unwrap();
    assert_eq!(out.referent, "refs/heads/main");
    assert_eq!(
        sink.take(),
        vec![format!(
            "read_raw_ref: HEAD: {} (=> refs/heads/main) type 1: 0",
            ObjectId::null()
        )]
    );
}

#[test]
fn memory_backend_refuses_unrebound_transaction() {
    let (store, _) = memory_traced();
    let mut tx = Transaction::begin(&store);
    tx.update("refs/heads/a", oid("a"), None, UpdateFlags::empty(), "");
    let err = store.inner().transaction_prepare(&mut tx).unwrap_err();
    assert!(matches!(err, RefError::ForeignTransaction));
}

#[test]
fn traced_and_plain_memory_stores_agree() {
    let plain = MemoryRefStore::new().with_fixed_time(1_000);
    let (traced, _) = memory_traced();

    for store in [&plain as &dyn RefBackend, &traced as &dyn RefBackend] {
        store.init_db().unwrap();
        let mut tx = Transaction::begin(store);
        tx.update("refs/heads/main", oid("1"), None, UpdateFlags::empty(), "one");
        store.transaction_prepare(&mut tx).unwrap();
        store.transaction_finish(&mut tx).unwrap();
        store
            .write_pseudoref("ORIG_HEAD", &oid("1"), None)
            .unwrap();
    }

    let snapshot = |store: &dyn RefBackend| {
        let mut raw = RawRef::default();
        let head = store.read_raw_ref("HEAD", &mut raw).map(|_| raw.clone());
        let mut missing = RawRef::default();
        let missing_code = store
            .read_raw_ref("refs/heads/missing", &mut missing)
            .map_err(|e| e.code());
        let mut log = Vec::new();
        let walk = store.for_each_reflog_ent("refs/heads/main", &mut |e| {
            log.push(e.clone());
            0
        });
        let refs: Vec<RefEntry> = store
            .iterator_begin("", IterFlags::empty())
            .unwrap()
            .collect();
        let bad_swap = store
            .write_pseudoref("ORIG_HEAD", &oid("2"), Some(&oid("x")))
            .map_err(|e| e.to_string());
        (
            head.unwrap(),
            missing_code,
            missing.oid,
            walk.unwrap(),
            log,
            refs,
            bad_swap,
            store.reflog_exists("refs/heads/main"),
        )
    };

    assert_eq!(snapshot(&plain), snapshot(&traced));
}
