//! Reference storage for refscope.
//!
//! This crate defines the interface every reference backend implements and
//! ships two implementations of it: an in-memory backend, and a decorator
//! that wraps any backend and writes a line-oriented trace of the calls it
//! forwards.
//!
//! # Architecture
//!
//! - **Refs** map names (`refs/heads/main`, `HEAD`) to object ids, directly
//!   or symbolically through another ref. They change through
//!   [`Transaction`]s that move through prepare, finish, or abort.
//! - **Pseudorefs** (`FETCH_HEAD`, `ORIG_HEAD`) are single-writer pointers
//!   written outside transactions, with a compare-and-swap on the old value.
//! - **Reflogs** record every transition of a ref, oldest first, and are
//!   enumerated through a callback that can stop the walk early.
//!
//! # Modules
//!
//! - [`error`]: Error types and integer result codes
//! - [`types`]: Updates, transactions, reflog entries, flag sets
//! - [`traits`]: The [`RefBackend`] trait defining the storage interface
//! - [`names`]: Ref name validation
//! - [`memory`]: In-memory [`MemoryRefStore`]
//! - [`trace`]: [`TraceSink`] destinations for trace lines
//! - [`traced`]: The instrumented [`TracedRefStore`]
//! - [`config`]: [`StoreConfig`] and [`open_store`]

pub mod config;
pub mod error;
pub mod memory;
pub mod names;
pub mod trace;
pub mod traced;
pub mod traits;
pub mod types;

pub use config::{open_store, BackendKind, ConfigError, SinkKind, StoreConfig};
pub use error::{result_code, RefError, Result};
pub use memory::{MemoryRefStore, RefValue};
pub use names::{check_pseudoref_name, check_refname_format};
pub use trace::{hex_or_null, LogSink, MemorySink, StdoutSink, TraceSink};
pub use traced::TracedRefStore;
pub use traits::{RefBackend, RefIter, ReflogExpiryPolicy, ReflogFn};
pub use types::{
    BackendId, ExpireFlags, IterFlags, PackFlags, RawRef, RefEntry, RefType, RefUpdate,
    ReflogEntry, Transaction, TransactionState, UpdateFlags,
};
