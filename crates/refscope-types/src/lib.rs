//! Foundation types for refscope.
//!
//! This crate provides the identifier type shared by every refscope crate:
//! [`ObjectId`], the fixed-width content hash that references point at, with
//! its reserved all-zero value standing for "no object".

pub mod error;
pub mod object;

pub use error::TypeError;
pub use object::{ObjectId, HEX_LEN, RAW_LEN};
