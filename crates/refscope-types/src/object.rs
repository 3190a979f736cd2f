use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width of an object identifier in bytes.
pub const RAW_LEN: usize = 32;

/// Width of the hex rendering of an object identifier.
pub const HEX_LEN: usize = RAW_LEN * 2;

/// Content hash identifying an object that a reference can point at.
///
/// An `ObjectId` is the BLAKE3 hash of an object's content. The all-zero
/// value is reserved as the null sentinel: it never names a real object and
/// stands in for "absent" wherever an identifier slot has no value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; RAW_LEN]);

impl ObjectId {
    /// Compute an `ObjectId` from raw content bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create an `ObjectId` from a pre-computed hash.
    pub const fn from_hash(hash: [u8; RAW_LEN]) -> Self {
        Self(hash)
    }

    /// The null object ID (all zeros). Represents "no object".
    pub const fn null() -> Self {
        Self([0u8; RAW_LEN])
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; RAW_LEN]
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; RAW_LEN] {
        &self.0
    }

    /// Lowercase, fixed-width hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a full-width hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let arr: [u8; RAW_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypeError::InvalidLength {
                expected: RAW_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// `None` for the null sentinel, `Some(self)` otherwise.
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; RAW_LEN]> for ObjectId {
    fn from(bytes: [u8; RAW_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<ObjectId> for [u8; RAW_LEN] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}
