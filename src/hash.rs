//! Content-addressing identifiers.
//!
//! The content store that owns hashing is an external collaborator
//! (out of scope, §1); this module only defines the opaque,
//! fixed-width identifiers the rest of the crate orders and indexes by.

use std::cmp::Ordering;
use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Opaque fixed-width content identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct ContentHash(#[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))] [u8; ContentHash::LENGTH]);

impl ContentHash {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err(Error::message(
                ErrorKind::PreconditionViolated,
                format!("content hash must be {} bytes, got {}", Self::LENGTH, raw.len()),
            ));
        }
        let mut inner = [0u8; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }

    /// Derives the `ShortHash` ordering prefix for this hash.
    pub fn short(&self) -> ShortHash {
        let mut inner = [0u8; ShortHash::LENGTH];
        inner.copy_from_slice(&self.0[..ShortHash::LENGTH]);
        ShortHash(inner)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// Prefix of a `ContentHash`, used for ordered enumeration and compact
/// set membership. Two hashes sharing this prefix order the same way
/// under `ContentHash`'s own `Ord` impl as they do under `ShortHash`'s.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct ShortHash([u8; ShortHash::LENGTH]);

impl ShortHash {
    pub const LENGTH: usize = 8;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err(Error::message(
                ErrorKind::PreconditionViolated,
                format!("short hash must be {} bytes, got {}", Self::LENGTH, raw.len()),
            ));
        }
        let mut inner = [0u8; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for ShortHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ContentHash {
        let mut raw = [0u8; ContentHash::LENGTH];
        raw[0] = byte;
        ContentHash::from_bytes(&raw).unwrap()
    }

    #[test]
    fn short_hash_preserves_ordering_of_shared_prefix() {
        let a = hash(1);
        let b = hash(2);
        assert_eq!(a.cmp(&b), a.short().cmp(&b.short()));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ContentHash::from_bytes(&[0u8; 4]).is_err());
    }
}
