//! Machine identifiers and addresses.

use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Dense small integer assigned by the global store on first
/// registration. Ids are never reused; the maximum observed id is a
/// watermark (see `ClusterState::max_machine_id`).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct MachineId(pub u32);

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

impl From<u32> for MachineId {
    #[inline]
    fn from(id: u32) -> Self {
        MachineId(id)
    }
}

impl From<MachineId> for u32 {
    #[inline]
    fn from(id: MachineId) -> Self {
        id.0
    }
}

impl From<MachineId> for usize {
    #[inline]
    fn from(id: MachineId) -> Self {
        id.0 as usize
    }
}

/// Opaque network address of a machine. The wire format is a transport
/// concern and out of scope for this crate.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct MachineLocation(pub String);

impl MachineLocation {
    pub fn new(addr: impl Into<String>) -> Self {
        MachineLocation(addr.into())
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
