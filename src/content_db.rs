//! Component C: the local materialized content location index,
//! `ContentHash -> { size, lastAccess, bitset of MachineIds }`.
//!
//! Writes are rejected unless the database has been marked writeable,
//! which the LLS core does iff `CurrentRole == Master` (§8, "Role
//! exclusivity of writes"). Restores (§4.4) install a full snapshot
//! regardless of role, since any role may apply a checkpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bitset::MachineBitSet;
use crate::error::{Error, ErrorKind, Result};
use crate::hash::ContentHash;
use crate::machine::MachineId;

/// Unix-epoch seconds, matching the wire-level timestamp granularity
/// named in §3.
pub type UnixSeconds = u64;

pub fn now_unix(now: SystemTime) -> UnixSeconds {
    now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A single entry in the content location database.
#[derive(Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ContentLocationEntry {
    pub size: u64,
    pub last_access_utc: UnixSeconds,
    pub locations: MachineBitSet,
}

impl ContentLocationEntry {
    pub fn replica_count(&self) -> usize {
        self.locations.count()
    }
}

/// The local materialized content location index.
pub struct ContentLocationDatabase {
    writeable: AtomicBool,
    entries: RwLock<BTreeMap<ContentHash, ContentLocationEntry>>,
}

impl ContentLocationDatabase {
    pub fn new() -> Self {
        Self {
            writeable: AtomicBool::new(false),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Marks the database writeable (Master) or read-only (Worker).
    pub fn set_writeable(&self, writeable: bool) {
        self.writeable.store(writeable, Ordering::SeqCst);
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable.load(Ordering::SeqCst)
    }

    fn require_writeable(&self) -> Result<()> {
        if self.is_writeable() {
            Ok(())
        } else {
            Err(Error::simple(ErrorKind::PreconditionViolated))
        }
    }

    /// Looks up a single hash. `None` represents the distinguished
    /// *Missing* entry: no local record of this hash.
    pub fn get(&self, hash: &ContentHash) -> Option<ContentLocationEntry> {
        self.entries.read().get(hash).cloned()
    }

    pub fn get_bulk(&self, hashes: &[ContentHash]) -> Vec<Option<ContentLocationEntry>> {
        let entries = self.entries.read();
        hashes.iter().map(|h| entries.get(h).cloned()).collect()
    }

    /// Applies a batch Add: sets `machine_id`'s bit for each hash,
    /// creating the entry if necessary; `lastAccessUtc` is bumped to
    /// `now` (never decreased, per invariant 2).
    pub fn apply_add(
        &self,
        machine_id: MachineId,
        hashes_with_size: &[(ContentHash, u64)],
        now: UnixSeconds,
    ) -> Result<()> {
        self.require_writeable()?;
        let mut entries = self.entries.write();
        for &(hash, size) in hashes_with_size {
            let entry = entries.entry(hash).or_insert_with(|| ContentLocationEntry {
                size,
                last_access_utc: now,
                locations: MachineBitSet::new(),
            });
            entry.size = size;
            entry.locations.set(machine_id);
            if now > entry.last_access_utc {
                entry.last_access_utc = now;
            }
        }
        Ok(())
    }

    /// Applies a batch Remove: clears `machine_id`'s bit for each hash.
    /// Concurrent add/remove for the same hash/machine resolves to
    /// last-writer-wins under event order (invariant 1): we simply
    /// apply whichever of add/remove is replayed last.
    pub fn apply_remove(&self, machine_id: MachineId, hashes: &[ContentHash]) -> Result<()> {
        self.require_writeable()?;
        let mut entries = self.entries.write();
        for hash in hashes {
            if let Some(entry) = entries.get_mut(hash) {
                entry.locations.clear(machine_id);
            }
        }
        Ok(())
    }

    /// Applies a batch Touch: bumps `lastAccessUtc` for each hash that
    /// has an entry with `machine_id`'s bit set. `lastAccessUtc` is
    /// non-decreasing (invariant 2).
    pub fn apply_touch(
        &self,
        machine_id: MachineId,
        hashes: &[ContentHash],
        now: UnixSeconds,
    ) -> Result<()> {
        self.require_writeable()?;
        let mut entries = self.entries.write();
        for hash in hashes {
            if let Some(entry) = entries.get_mut(hash) {
                if entry.locations.contains(machine_id) && now > entry.last_access_utc {
                    entry.last_access_utc = now;
                }
            }
        }
        Ok(())
    }

    /// Replaces the entire database with a checkpoint snapshot. Allowed
    /// under any role, since a restore may run on a Worker (invariant 2
    /// exception: `lastAccessUtc` may decrease here).
    pub fn install_snapshot(&self, snapshot: BTreeMap<ContentHash, ContentLocationEntry>) {
        let mut entries = self.entries.write();
        *entries = snapshot;
    }

    /// Takes a full snapshot for checkpoint creation.
    pub fn snapshot(&self) -> BTreeMap<ContentHash, ContentLocationEntry> {
        self.entries.read().clone()
    }

    /// This machine's contribution to the index, sorted ascending by
    /// hash (and therefore also by `ShortHash`, since the two orderings
    /// agree — see `hash::ShortHash`), resuming strictly after `after`
    /// if given. Used by reconciliation (§4.5 step 3) to co-walk
    /// against the local content store's inventory.
    pub fn local_machine_inventory(
        &self,
        machine_id: MachineId,
        after: Option<ContentHash>,
    ) -> Vec<(ContentHash, u64)> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, entry)| entry.locations.contains(machine_id))
            .filter(|(hash, _)| after.map(|a| **hash > a).unwrap_or(true))
            .map(|(hash, entry)| (*hash, entry.size))
            .collect()
    }

    /// All hashes in ascending order with their per-hash snapshot, used
    /// by the eviction ordering stream (component J).
    pub fn all_entries(&self) -> Vec<(ContentHash, ContentLocationEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(h, e)| (*h, e.clone()))
            .collect()
    }

    /// TTL-based compaction sweep (§3, "removed by TTL-based
    /// compaction"): drops entries whose `lastAccessUtc` has exceeded
    /// `expiry` and which have no remaining replicas.
    pub fn compact_expired(&self, expiry: Duration, now: UnixSeconds) -> usize {
        let expiry_secs = expiry.as_secs();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let expired = now.saturating_sub(entry.last_access_utc) >= expiry_secs;
            !(expired && entry.locations.is_empty())
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for ContentLocationDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> ContentHash {
        let mut raw = [0u8; ContentHash::LENGTH];
        raw[0] = b;
        ContentHash::from_bytes(&raw).unwrap()
    }

    #[test]
    fn writes_rejected_unless_writeable() {
        let db = ContentLocationDatabase::new();
        let h = hash(1);
        let err = db.apply_add(MachineId(1), &[(h, 10)], 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolated);
        db.set_writeable(true);
        db.apply_add(MachineId(1), &[(h, 10)], 100).unwrap();
        assert!(db.get(&h).is_some());
    }

    #[test]
    fn last_access_is_non_decreasing_on_touch() {
        let db = ContentLocationDatabase::new();
        db.set_writeable(true);
        let h = hash(2);
        db.apply_add(MachineId(1), &[(h, 10)], 100).unwrap();
        db.apply_touch(MachineId(1), &[h], 50).unwrap();
        assert_eq!(db.get(&h).unwrap().last_access_utc, 100);
        db.apply_touch(MachineId(1), &[h], 200).unwrap();
        assert_eq!(db.get(&h).unwrap().last_access_utc, 200);
    }

    #[test]
    fn remove_clears_only_that_machines_bit() {
        let db = ContentLocationDatabase::new();
        db.set_writeable(true);
        let h = hash(3);
        db.apply_add(MachineId(1), &[(h, 10)], 100).unwrap();
        db.apply_add(MachineId(2), &[(h, 10)], 100).unwrap();
        db.apply_remove(MachineId(1), &[h]).unwrap();
        let entry = db.get(&h).unwrap();
        assert!(!entry.locations.contains(MachineId(1)));
        assert!(entry.locations.contains(MachineId(2)));
    }

    #[test]
    fn install_snapshot_bypasses_writeable_check() {
        let db = ContentLocationDatabase::new();
        let h = hash(4);
        let mut snap = BTreeMap::new();
        snap.insert(
            h,
            ContentLocationEntry {
                size: 5,
                last_access_utc: 1,
                locations: MachineBitSet::new(),
            },
        );
        db.install_snapshot(snap);
        assert_eq!(db.get(&h).unwrap().size, 5);
    }

    #[test]
    fn local_machine_inventory_sorted_and_resumable() {
        let db = ContentLocationDatabase::new();
        db.set_writeable(true);
        let a = hash(1);
        let b = hash(2);
        let c = hash(3);
        db.apply_add(MachineId(9), &[(a, 1), (b, 2), (c, 3)], 10)
            .unwrap();
        let all = db.local_machine_inventory(MachineId(9), None);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        let resumed = db.local_machine_inventory(MachineId(9), Some(all[0].0));
        assert_eq!(resumed.len(), 2);
    }

    #[test]
    fn compact_expired_drops_only_empty_and_old() {
        let db = ContentLocationDatabase::new();
        db.set_writeable(true);
        let stale_empty = hash(1);
        let stale_with_replica = hash(2);
        db.apply_add(MachineId(1), &[(stale_empty, 1), (stale_with_replica, 1)], 0)
            .unwrap();
        db.apply_remove(MachineId(1), &[stale_empty]).unwrap();

        let removed = db.compact_expired(Duration::from_secs(10), 100);
        assert_eq!(removed, 1);
        assert!(db.get(&stale_empty).is_none());
        assert!(db.get(&stale_with_replica).is_some());
    }
}
