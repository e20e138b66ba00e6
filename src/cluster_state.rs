//! Component B: in-memory `MachineId <-> MachineLocation` mapping,
//! active/inactive bits, and the monotonic `MaxMachineId` watermark.
//!
//! Shared read-mostly; writes are serialized through the LLS core
//! (§3 Ownership).

use std::time::Instant;

use parking_lot::RwLock;

use crate::machine::{MachineId, MachineLocation};

struct MachineEntry {
    location: MachineLocation,
    active: bool,
    last_active_change: Instant,
}

struct Inner {
    machines: Vec<Option<MachineEntry>>,
    max_machine_id: u32,
    last_inactive_time: Option<Instant>,
}

/// In-memory view of the cluster's machine directory.
pub struct ClusterState {
    inner: RwLock<Inner>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                machines: Vec::new(),
                max_machine_id: 0,
                last_inactive_time: None,
            }),
        }
    }

    /// Resolves a `MachineId` to its `MachineLocation`, if known.
    pub fn resolve(&self, id: MachineId) -> Option<MachineLocation> {
        let inner = self.inner.read();
        inner
            .machines
            .get(id.0 as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.location.clone())
    }

    /// True if every id in `ids` resolves to a known location.
    pub fn all_resolvable<I: IntoIterator<Item = MachineId>>(&self, ids: I) -> bool {
        let inner = self.inner.read();
        ids.into_iter().all(|id| {
            inner
                .machines
                .get(id.0 as usize)
                .map(|slot| slot.is_some())
                .unwrap_or(false)
        })
    }

    /// Records or updates a machine's address and activity bit.
    pub fn upsert(&self, id: MachineId, location: MachineLocation, active: bool, now: Instant) {
        let mut inner = self.inner.write();
        let idx = id.0 as usize;
        if idx >= inner.machines.len() {
            inner.machines.resize_with(idx + 1, || None);
        }
        let was_active = inner
            .machines
            .get(idx)
            .and_then(|s| s.as_ref())
            .map(|e| e.active)
            .unwrap_or(true);
        inner.machines[idx] = Some(MachineEntry {
            location,
            active,
            last_active_change: now,
        });
        if was_active && !active {
            inner.last_inactive_time = Some(now);
        }
        if id.0 > inner.max_machine_id {
            inner.max_machine_id = id.0;
        }
    }

    /// Marks a machine active without changing its location, used when
    /// an incoming event from that machine is observed (§4.8).
    pub fn mark_active(&self, id: MachineId, now: Instant) {
        let mut inner = self.inner.write();
        let idx = id.0 as usize;
        if idx < inner.machines.len() {
            if let Some(entry) = inner.machines[idx].as_mut() {
                entry.active = true;
                entry.last_active_change = now;
            }
        }
    }

    /// Monotonic watermark: the largest machine id ever observed.
    pub fn max_machine_id(&self) -> u32 {
        self.inner.read().max_machine_id
    }

    /// Most recent time any machine transitioned from active to
    /// inactive, used by the registration policy's "recent inactivity"
    /// eager-write trigger (§4.2 rule 2).
    pub fn last_inactive_time(&self) -> Option<Instant> {
        self.inner.read().last_inactive_time
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resolves_after_upsert() {
        let cs = ClusterState::new();
        let now = Instant::now();
        cs.upsert(MachineId(3), MachineLocation::new("10.0.0.1:9"), true, now);
        assert_eq!(
            cs.resolve(MachineId(3)).unwrap(),
            MachineLocation::new("10.0.0.1:9")
        );
        assert!(cs.resolve(MachineId(4)).is_none());
    }

    #[test]
    fn max_machine_id_is_monotonic_watermark() {
        let cs = ClusterState::new();
        let now = Instant::now();
        cs.upsert(MachineId(5), MachineLocation::new("a"), true, now);
        cs.upsert(MachineId(2), MachineLocation::new("b"), true, now);
        assert_eq!(cs.max_machine_id(), 5);
    }

    #[test]
    fn transition_to_inactive_records_last_inactive_time() {
        let cs = ClusterState::new();
        let t0 = Instant::now();
        cs.upsert(MachineId(1), MachineLocation::new("a"), true, t0);
        assert!(cs.last_inactive_time().is_none());

        let t1 = t0 + Duration::from_secs(1);
        cs.upsert(MachineId(1), MachineLocation::new("a"), false, t1);
        assert_eq!(cs.last_inactive_time(), Some(t1));
    }

    #[test]
    fn all_resolvable_false_on_any_unknown_id() {
        let cs = ClusterState::new();
        cs.upsert(MachineId(1), MachineLocation::new("a"), true, Instant::now());
        assert!(cs.all_resolvable([MachineId(1)]));
        assert!(!cs.all_resolvable([MachineId(1), MachineId(2)]));
    }
}
