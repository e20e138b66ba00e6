//! Lazy location resolution with reputation ordering (§9 Design
//! Notes: "not worth its own component", kept as a thin wrapper).
//!
//! Randomizes iteration order over the set bits of a
//! `MachineBitSet` before resolving each id to a `MachineLocation` and
//! re-sorting by reputation, so that among equally-reputed machines
//! callers don't always hit the same one first.

use rand_core::{OsRng, RngCore};

use crate::bitset::MachineBitSet;
use crate::cluster_state::ClusterState;
use crate::machine::{MachineId, MachineLocation};
use crate::reputation::ReputationTracker;

fn shuffle(ids: &mut [MachineId]) {
    let mut rng = OsRng;
    // Fisher-Yates, from the last element down to the second.
    for i in (1..ids.len()).rev() {
        let j = (rng.next_u32() as usize) % (i + 1);
        ids.swap(i, j);
    }
}

/// Resolves the set bits of `locations` to `MachineLocation`s,
/// randomized first to avoid a fixed iteration bias, then ordered by
/// descending reputation.
pub fn resolve_locations(
    locations: &MachineBitSet,
    cluster: &ClusterState,
    reputation: &ReputationTracker,
) -> Vec<MachineLocation> {
    resolve_locations_with_ids(locations, cluster, reputation)
        .into_iter()
        .map(|(_, location)| location)
        .collect()
}

/// Same ordering as `resolve_locations`, but keeps each resolved
/// location paired with its `MachineId` for callers that need to key a
/// follow-up (e.g. a reputation update) on the machine actually chosen.
pub fn resolve_locations_with_ids(
    locations: &MachineBitSet,
    cluster: &ClusterState,
    reputation: &ReputationTracker,
) -> Vec<(MachineId, MachineLocation)> {
    let mut ids: Vec<MachineId> = locations.iter().collect();
    shuffle(&mut ids);
    reputation.sort_by_reputation(&mut ids);
    ids.into_iter()
        .filter_map(|id| cluster.resolve(id).map(|location| (id, location)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn resolves_only_known_machines_in_reputation_order() {
        let mut bits = MachineBitSet::new();
        bits.set(MachineId(1));
        bits.set(MachineId(2));
        bits.set(MachineId(3)); // unresolvable, should be dropped

        let cluster = ClusterState::new();
        cluster.upsert(MachineId(1), MachineLocation::new("a"), true, Instant::now());
        cluster.upsert(MachineId(2), MachineLocation::new("b"), true, Instant::now());

        let reputation = ReputationTracker::new(0.5);
        reputation.record_success(MachineId(2));

        let resolved = resolve_locations(&bits, &cluster, &reputation);
        assert_eq!(resolved, vec![MachineLocation::new("b"), MachineLocation::new("a")]);
    }
}
