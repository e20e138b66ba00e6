//! Component H: per-machine reputation score used to order candidate
//! locations returned to callers.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::machine::MachineId;

/// Tracks a reputation score per machine. Higher is better; callers
/// consulting `MachineList` (see `machine_list`) sort candidates by
/// descending score.
pub struct ReputationTracker {
    scores: RwLock<HashMap<MachineId, f64>>,
    default_score: f64,
}

impl ReputationTracker {
    pub fn new(default_score: f64) -> Self {
        Self {
            scores: RwLock::new(HashMap::new()),
            default_score,
        }
    }

    pub fn score(&self, id: MachineId) -> f64 {
        self.scores
            .read()
            .get(&id)
            .copied()
            .unwrap_or(self.default_score)
    }

    /// Records a successful interaction with `id`, nudging its score up.
    pub fn record_success(&self, id: MachineId) {
        let mut scores = self.scores.write();
        let entry = scores.entry(id).or_insert(self.default_score);
        *entry = (*entry + 0.1).min(1.0);
    }

    /// Records a failed interaction with `id`, nudging its score down.
    pub fn record_failure(&self, id: MachineId) {
        let mut scores = self.scores.write();
        let entry = scores.entry(id).or_insert(self.default_score);
        *entry = (*entry - 0.2).max(0.0);
    }

    /// Sorts `ids` by descending reputation score, stable on ties.
    pub fn sort_by_reputation(&self, ids: &mut [MachineId]) {
        let scores = self.scores.read();
        ids.sort_by(|a, b| {
            let sa = scores.get(a).copied().unwrap_or(self.default_score);
            let sb = scores.get(b).copied().unwrap_or(self.default_score);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_machine_gets_default_score() {
        let rt = ReputationTracker::new(0.5);
        assert_eq!(rt.score(MachineId(1)), 0.5);
    }

    #[test]
    fn success_and_failure_move_score_within_bounds() {
        let rt = ReputationTracker::new(0.5);
        rt.record_success(MachineId(1));
        assert!(rt.score(MachineId(1)) > 0.5);
        for _ in 0..20 {
            rt.record_failure(MachineId(1));
        }
        assert_eq!(rt.score(MachineId(1)), 0.0);
    }

    #[test]
    fn sort_orders_descending_by_score() {
        let rt = ReputationTracker::new(0.5);
        rt.record_success(MachineId(2));
        rt.record_failure(MachineId(3));
        let mut ids = vec![MachineId(3), MachineId(1), MachineId(2)];
        rt.sort_by_reputation(&mut ids);
        assert_eq!(ids, vec![MachineId(2), MachineId(1), MachineId(3)]);
    }
}
