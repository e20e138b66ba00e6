//! Reconciliation (§4.5): re-derives this machine's contribution to the
//! location index from the local content store, because the event
//! stream is lossy under extended disconnection from the global store
//! or the event log.
//!
//! The freshness marker, the capped co-walk diff, and the temporary
//! event-store instance used to land the Reconcile batch ahead of any
//! subsequently queued event are all implemented here, kept separate
//! from `lls::mod` so the diff itself stays unit-testable without a
//! full `LocalLocationStore`.

use std::cmp::Ordering;
use std::time::SystemTime;

use crate::checkpoint::marker_is_fresh;
use crate::content_db::now_unix;
use crate::error::Result;
use crate::event_store::EventContext;
use crate::hash::ContentHash;

use super::LocalLocationStore;

/// Outcome of one `reconcile()` call, surfaced for observability.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct ReconcileOutcome {
    /// True if the freshness marker was already up to date and the
    /// whole call was a no-op.
    pub skipped_up_to_date: bool,
    /// Number of diff cycles run (each bounded by
    /// `ReconciliationMaxCycleSize`).
    pub cycles_run: usize,
    /// Total hashes found local-only across all cycles.
    pub added: usize,
    /// Total hashes found db-only across all cycles.
    pub removed: usize,
}

/// Classic sorted-merge diff, capped at `cap` co-walk steps (matches,
/// adds, and removes all count toward the cap so the cycle is bounded
/// even when most keys agree). Returns the local-only adds, the
/// db-only removes, and the last key examined (used to resume the next
/// cycle strictly after it).
fn diff_capped(
    local: &[(ContentHash, u64)],
    db: &[(ContentHash, u64)],
    cap: usize,
) -> (Vec<(ContentHash, u64)>, Vec<ContentHash>, Option<ContentHash>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut last_key = None;
    let (mut i, mut j) = (0, 0);
    let mut steps = 0;

    while steps < cap {
        match (local.get(i), db.get(j)) {
            (Some(&(lh, lsize)), Some(&(dh, _))) => {
                match lh.cmp(&dh) {
                    Ordering::Less => {
                        added.push((lh, lsize));
                        last_key = Some(lh);
                        i += 1;
                    }
                    Ordering::Greater => {
                        removed.push(dh);
                        last_key = Some(dh);
                        j += 1;
                    }
                    Ordering::Equal => {
                        last_key = Some(lh);
                        i += 1;
                        j += 1;
                    }
                }
            }
            (Some(&(lh, lsize)), None) => {
                added.push((lh, lsize));
                last_key = Some(lh);
                i += 1;
            }
            (None, Some(&(dh, _))) => {
                removed.push(dh);
                last_key = Some(dh);
                j += 1;
            }
            (None, None) => break,
        }
        steps += 1;
    }

    (added, removed, last_key)
}

impl LocalLocationStore {
    /// Runs reconciliation to completion: if the on-disk marker is
    /// fresh, this is a no-op; otherwise it cycles the capped co-walk
    /// diff until a cycle produces less than a full cap's worth of
    /// work, writing the marker on success.
    pub(super) async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let now_secs = now_unix(SystemTime::now());

        let marker = self.checkpoints.read_marker().await;
        if marker_is_fresh(
            marker.as_ref(),
            &self.checkpoint_prefix,
            now_secs,
            self.config.reconciliation_freshness_window(),
        ) {
            return Ok(ReconcileOutcome {
                skipped_up_to_date: true,
                ..Default::default()
            });
        }

        let mut outcome = ReconcileOutcome::default();
        let mut cursor: Option<ContentHash> = None;
        let cap = self.config.reconciliation_max_cycle_size;

        loop {
            // Production only; consumption continues while paused.
            let pause = self.event_store.pause_sending().await;

            let local_inventory = self.local_store.full_inventory().await?;
            let local_side: Vec<(ContentHash, u64)> = local_inventory
                .into_iter()
                .filter(|e| cursor.map(|c| e.hash > c).unwrap_or(true))
                .map(|e| (e.hash, e.size))
                .collect();
            let db_side = self.db.local_machine_inventory(self.local_machine_id, cursor);

            let (added, removed, new_cursor) = diff_capped(&local_side, &db_side, cap);

            if !added.is_empty() || !removed.is_empty() {
                let scratch = self.event_store.open_scratch_writer().await?;
                scratch
                    .reconcile(EventContext, self.local_machine_id, &added, &removed)
                    .await?;
                outcome.added += added.len();
                outcome.removed += removed.len();
                crate::telemetry::Counters::add(
                    &self.counters.reconciliation_events_emitted,
                    (added.len() + removed.len()) as u64,
                );
            }
            crate::telemetry::Counters::incr(&self.counters.reconciliation_cycles);

            outcome.cycles_run += 1;
            drop(pause);

            // A cycle that scanned fewer than `cap` combined entries
            // reached the end of both streams; anything more means
            // there is another capped pass of work left to do.
            let work_remaining = local_side.len() + db_side.len() > cap;
            cursor = new_cursor.or(cursor);

            if !work_remaining {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconciliation_cycle_frequency) => {}
            }
        }

        self.checkpoints.write_marker(&self.checkpoint_prefix, now_secs).await?;
        Ok(outcome)
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
    fn diff_finds_local_only_and_db_only_entries() {
        let local = vec![(hash(1), 10), (hash(2), 20), (hash(4), 40)];
        let db = vec![(hash(2), 20), (hash(3), 30), (hash(4), 40)];
        let (added, removed, cursor) = diff_capped(&local, &db, 100);
        assert_eq!(added, vec![(hash(1), 10)]);
        assert_eq!(removed, vec![hash(3)]);
        assert_eq!(cursor, Some(hash(4)));
    }

    #[test]
    fn diff_respects_the_cap() {
        let local = vec![(hash(1), 1), (hash(2), 2), (hash(3), 3)];
        let db: Vec<(ContentHash, u64)> = Vec::new();
        let (added, _removed, cursor) = diff_capped(&local, &db, 2);
        assert_eq!(added.len(), 2);
        assert_eq!(cursor, Some(hash(2)));
    }

    #[test]
    fn matching_keys_produce_no_diff() {
        let local = vec![(hash(1), 1)];
        let db = vec![(hash(1), 1)];
        let (added, removed, cursor) = diff_capped(&local, &db, 10);
        assert!(added.is_empty());
        assert!(removed.is_empty());
        assert_eq!(cursor, Some(hash(1)));
    }
}
