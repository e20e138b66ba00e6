//! Proactive replication (§4.6): keeps at most one in-flight
//! replication task, driven by this machine's local content in
//! descending last-access order fed through the eviction-ordering
//! stream with `reverse=true`, so recently-used content is offered for
//! replication last.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::content_db::now_unix;
use crate::error::Result;
use crate::eviction::{eviction_order, EvictionCandidate, EvictionParams};
use crate::hash::ContentHash;
use crate::machine::{MachineId, MachineLocation};
use crate::telemetry::Counters;

use super::LocalLocationStore;

/// Copies a single hash to another peer. The concrete blob-transfer
/// mechanism between peers is an external collaborator (§1, out of
/// scope); this crate only decides *what* to copy, in what order, and
/// how fast, driving whatever implementation is supplied at startup.
#[async_trait]
pub trait ReplicationCopier: Send + Sync {
    /// `target` is `None` when this hash currently has no resolvable
    /// replica locations at all; implementations are expected to pick
    /// a destination themselves in that case (e.g. any healthy peer).
    async fn copy(&self, hash: ContentHash, target: Option<MachineLocation>) -> Result<()>;
}

/// Outcome of one proactive replication run, surfaced for
/// observability and by tests.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct ReplicationOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub cancelled: bool,
}

impl LocalLocationStore {
    /// Cancels any in-flight replication task (serialized by the lock
    /// around the token handoff, §5) and spawns a fresh one bound to
    /// this node's `Arc`, so the task can outlive the borrow of the
    /// `&self` call it was started from.
    pub(super) fn spawn_proactive_replication_if_idle(&self) {
        let Some(this) = self.self_handle() else {
            return;
        };
        let token = Self::hand_off_proactive_token(&self.proactive_token);
        tokio::spawn(async move {
            match this.run_proactive_replication(token).await {
                Ok(outcome) => {
                    tracing::info!(
                        attempted = outcome.attempted,
                        succeeded = outcome.succeeded,
                        cancelled = outcome.cancelled,
                        "proactive replication run finished"
                    );
                }
                Err(e) => tracing::warn!(error = ?e, "proactive replication run failed"),
            }
        });
    }

    fn hand_off_proactive_token(slot: &parking_lot::Mutex<Option<CancellationToken>>) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = slot.lock();
        if let Some(prev) = guard.take() {
            prev.cancel();
        }
        *guard = Some(token.clone());
        token
    }

    /// Runs proactive replication to completion or cancellation. Used
    /// both by the detached background path (`spawn_proactive_replication_if_idle`)
    /// and, when `InlineProactiveReplication` is set, awaited directly
    /// from the heartbeat body.
    pub(super) async fn run_proactive_replication(&self, token: CancellationToken) -> Result<ReplicationOutcome> {
        let Some(copier) = self.replication_copier.as_ref() else {
            return Ok(ReplicationOutcome::default());
        };

        let now_secs = now_unix(SystemTime::now());
        let by_last_access = self.local_store.last_access_order().await?;
        let candidates: Vec<EvictionCandidate> = by_last_access
            .into_iter()
            .map(|(hash, local_last_access)| EvictionCandidate {
                hash,
                local_last_access,
            })
            .collect();

        let params = EvictionParams {
            pool_size: self.config.eviction_pool_size,
            window_size: self.config.eviction_window_size,
            removal_fraction: self.config.eviction_removal_fraction,
            discard_fraction: self.config.eviction_discard_fraction,
            min_age_secs: 0,
            content_lifetime: self.config.content_lifetime,
            machine_risk: self.config.machine_risk,
        };
        // Newest-evictable first, i.e. best replication target last
        // (§4.6): feed the same ordering stream with `reverse = true`.
        let ordered = eviction_order(&candidates, &self.db, &params, true, now_secs);

        let mut outcome = ReplicationOutcome::default();
        for hash in ordered {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if outcome.attempted >= self.config.proactive_replication_copy_limit {
                break;
            }

            let replica_count = self.db.get(&hash).map(|e| e.replica_count()).unwrap_or(0);
            if replica_count as u32 >= self.config.proactive_copy_locations_threshold {
                continue;
            }

            let target_id_and_location = self
                .db
                .get(&hash)
                .map(|e| self.resolve_bitset_with_ids(&e.locations))
                .and_then(|locs| locs.into_iter().next());
            let target_id: Option<MachineId> = target_id_and_location.as_ref().map(|(id, _)| *id);
            let target = target_id_and_location.map(|(_, location)| location);

            outcome.attempted += 1;
            Counters::incr(&self.counters.proactive_copies_attempted);
            match copier.copy(hash, target).await {
                Ok(()) => {
                    outcome.succeeded += 1;
                    if let Some(id) = target_id {
                        self.reputation.record_success(id);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = ?e, hash = ?hash, "proactive copy failed");
                    if let Some(id) = target_id {
                        self.reputation.record_failure(id);
                    }
                }
            }

            if outcome.attempted < self.config.proactive_replication_copy_limit {
                tokio::select! {
                    _ = token.cancelled() => { outcome.cancelled = true; break; }
                    _ = tokio::time::sleep(self.config.delay_for_proactive_replication) => {}
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCopier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReplicationCopier for CountingCopier {
        async fn copy(&self, _hash: ContentHash, _target: Option<MachineLocation>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn outcome_defaults_to_zero() {
        let outcome = ReplicationOutcome::default();
        assert_eq!(outcome.attempted, 0);
        assert_eq!(outcome.succeeded, 0);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn counting_copier_records_every_call() {
        let copier = CountingCopier {
            calls: AtomicUsize::new(0),
        };
        copier.copy(ContentHash::from_bytes(&[1u8; 32]).unwrap(), None).await.unwrap();
        copier.copy(ContentHash::from_bytes(&[2u8; 32]).unwrap(), None).await.unwrap();
        assert_eq!(copier.calls.load(Ordering::SeqCst), 2);
    }
}

/// End-to-end coverage for `run_proactive_replication` itself, driving a
/// real `LocalLocationStore` against minimal in-memory stand-ins rather
/// than calling a mock copier directly.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use parking_lot::Mutex as SyncMutex;

    use crate::central_storage::LocalDiskCentralStorage;
    use crate::content_db::UnixSeconds;
    use crate::error::{Error as LlsError, ErrorKind};
    use crate::event_store::{MemoryEventStore, SequencePoint};
    use crate::global_store::{CheckpointState, ClusterMachineRecord, GlobalLocationEntry, GlobalStoreClient, Role};
    use crate::local_store::{LocalContentStore, LocalInventoryEntry};
    use crate::LlsConfig;

    fn hash(b: u8) -> ContentHash {
        let mut raw = [0u8; ContentHash::LENGTH];
        raw[0] = b;
        ContentHash::from_bytes(&raw).unwrap()
    }

    fn unique_dir(label: &str) -> std::path::PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        std::env::temp_dir().join(format!("lls-replication-test-{}-{}-{}", std::process::id(), label, n))
    }

    /// Always Master, with a fixed cluster directory, so `start` needs
    /// no background role negotiation to become write-ready.
    struct FixedMasterGlobalStore {
        records: Vec<ClusterMachineRecord>,
    }

    #[async_trait]
    impl crate::central_storage::BlobClient for FixedMasterGlobalStore {
        async fn put_blob(&self, _key: &str, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn get_blob(&self, _key: &str) -> Result<Vec<u8>> {
            Err(LlsError::simple(ErrorKind::TransientRemote))
        }
    }

    #[async_trait]
    impl GlobalStoreClient for FixedMasterGlobalStore {
        async fn get_checkpoint_state(&self) -> Result<CheckpointState> {
            Ok(CheckpointState {
                role: Role::Master,
                start_sequence_point: SequencePoint::ZERO,
                checkpoint_id: None,
                checkpoint_available: false,
            })
        }
        async fn release_role_if_necessary(&self) -> Result<Role> {
            Ok(Role::Master)
        }
        async fn update_cluster_state(&self, _records: &[ClusterMachineRecord]) -> Result<()> {
            Ok(())
        }
        async fn fetch_cluster_state(&self) -> Result<Vec<ClusterMachineRecord>> {
            Ok(self.records.clone())
        }
        async fn register_local_location(&self, _hashes_with_size: &[(ContentHash, u64)]) -> Result<()> {
            Ok(())
        }
        async fn get_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<GlobalLocationEntry>> {
            Ok(hashes
                .iter()
                .map(|h| GlobalLocationEntry {
                    hash: *h,
                    size: 0,
                    locations: Vec::new(),
                })
                .collect())
        }
        async fn invalidate_local_machine(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedLocalStore {
        entries: Vec<(ContentHash, UnixSeconds)>,
    }

    #[async_trait]
    impl LocalContentStore for FixedLocalStore {
        async fn full_inventory(&self) -> Result<Vec<LocalInventoryEntry>> {
            Ok(Vec::new())
        }
        async fn last_access_order(&self) -> Result<Vec<(ContentHash, UnixSeconds)>> {
            Ok(self.entries.clone())
        }
    }

    struct RecordingCopier {
        calls: SyncMutex<Vec<ContentHash>>,
        fail: Vec<ContentHash>,
    }

    #[async_trait]
    impl ReplicationCopier for RecordingCopier {
        async fn copy(&self, hash: ContentHash, _target: Option<MachineLocation>) -> Result<()> {
            self.calls.lock().push(hash);
            if self.fail.contains(&hash) {
                Err(LlsError::simple(ErrorKind::TransientRemote))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> LlsConfig {
        let mut cfg = LlsConfig::default();
        cfg.inline_post_initialization = true;
        cfg.heartbeat_interval = Duration::from_secs(3600);
        cfg.enable_reconciliation = false;
        cfg.enable_proactive_replication = false;
        cfg.eviction_pool_size = 100;
        cfg.eviction_window_size = 10;
        cfg
    }

    async fn start_store(
        label: &str,
        config: LlsConfig,
        records: Vec<ClusterMachineRecord>,
        local_entries: Vec<(ContentHash, UnixSeconds)>,
        copier: Arc<dyn ReplicationCopier>,
    ) -> Arc<LocalLocationStore> {
        let dir = unique_dir(label);
        let global = Arc::new(FixedMasterGlobalStore { records });
        let local_store = Arc::new(FixedLocalStore { entries: local_entries });
        let event_store = Arc::new(MemoryEventStore::new(MachineId(1)));
        let central = Arc::new(LocalDiskCentralStorage::new(dir.clone()));
        LocalLocationStore::start(
            MachineId(1),
            config,
            "replication-test".to_string(),
            dir,
            global,
            local_store,
            event_store,
            central,
            Some(copier),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn skips_candidates_at_or_above_the_replica_threshold() {
        let mut cfg = test_config();
        cfg.proactive_copy_locations_threshold = 3;
        cfg.proactive_replication_copy_limit = 10;

        let below = hash(1);
        let above = hash(2);
        let also_below = hash(3);

        let copier = Arc::new(RecordingCopier {
            calls: SyncMutex::new(Vec::new()),
            fail: Vec::new(),
        });
        let store = start_store(
            "threshold",
            cfg,
            Vec::new(),
            vec![(below, 100), (above, 200), (also_below, 300)],
            copier.clone(),
        )
        .await;

        store.db.apply_add(MachineId(2), &[(below, 10)], 100).unwrap();
        for id in 2..=6u32 {
            store.db.apply_add(MachineId(id), &[(above, 10)], 200).unwrap();
        }
        store.db.apply_add(MachineId(2), &[(also_below, 10)], 300).unwrap();

        let outcome = store
            .run_proactive_replication(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.succeeded, 2);
        let calls = copier.calls.lock();
        assert!(calls.contains(&below));
        assert!(calls.contains(&also_below));
        assert!(!calls.contains(&above));
    }

    #[tokio::test]
    async fn stops_after_the_copy_limit_is_reached() {
        let mut cfg = test_config();
        cfg.proactive_copy_locations_threshold = 100;
        cfg.proactive_replication_copy_limit = 1;

        let h1 = hash(1);
        let h2 = hash(2);

        let copier = Arc::new(RecordingCopier {
            calls: SyncMutex::new(Vec::new()),
            fail: Vec::new(),
        });
        let store = start_store("cap", cfg, Vec::new(), vec![(h1, 100), (h2, 200)], copier.clone()).await;

        let outcome = store
            .run_proactive_replication(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 1);
        assert_eq!(copier.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn a_pre_cancelled_token_stops_before_any_copy() {
        let mut cfg = test_config();
        cfg.proactive_copy_locations_threshold = 100;

        let h1 = hash(1);
        let copier = Arc::new(RecordingCopier {
            calls: SyncMutex::new(Vec::new()),
            fail: Vec::new(),
        });
        let store = start_store("cancel", cfg, Vec::new(), vec![(h1, 100)], copier.clone()).await;

        let token = CancellationToken::new();
        token.cancel();
        let outcome = store.run_proactive_replication(token).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempted, 0);
        assert!(copier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn copy_outcomes_update_reputation_for_the_resolved_target() {
        let mut cfg = test_config();
        cfg.proactive_copy_locations_threshold = 100;

        let success_hash = hash(1);
        let failure_hash = hash(2);

        let copier = Arc::new(RecordingCopier {
            calls: SyncMutex::new(Vec::new()),
            fail: vec![failure_hash],
        });
        let store = start_store(
            "reputation",
            cfg,
            vec![
                ClusterMachineRecord {
                    machine_id: MachineId(2),
                    location: MachineLocation::new("peer-a"),
                    active: true,
                },
                ClusterMachineRecord {
                    machine_id: MachineId(3),
                    location: MachineLocation::new("peer-b"),
                    active: true,
                },
            ],
            vec![(success_hash, 100), (failure_hash, 200)],
            copier,
        )
        .await;

        store.db.apply_add(MachineId(2), &[(success_hash, 10)], 100).unwrap();
        store.db.apply_add(MachineId(3), &[(failure_hash, 10)], 200).unwrap();

        let before_success = store.reputation.score(MachineId(2));
        let before_failure = store.reputation.score(MachineId(3));

        store
            .run_proactive_replication(CancellationToken::new())
            .await
            .unwrap();

        assert!(store.reputation.score(MachineId(2)) > before_success);
        assert!(store.reputation.score(MachineId(3)) < before_failure);
    }
}
