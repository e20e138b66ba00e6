//! Bootstraps a single-node `LocalLocationStore` against in-memory
//! stand-ins for every external collaborator (the global store, the
//! event stream transport, the local content store, and the blob
//! transfer between peers), then walks through registering, reading
//! back, and trimming a handful of hashes.
//!
//! Run with `cargo run --example bootstrap_local`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use lls::central_storage::{BlobClient, LocalDiskCentralStorage};
use lls::config::LlsConfig;
use lls::error::Result;
use lls::event_store::{MemoryEventStore, SequencePoint};
use lls::global_store::{
    CheckpointState, ClusterMachineRecord, GlobalLocationEntry, GlobalStoreClient, Role,
};
use lls::hash::ContentHash;
use lls::lls::{Origin, ReplicationCopier};
use lls::local_store::{LocalContentStore, LocalInventoryEntry};
use lls::machine::{MachineId, MachineLocation};
use lls::LocalLocationStore;

/// Single-node "global store": this process is always Master, and the
/// directory lives in a plain mutex-guarded map rather than over the
/// network.
struct InMemoryGlobalStore {
    directory: Mutex<HashMap<ContentHash, GlobalLocationEntry>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryGlobalStore {
    fn new() -> Self {
        Self {
            directory: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BlobClient for InMemoryGlobalStore {
    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| lls::error::Error::simple(lls::error::ErrorKind::TransientRemote))
    }
}

#[async_trait]
impl GlobalStoreClient for InMemoryGlobalStore {
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
        Ok(vec![ClusterMachineRecord {
            machine_id: MachineId(1),
            location: MachineLocation::new("127.0.0.1:9000"),
            active: true,
        }])
    }

    async fn register_local_location(&self, hashes_with_size: &[(ContentHash, u64)]) -> Result<()> {
        let mut directory = self.directory.lock();
        for &(hash, size) in hashes_with_size {
            directory
                .entry(hash)
                .or_insert_with(|| GlobalLocationEntry {
                    hash,
                    size,
                    locations: Vec::new(),
                })
                .locations
                .push(MachineId(1));
        }
        Ok(())
    }

    async fn get_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<GlobalLocationEntry>> {
        let directory = self.directory.lock();
        Ok(hashes
            .iter()
            .map(|h| {
                directory.get(h).cloned().unwrap_or(GlobalLocationEntry {
                    hash: *h,
                    size: 0,
                    locations: Vec::new(),
                })
            })
            .collect())
    }

    async fn invalidate_local_machine(&self) -> Result<()> {
        self.directory.lock().clear();
        Ok(())
    }
}

/// Local content store stand-in: just enough bookkeeping to answer the
/// two questions reconciliation and proactive replication ask.
struct StubContentStore {
    entries: Mutex<Vec<LocalInventoryEntry>>,
}

#[async_trait]
impl LocalContentStore for StubContentStore {
    async fn full_inventory(&self) -> Result<Vec<LocalInventoryEntry>> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by_key(|e| e.hash);
        Ok(entries)
    }

    async fn last_access_order(&self) -> Result<Vec<(ContentHash, u64)>> {
        Ok(self.entries.lock().iter().map(|e| (e.hash, 0)).collect())
    }
}

struct NoopReplicationCopier;

#[async_trait]
impl ReplicationCopier for NoopReplicationCopier {
    async fn copy(&self, hash: ContentHash, target: Option<MachineLocation>) -> Result<()> {
        tracing::info!(hash = ?hash, target = ?target, "would copy to peer");
        Ok(())
    }
}

fn hash(b: u8) -> ContentHash {
    let mut raw = [0u8; ContentHash::LENGTH];
    raw[0] = b;
    ContentHash::from_bytes(&raw).unwrap()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let working_dir = std::env::temp_dir().join("lls-demo-bootstrap-local");
    let _ = std::fs::remove_dir_all(&working_dir);

    let global = Arc::new(InMemoryGlobalStore::new());
    let local_store = Arc::new(StubContentStore {
        entries: Mutex::new(Vec::new()),
    });
    let event_store = Arc::new(MemoryEventStore::new(MachineId(1)));
    let central_storage = Arc::new(LocalDiskCentralStorage::new(working_dir.clone()));

    let mut config = LlsConfig::default();
    config.inline_post_initialization = true;

    let store = LocalLocationStore::start(
        MachineId(1),
        config,
        "demo".to_string(),
        working_dir,
        global,
        local_store,
        event_store,
        central_storage,
        Some(Arc::new(NoopReplicationCopier)),
    )
    .await?;

    let hashes = vec![(hash(1), 100), (hash(2), 200)];
    store.register_local_location(&hashes, false).await?;

    let resolved = store
        .get_bulk(&[hash(1), hash(2)], Origin::Local)
        .await?;
    for entry in &resolved {
        println!(
            "{:?}: size={} locations={:?}",
            entry.hash, entry.size, entry.locations
        );
    }

    store.touch_bulk(&[hash(1)]).await?;
    store.trim_bulk(&[hash(2)]).await?;

    store.shutdown().await?;
    Ok(())
}
