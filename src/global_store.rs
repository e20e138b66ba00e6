//! Component G: thin contract to the authoritative location directory
//! and role-lease service.
//!
//! Every RPC named in §6 ("Global Store RPCs consumed") is represented
//! here as a trait method; the concrete wire client is an external
//! collaborator this crate never constructs.

use async_trait::async_trait;

use crate::central_storage::BlobClient;
use crate::error::Result;
use crate::event_store::SequencePoint;
use crate::hash::ContentHash;
use crate::machine::{MachineId, MachineLocation};

/// A node's role in the replication protocol.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Unknown,
    Worker,
    Master,
}

/// Response to `get_checkpoint_state`.
#[derive(Clone, Debug)]
pub struct CheckpointState {
    pub role: Role,
    pub start_sequence_point: SequencePoint,
    pub checkpoint_id: Option<String>,
    pub checkpoint_available: bool,
}

/// A single machine's membership record, as known to the global store.
#[derive(Clone, Debug)]
pub struct ClusterMachineRecord {
    pub machine_id: MachineId,
    pub location: MachineLocation,
    pub active: bool,
}

/// Result of resolving a hash against the global store's directory.
#[derive(Clone, Debug)]
pub struct GlobalLocationEntry {
    pub hash: ContentHash,
    pub size: u64,
    pub locations: Vec<MachineId>,
}

/// Thin contract to the authoritative location directory and
/// role-lease service (component G).
#[async_trait]
pub trait GlobalStoreClient: BlobClient {
    /// Queries the lease service for this node's role, along with the
    /// event-stream sequence point it should start producing from and
    /// the latest checkpoint known to be available.
    async fn get_checkpoint_state(&self) -> Result<CheckpointState>;

    /// Releases this node's role lease if it is no longer entitled to
    /// hold it, returning the role it should adopt instead.
    async fn release_role_if_necessary(&self) -> Result<Role>;

    /// Pushes this node's view of cluster membership to the global
    /// store (only meaningful when this node is Master).
    async fn update_cluster_state(&self, records: &[ClusterMachineRecord]) -> Result<()>;

    /// Fetches the global store's view of cluster membership, used to
    /// refresh local Cluster State (component B).
    async fn fetch_cluster_state(&self) -> Result<Vec<ClusterMachineRecord>>;

    /// Eagerly registers this machine as holding the given hashes.
    async fn register_local_location(&self, hashes_with_size: &[(ContentHash, u64)]) -> Result<()>;

    /// Resolves hashes against the authoritative directory.
    async fn get_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<GlobalLocationEntry>>;

    /// Drops every registration this machine has made, used by
    /// `invalidate_local_machine` (component I).
    async fn invalidate_local_machine(&self) -> Result<()>;
}
