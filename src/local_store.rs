//! Contract to the local content-addressable store this node fronts.
//!
//! This crate never stores content bytes itself; it only tracks where
//! copies live across the cluster. The actual bytes, and the inventory
//! of what this machine currently holds, belong to an external
//! collaborator represented here as a trait.

use async_trait::async_trait;

use crate::content_db::UnixSeconds;
use crate::error::Result;
use crate::hash::ContentHash;

/// A single entry in this machine's inventory of locally held content.
///
/// `ContentHash` orders identically to its own `ShortHash` prefix (see
/// `hash::ShortHash`), so an inventory sorted by `hash` is also sorted
/// by `ShortHash`, which is all reconciliation's co-walk (§4.5) needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalInventoryEntry {
    pub hash: ContentHash,
    pub size: u64,
}

/// The narrow contract the Local Location Store needs from the content
/// store it fronts: an ordered inventory to diff during reconciliation,
/// and a last-access ordering to seed proactive replication and
/// eviction scans.
#[async_trait]
pub trait LocalContentStore: Send + Sync {
    /// This machine's full inventory, sorted ascending by hash.
    /// Reconciliation co-walks this against the database's per-machine
    /// view to find entries one side is missing.
    async fn full_inventory(&self) -> Result<Vec<LocalInventoryEntry>>;

    /// This machine's inventory in descending last-access order, paired
    /// with the local last-access timestamp for each entry. Feeds both
    /// the eviction ordering stream and proactive replication's
    /// candidate pull.
    async fn last_access_order(&self) -> Result<Vec<(ContentHash, UnixSeconds)>>;
}
