//! Component E: blob store for checkpoint artifacts.
//!
//! Two concrete variants are provided behind the `CentralStorage`
//! trait, exactly as named in the component table: a local-disk
//! implementation, and a remote-blob implementation riding on the
//! global store's `put_blob`/`get_blob` RPCs (component G). A
//! `DistributedCacheFront` decorator optionally wraps either with a
//! read-through cache of the most recently observed manifest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;

use crate::error::{Error, ErrorKind, Result, ResultSimpleExt, ResultWrappedExt};
use crate::event_store::SequencePoint;

/// Identifies a checkpoint artifact in central storage.
pub type CheckpointId = String;

/// Metadata describing a checkpoint artifact, stored alongside the
/// opaque blob bytes (§6, "Checkpoint artifact in central storage").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointManifest {
    pub checkpoint_id: CheckpointId,
    pub checkpoint_time: UnixSeconds,
    pub sequence_point: SequencePoint,
}

pub type UnixSeconds = u64;

pub fn unix_now(now: SystemTime) -> UnixSeconds {
    now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl CheckpointManifest {
    /// Age of this checkpoint relative to `now`.
    pub fn age(&self, now: UnixSeconds) -> Duration {
        Duration::from_secs(now.saturating_sub(self.checkpoint_time))
    }
}

/// The narrow contract LLS's Checkpoint Manager (component F) uses to
/// persist and retrieve checkpoint artifacts.
#[async_trait]
pub trait CentralStorage: Send + Sync {
    /// The most recently published manifest, if any checkpoint has
    /// ever been created.
    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>>;

    /// Publishes a new checkpoint artifact and its manifest.
    async fn upload(&self, manifest: CheckpointManifest, bytes: Vec<u8>) -> Result<()>;

    /// Fetches the checkpoint artifact bytes for `checkpoint_id`.
    async fn download(&self, checkpoint_id: &CheckpointId) -> Result<Vec<u8>>;
}

/// Local-disk variant: checkpoints are written as files under a
/// working directory, with a single manifest file tracking the latest.
pub struct LocalDiskCentralStorage {
    working_dir: PathBuf,
}

impl LocalDiskCentralStorage {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    fn blob_path(&self, checkpoint_id: &str) -> PathBuf {
        self.working_dir.join(format!("checkpoint-{}.bin", checkpoint_id))
    }

    fn manifest_path(&self) -> PathBuf {
        self.working_dir.join("checkpoint-manifest.txt")
    }

    fn encode_manifest(manifest: &CheckpointManifest) -> String {
        format!(
            "{}|{}|{}",
            manifest.checkpoint_id, manifest.checkpoint_time, manifest.sequence_point.0
        )
    }

    fn decode_manifest(s: &str) -> Result<CheckpointManifest> {
        let mut parts = s.trim().splitn(3, '|');
        let checkpoint_id = parts
            .next()
            .ok_or_else(|| Error::simple(ErrorKind::Corruption))?
            .to_string();
        let checkpoint_time: UnixSeconds = parts
            .next()
            .ok_or_else(|| Error::simple(ErrorKind::Corruption))?
            .parse()
            .simple(ErrorKind::Corruption)?;
        let sequence_point: u64 = parts
            .next()
            .ok_or_else(|| Error::simple(ErrorKind::Corruption))?
            .parse()
            .simple(ErrorKind::Corruption)?;
        Ok(CheckpointManifest {
            checkpoint_id,
            checkpoint_time,
            sequence_point: SequencePoint(sequence_point),
        })
    }
}

#[async_trait]
impl CentralStorage for LocalDiskCentralStorage {
    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>> {
        match fs::read_to_string(self.manifest_path()).await {
            Ok(contents) => Ok(Some(Self::decode_manifest(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).wrapped(ErrorKind::TransientRemote),
        }
    }

    async fn upload(&self, manifest: CheckpointManifest, bytes: Vec<u8>) -> Result<()> {
        fs::create_dir_all(&self.working_dir)
            .await
            .wrapped(ErrorKind::TransientRemote)?;
        fs::write(self.blob_path(&manifest.checkpoint_id), bytes)
            .await
            .wrapped(ErrorKind::TransientRemote)?;
        fs::write(self.manifest_path(), Self::encode_manifest(&manifest))
            .await
            .wrapped(ErrorKind::TransientRemote)
    }

    async fn download(&self, checkpoint_id: &CheckpointId) -> Result<Vec<u8>> {
        fs::read(self.blob_path(checkpoint_id))
            .await
            .wrapped(ErrorKind::TransientRemote)
    }
}

/// Thin contract for the subset of the global store RPCs (component G)
/// a remote-blob `CentralStorage` rides on.
#[async_trait]
pub trait BlobClient: Send + Sync {
    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_blob(&self, key: &str) -> Result<Vec<u8>>;
}

/// Remote-blob variant: checkpoints are pushed through the global
/// store's blob RPCs rather than local disk.
pub struct RemoteBlobCentralStorage<C> {
    client: Arc<C>,
    manifest_key: String,
    latest: Mutex<Option<CheckpointManifest>>,
}

impl<C: BlobClient> RemoteBlobCentralStorage<C> {
    pub fn new(client: Arc<C>, manifest_key: impl Into<String>) -> Self {
        Self {
            client,
            manifest_key: manifest_key.into(),
            latest: Mutex::new(None),
        }
    }

    fn encode_manifest(manifest: &CheckpointManifest) -> Vec<u8> {
        LocalDiskCentralStorage::encode_manifest(manifest).into_bytes()
    }

    fn decode_manifest(bytes: &[u8]) -> Result<CheckpointManifest> {
        let s = String::from_utf8(bytes.to_vec()).simple(ErrorKind::Corruption)?;
        LocalDiskCentralStorage::decode_manifest(&s)
    }
}

#[async_trait]
impl<C: BlobClient> CentralStorage for RemoteBlobCentralStorage<C> {
    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>> {
        if let Some(cached) = self.latest.lock().clone() {
            return Ok(Some(cached));
        }
        match self.client.get_blob(&self.manifest_key).await {
            Ok(bytes) => {
                let manifest = Self::decode_manifest(&bytes)?;
                *self.latest.lock() = Some(manifest.clone());
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == ErrorKind::TransientRemote => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, manifest: CheckpointManifest, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_blob(&manifest.checkpoint_id, bytes)
            .await?;
        self.client
            .put_blob(&self.manifest_key, Self::encode_manifest(&manifest))
            .await?;
        *self.latest.lock() = Some(manifest);
        Ok(())
    }

    async fn download(&self, checkpoint_id: &CheckpointId) -> Result<Vec<u8>> {
        self.client.get_blob(checkpoint_id).await
    }
}

/// Read-through cache of the most recently observed manifest, wrapping
/// any `CentralStorage` ("optionally wrapped by a distributed-cache
/// front", §2).
pub struct DistributedCacheFront<T> {
    inner: T,
    cached: Mutex<Option<CheckpointManifest>>,
}

impl<T: CentralStorage> DistributedCacheFront<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }

    /// Invalidates the cached manifest, forcing the next read to go to
    /// the wrapped storage.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

#[async_trait]
impl<T: CentralStorage> CentralStorage for DistributedCacheFront<T> {
    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>> {
        if let Some(cached) = self.cached.lock().clone() {
            return Ok(Some(cached));
        }
        let manifest = self.inner.latest_manifest().await?;
        if let Some(m) = &manifest {
            *self.cached.lock() = Some(m.clone());
        }
        Ok(manifest)
    }

    async fn upload(&self, manifest: CheckpointManifest, bytes: Vec<u8>) -> Result<()> {
        self.inner.upload(manifest.clone(), bytes).await?;
        *self.cached.lock() = Some(manifest);
        Ok(())
    }

    async fn download(&self, checkpoint_id: &CheckpointId) -> Result<Vec<u8>> {
        self.inner.download(checkpoint_id).await
    }
}
