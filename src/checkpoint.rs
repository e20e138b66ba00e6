//! Checkpoint Manager: creates and restores snapshots of the content
//! location database, and owns the on-disk reconciliation freshness
//! marker that lives alongside checkpoint artifacts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;

use crate::central_storage::{CentralStorage, CheckpointManifest};
use crate::content_db::{ContentLocationDatabase, UnixSeconds};
use crate::error::{ErrorKind, Result, ResultWrappedExt};
use crate::event_store::SequencePoint;

const MARKER_FILE_NAME: &str = "reconcileMarker.txt";

/// Creates and restores checkpoints of component C, and reads/writes
/// the reconciliation freshness marker in the same working directory.
pub struct CheckpointManager<S: ?Sized> {
    storage: Arc<S>,
    working_dir: PathBuf,
}

impl<S: CentralStorage + ?Sized> CheckpointManager<S> {
    pub fn new(storage: Arc<S>, working_dir: PathBuf) -> Self {
        Self { storage, working_dir }
    }

    pub async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>> {
        self.storage.latest_manifest().await
    }

    /// Snapshots `db` and the given sequence point, and publishes both
    /// to central storage under a fresh checkpoint id.
    pub async fn create(
        &self,
        db: &ContentLocationDatabase,
        sequence_point: SequencePoint,
        now: UnixSeconds,
    ) -> Result<CheckpointManifest> {
        let snapshot = db.snapshot();
        let bytes = bincode::serialize(&snapshot).wrapped(ErrorKind::Corruption)?;
        let manifest = CheckpointManifest {
            checkpoint_id: format!("ckpt-{}-{}", now, sequence_point.0),
            checkpoint_time: now,
            sequence_point,
        };
        self.storage.upload(manifest.clone(), bytes).await?;
        Ok(manifest)
    }

    /// Fetches and installs the snapshot named by `manifest` into `db`,
    /// atomically replacing its contents.
    pub async fn restore(
        &self,
        manifest: &CheckpointManifest,
        db: &ContentLocationDatabase,
    ) -> Result<()> {
        let bytes = self.storage.download(&manifest.checkpoint_id).await?;
        let snapshot = bincode::deserialize(&bytes).wrapped(ErrorKind::Corruption)?;
        db.install_snapshot(snapshot);
        Ok(())
    }

    fn marker_path(&self) -> PathBuf {
        self.working_dir.join(MARKER_FILE_NAME)
    }

    /// Reads the reconciliation marker, if present and parseable.
    /// Absence, an unparseable line, or I/O failure all mean "no
    /// marker" rather than an error: the caller treats that the same
    /// as "not up to date".
    pub async fn read_marker(&self) -> Option<(String, UnixSeconds)> {
        let contents = fs::read_to_string(self.marker_path()).await.ok()?;
        parse_marker(contents.trim())
    }

    /// Writes the marker as `"<prefix>|<timestamp>"`.
    pub async fn write_marker(&self, prefix: &str, now: UnixSeconds) -> Result<()> {
        fs::create_dir_all(&self.working_dir)
            .await
            .wrapped(ErrorKind::TransientRemote)?;
        fs::write(self.marker_path(), format!("{}|{}", prefix, now))
            .await
            .wrapped(ErrorKind::TransientRemote)
    }

    /// Removes the marker file, used when this machine's registrations
    /// are invalidated and its contribution must be re-derived from
    /// scratch on the next reconciliation.
    pub async fn clear_marker(&self) -> Result<()> {
        match fs::remove_file(self.marker_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrapped(ErrorKind::TransientRemote),
        }
    }
}

fn parse_marker(line: &str) -> Option<(String, UnixSeconds)> {
    let (prefix, timestamp) = line.rsplit_once('|')?;
    let timestamp: UnixSeconds = timestamp.parse().ok()?;
    Some((prefix.to_string(), timestamp))
}

/// True if `marker` names the currently configured prefix and is no
/// older than `freshness_window`.
pub fn marker_is_fresh(
    marker: Option<&(String, UnixSeconds)>,
    configured_prefix: &str,
    now: UnixSeconds,
    freshness_window: Duration,
) -> bool {
    match marker {
        Some((prefix, timestamp)) => {
            prefix == configured_prefix
                && now.saturating_sub(*timestamp) <= freshness_window.as_secs()
        }
        None => false,
    }
}

/// The skip-restore rule: the first restore attempted since process
/// start is skipped (treated as success, advancing `lastRestore`) if a
/// checkpoint already exists and is fresh enough.
pub fn should_skip_first_restore(
    is_first_restore: bool,
    manifest: Option<&CheckpointManifest>,
    age_threshold: Duration,
    now: UnixSeconds,
) -> bool {
    if !is_first_restore {
        return false;
    }
    match manifest {
        Some(m) => m.age(now) <= age_threshold,
        None => false,
    }
}
