//! The Local Location Store core: startup/shutdown, the heartbeat-driven
//! role state machine, and the public register/get/trim/touch surface.
//!
//! Everything else in this crate is a leaf component `LocalLocationStore`
//! composes; this module is where ownership, timers, and the
//! eager/lazy write policy meet.

mod registration;
mod reconcile;
mod replication;

pub use registration::{decide as decide_registration, EagerReason, PolicyContext, RegistrationAction};
pub use reconcile::ReconcileOutcome;
pub use replication::{ReplicationCopier, ReplicationOutcome};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bitset::MachineBitSet;
use crate::central_storage::CentralStorage;
use crate::checkpoint::{should_skip_first_restore, CheckpointManager};
use crate::cluster_state::ClusterState;
use crate::content_db::{now_unix, ContentLocationDatabase, UnixSeconds};
use crate::error::{Error, ErrorKind, Result};
use crate::event_store::{EventContext, EventStore};
use crate::eviction::{eviction_order, EvictionCandidate, EvictionParams};
use crate::global_store::{ClusterMachineRecord, GlobalStoreClient, Role};
use crate::hash::ContentHash;
use crate::local_store::LocalContentStore;
use crate::machine::{MachineId, MachineLocation};
use crate::machine_list::{resolve_locations, resolve_locations_with_ids};
use crate::reputation::ReputationTracker;
use crate::telemetry::Counters;
use crate::volatile::VolatileSet;
use crate::LlsConfig;

/// Where a `get_bulk` lookup is served from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Origin {
    /// This machine's own materialized view (component C).
    Local,
    /// The authoritative global store (component G).
    Global,
}

/// A single resolved `get_bulk` result.
#[derive(Clone, Debug)]
pub struct ResolvedLocation {
    pub hash: ContentHash,
    pub size: u64,
    pub locations: Vec<MachineLocation>,
}

#[derive(Clone)]
enum PostInitState {
    Pending,
    Succeeded,
    Failed(String),
}

struct CoreState {
    current_role: Role,
    last_restore: Option<Instant>,
    last_checkpoint: Option<Instant>,
    last_checkpoint_id: Option<String>,
    first_restore_done: bool,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            current_role: Role::Unknown,
            last_restore: None,
            last_checkpoint: None,
            last_checkpoint_id: None,
            first_restore_done: false,
        }
    }
}

/// The per-node coordinator composing every other component in this
/// crate. Constructed once per process via `LocalLocationStore::start`.
pub struct LocalLocationStore {
    local_machine_id: MachineId,
    config: LlsConfig,
    checkpoint_prefix: String,

    db: Arc<ContentLocationDatabase>,
    cluster: Arc<ClusterState>,
    reputation: Arc<ReputationTracker>,
    volatile_added: VolatileSet,
    volatile_removed: VolatileSet,
    volatile_touched: VolatileSet,
    checkpoints: CheckpointManager<dyn CentralStorage>,

    global: Arc<dyn GlobalStoreClient>,
    local_store: Arc<dyn LocalContentStore>,
    event_store: Arc<dyn EventStore>,
    replication_copier: Option<Arc<dyn ReplicationCopier>>,

    counters: Counters,
    state: Mutex<CoreState>,
    heartbeat_gate: AtomicBool,
    invalidation_gate: AtomicBool,
    proactive_token: Mutex<Option<CancellationToken>>,

    post_init_tx: watch::Sender<PostInitState>,
    post_init_rx: watch::Receiver<PostInitState>,
    shutdown: CancellationToken,
    self_weak: Weak<Self>,
}

impl LocalLocationStore {
    /// Core startup (§5 "Initialization"): validates configuration,
    /// constructs every leaf component, and schedules the heartbeat
    /// timer. Post-initialization (the first heartbeat) runs inline if
    /// `InlinePostInitialization` is set, otherwise in the background;
    /// either way the returned handle is immediately usable, with
    /// public methods awaiting post-init completion before proceeding.
    pub async fn start(
        local_machine_id: MachineId,
        config: LlsConfig,
        checkpoint_prefix: String,
        working_dir: PathBuf,
        global: Arc<dyn GlobalStoreClient>,
        local_store: Arc<dyn LocalContentStore>,
        event_store: Arc<dyn EventStore>,
        central_storage: Arc<dyn CentralStorage>,
        replication_copier: Option<Arc<dyn ReplicationCopier>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (post_init_tx, post_init_rx) = watch::channel(PostInitState::Pending);
        let volatile_ttl = config.touch_frequency;

        // `new_cyclic` hands back a `Weak` that resolves once the `Arc`
        // is constructed, so background tasks spawned off a `&self`
        // method (proactive replication) can upgrade to an owned handle
        // without threading an `Arc<Self>` through every call site.
        let this = Arc::new_cyclic(|weak| Self {
            local_machine_id,
            checkpoint_prefix,
            db: Arc::new(ContentLocationDatabase::new()),
            cluster: Arc::new(ClusterState::new()),
            reputation: Arc::new(ReputationTracker::default()),
            volatile_added: VolatileSet::new(volatile_ttl),
            volatile_removed: VolatileSet::new(volatile_ttl),
            volatile_touched: VolatileSet::new(volatile_ttl),
            checkpoints: CheckpointManager::new(central_storage, working_dir),
            global,
            local_store,
            event_store,
            replication_copier,
            counters: Counters::new(),
            state: Mutex::new(CoreState::default()),
            heartbeat_gate: AtomicBool::new(false),
            invalidation_gate: AtomicBool::new(false),
            proactive_token: Mutex::new(None),
            post_init_tx,
            post_init_rx,
            shutdown: CancellationToken::new(),
            self_weak: weak.clone(),
            config,
        });

        if this.config.inline_post_initialization {
            let result = this.heartbeat(false).await;
            this.resolve_post_init(&result);
            result?;
        } else {
            let post_init_runner = Arc::clone(&this);
            tokio::spawn(async move {
                let result = post_init_runner.heartbeat(false).await;
                post_init_runner.resolve_post_init(&result);
            });
        }

        let loop_runner = Arc::clone(&this);
        tokio::spawn(async move { loop_runner.heartbeat_loop().await });

        Ok(this)
    }

    fn self_handle(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    /// Non-blocking observability hook: reports whether
    /// post-initialization has resolved (to either outcome) without
    /// awaiting it.
    pub fn is_post_init_complete(&self) -> bool {
        !matches!(*self.post_init_rx.borrow(), PostInitState::Pending)
    }

    /// Tears down this node's background activity and, per §7's
    /// shutdown policy, D, C, G, and E in that order — C, G, and E are
    /// in-process leaf components this crate owns outright (no network
    /// teardown needed; E's `CentralStorage` has no open handle to
    /// close), so only D's suspension requires an explicit call. Awaits
    /// any pending post-initialization and in-flight heartbeat first
    /// (via the heartbeat gate), then surfaces D's failure, if any.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let _ = self.await_post_init().await;
        while self.heartbeat_gate.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        self.event_store.suspend_processing().await
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; skip it, post-init already ran one
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = self.heartbeat(false).await;
                    self.resolve_post_init(&result);
                }
            }
        }
    }

    fn resolve_post_init(&self, result: &Result<()>) {
        let still_pending = matches!(*self.post_init_tx.borrow(), PostInitState::Pending);
        match result {
            Ok(()) => {
                let _ = self.post_init_tx.send(PostInitState::Succeeded);
            }
            Err(e) if still_pending => {
                let _ = self.post_init_tx.send(PostInitState::Failed(e.to_string()));
            }
            Err(_) => {
                // post-init already resolved (possibly to Succeeded by an
                // earlier heartbeat); background heartbeat failures never
                // surface to callers past that point (§7 policy).
            }
        }
    }

    /// Awaited by every public operation before proceeding (§5).
    async fn await_post_init(&self) -> Result<()> {
        let mut rx = self.post_init_rx.clone();
        loop {
            match &*rx.borrow() {
                PostInitState::Succeeded => return Ok(()),
                PostInitState::Failed(msg) => {
                    return Err(Error::message(ErrorKind::TransientRemote, msg.clone()))
                }
                PostInitState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::simple(ErrorKind::Cancelled));
            }
        }
    }

    /// Runs the heartbeat body, gated so reentrant/concurrent fires are
    /// dropped rather than queued (§4.3, §5).
    pub async fn heartbeat(&self, force_restore: bool) -> Result<()> {
        if self
            .heartbeat_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.heartbeat_body(force_restore).await;
        self.heartbeat_gate.store(false, Ordering::SeqCst);
        Counters::incr(&self.counters.heartbeats);
        if let Err(e) = &result {
            tracing::warn!(error = ?e, "heartbeat cycle failed, retrying next interval");
        }
        result
    }

    /// Forces a restore on the next heartbeat, deduplicating concurrent
    /// callers behind a second non-blocking gate (§4.3, DB corruption
    /// callback).
    pub async fn force_restore_on_corruption(&self) -> Result<()> {
        if self
            .invalidation_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.heartbeat_body(true).await;
        self.invalidation_gate.store(false, Ordering::SeqCst);
        result
    }

    async fn heartbeat_body(&self, force_restore: bool) -> Result<()> {
        let now = Instant::now();
        let now_secs = now_unix(SystemTime::now());

        // 1. query G for role + checkpoint availability.
        let checkpoint_state = self.global.get_checkpoint_state().await?;

        // 2. compare roles.
        let prev_role = self.state.lock().current_role;
        let role_switched = prev_role != checkpoint_state.role;
        if role_switched {
            self.db.set_writeable(checkpoint_state.role == Role::Master);
        }

        // 3. decide shouldRestore.
        let (last_restore, first_restore_done) = {
            let s = self.state.lock();
            (s.last_restore, s.first_restore_done)
        };
        let periodic_restore_due = match last_restore {
            Some(t) => now.saturating_duration_since(t) >= self.config.restore_checkpoint_interval,
            None => true,
        };
        let should_restore = role_switched
            || (checkpoint_state.role == Role::Worker && periodic_restore_due)
            || force_restore;

        // 4. restore, if due.
        let mut restored = false;
        if should_restore {
            restored = self
                .perform_restore(checkpoint_state.checkpoint_id.as_deref(), !first_restore_done, now_secs)
                .await?;
            let mut s = self.state.lock();
            s.last_restore = Some(now);
            s.first_restore_done = true;
        }

        // 5. refresh Cluster State.
        self.refresh_cluster_state(checkpoint_state.role == Role::Master, now)
            .await?;

        // 6. start/suspend D.
        if checkpoint_state.role == Role::Master {
            self.event_store
                .start_processing(checkpoint_state.start_sequence_point)
                .await?;
        } else {
            self.event_store.suspend_processing().await?;
        }

        // 7. checkpoint creation.
        if checkpoint_state.role == Role::Master {
            let last_checkpoint = self.state.lock().last_checkpoint;
            let due = match last_checkpoint {
                Some(t) => now.saturating_duration_since(t) >= self.config.create_checkpoint_interval,
                None => true,
            };
            if due {
                if let Some(seq) = self.event_store.last_processed_sequence_point().await? {
                    let manifest = self.checkpoints.create(&self.db, seq, now_secs).await?;
                    let mut s = self.state.lock();
                    s.last_checkpoint = Some(now);
                    s.last_checkpoint_id = Some(manifest.checkpoint_id);
                    Counters::incr(&self.counters.checkpoints_created);
                }
            }
        }

        // TTL-based compaction sweep: drop entries that have aged past
        // their expiry with no remaining replicas, same cadence as the
        // rest of the heartbeat body.
        let compacted = self.db.compact_expired(self.config.location_entry_expiry, now_secs);
        if compacted > 0 {
            Counters::add(&self.counters.expired_entries_compacted, compacted as u64);
        }

        // 8. set CurrentRole; the heartbeat timer reschedule is the
        // caller loop's job.
        self.state.lock().current_role = checkpoint_state.role;

        if restored {
            if self.config.enable_reconciliation {
                if let Err(e) = self.reconcile().await {
                    tracing::warn!(error = ?e, "reconciliation failed, retrying next heartbeat");
                }
            }
            if self.config.enable_proactive_replication {
                if self.config.inline_proactive_replication {
                    let token = CancellationToken::new();
                    if let Err(e) = self.run_proactive_replication(token).await {
                        tracing::warn!(error = ?e, "proactive replication failed, retrying next heartbeat");
                    }
                } else {
                    self.spawn_proactive_replication_if_idle();
                }
            }
        }

        Ok(())
    }

    /// Implements §4.4's restore rules 1-4. Returns whether a snapshot
    /// was actually installed (rule 5's trigger for reconciliation).
    async fn perform_restore(
        &self,
        state_checkpoint_id: Option<&str>,
        is_first_restore: bool,
        now_secs: UnixSeconds,
    ) -> Result<bool> {
        let manifest = self.checkpoints.latest_manifest().await?;

        if should_skip_first_restore(
            is_first_restore,
            manifest.as_ref(),
            self.config.restore_checkpoint_age_threshold,
            now_secs,
        ) {
            Counters::incr(&self.counters.restores_skipped);
            return Ok(false);
        }

        let last_checkpoint_id = self.state.lock().last_checkpoint_id.clone();
        if let (Some(incoming), Some(last)) = (state_checkpoint_id, last_checkpoint_id.as_deref()) {
            if incoming == last {
                Counters::incr(&self.counters.restores_skipped);
                return Ok(false);
            }
        }

        let manifest = match manifest {
            Some(m) => m,
            None => return Ok(false),
        };

        self.checkpoints.restore(&manifest, &self.db).await?;
        self.state.lock().last_checkpoint_id = Some(manifest.checkpoint_id);
        Counters::incr(&self.counters.restores);
        Ok(true)
    }

    async fn refresh_cluster_state(&self, is_master: bool, now: Instant) -> Result<()> {
        let records = self.global.fetch_cluster_state().await?;
        for record in &records {
            self.cluster
                .upsert(record.machine_id, record.location.clone(), record.active, now);
        }
        if is_master {
            self.global.update_cluster_state(&records).await?;
        }
        Ok(())
    }

    fn resolve_bitset(&self, locations: &MachineBitSet) -> Vec<MachineLocation> {
        resolve_locations(locations, &self.cluster, &self.reputation)
    }

    /// Same as `resolve_bitset`, but keeps each location's `MachineId`
    /// alongside it for callers (proactive replication) that need to
    /// attribute a later outcome to the specific machine chosen.
    pub(super) fn resolve_bitset_with_ids(&self, locations: &MachineBitSet) -> Vec<(MachineId, MachineLocation)> {
        resolve_locations_with_ids(locations, &self.cluster, &self.reputation)
    }

    fn resolve_ids(&self, ids: &[MachineId]) -> Vec<MachineLocation> {
        let mut bits = MachineBitSet::new();
        for &id in ids {
            bits.set(id);
        }
        self.resolve_bitset(&bits)
    }

    /// `get_bulk` (§4.1): reads from the local DB or the global store
    /// depending on `origin`, preserving input order.
    pub async fn get_bulk(&self, hashes: &[ContentHash], origin: Origin) -> Result<Vec<ResolvedLocation>> {
        self.await_post_init().await?;
        match origin {
            Origin::Local => self.get_bulk_local(hashes).await,
            Origin::Global => self.get_bulk_global(hashes).await,
        }
    }

    async fn get_bulk_local(&self, hashes: &[ContentHash]) -> Result<Vec<ResolvedLocation>> {
        let now = Instant::now();
        let now_secs = now_unix(SystemTime::now());
        let entries = self.db.get_bulk(hashes);

        let mut out = Vec::with_capacity(hashes.len());
        let mut to_touch = Vec::new();
        for (hash, entry) in hashes.iter().zip(entries) {
            match entry {
                Some(e) => {
                    let stale = now_secs.saturating_sub(e.last_access_utc) >= self.config.touch_frequency.as_secs();
                    if stale && !self.volatile_touched.contains(hash, now) {
                        to_touch.push(*hash);
                        self.volatile_touched.add(*hash, now);
                    }
                    out.push(ResolvedLocation {
                        hash: *hash,
                        size: e.size,
                        locations: self.resolve_bitset(&e.locations),
                    });
                }
                None => out.push(ResolvedLocation {
                    hash: *hash,
                    size: 0,
                    locations: Vec::new(),
                }),
            }
        }

        if !to_touch.is_empty() {
            self.event_store
                .touch(EventContext, self.local_machine_id, &to_touch, now_secs)
                .await?;
        }
        Ok(out)
    }

    async fn get_bulk_global(&self, hashes: &[ContentHash]) -> Result<Vec<ResolvedLocation>> {
        let entries = self.global.get_bulk(hashes).await?;

        let any_unresolved = entries
            .iter()
            .any(|e| !self.cluster.all_resolvable(e.locations.iter().copied()));
        if any_unresolved {
            self.refresh_cluster_state(false, Instant::now()).await?;
        }

        Ok(entries
            .into_iter()
            .map(|e| ResolvedLocation {
                hash: e.hash,
                size: e.size,
                locations: self.resolve_ids(&e.locations),
            })
            .collect())
    }

    /// `register_local_location` (§4.1, §4.2).
    pub async fn register_local_location(&self, hashes_with_size: &[(ContentHash, u64)], touch: bool) -> Result<()> {
        self.await_post_init().await?;
        let now = Instant::now();
        let now_secs = now_unix(SystemTime::now());
        let last_inactive = self.cluster.last_inactive_time();

        let mut eager = Vec::new();
        let mut lazy = Vec::new();
        let mut touch_only = Vec::new();

        for &(hash, size) in hashes_with_size {
            let entry = self.db.get(&hash);
            let ctx = PolicyContext {
                now,
                now_unix: now_secs,
                skip_redundant_add: self.config.skip_redundant_content_location_add,
                last_inactive_time: last_inactive,
                recent_inactive_window: self.config.recent_inactive_window(),
                touch_frequency: self.config.touch_frequency,
                safe_lazy_threshold: self.config.safe_to_lazily_update_machine_count_threshold,
                local_machine_id: self.local_machine_id,
                is_recently_removed: &|at| self.volatile_removed.contains(&hash, at),
                is_recently_added: &|at| self.volatile_added.contains(&hash, at),
            };
            match registration::decide(&ctx, entry.as_ref()) {
                RegistrationAction::Skip => {}
                RegistrationAction::LazyTouchEventOnly => touch_only.push(hash),
                RegistrationAction::LazyEventOnly => lazy.push((hash, size)),
                RegistrationAction::EagerGlobal(_) => eager.push((hash, size)),
            }
        }

        if !eager.is_empty() {
            self.global.register_local_location(&eager).await?;
            Counters::add(&self.counters.eager_writes, eager.len() as u64);
        }

        let mut add_batch = eager.clone();
        add_batch.extend(lazy.iter().copied());
        if !add_batch.is_empty() {
            self.event_store
                .add_locations(EventContext, self.local_machine_id, &add_batch, touch)
                .await?;
            for (hash, _) in &add_batch {
                self.volatile_added.add(*hash, now);
                self.volatile_removed.invalidate(hash);
            }
            Counters::add(&self.counters.events_emitted, add_batch.len() as u64);
        }

        if !touch_only.is_empty() {
            self.event_store
                .touch(EventContext, self.local_machine_id, &touch_only, now_secs)
                .await?;
        }

        Ok(())
    }

    /// `touch_bulk` (§4.1): coalesces touches, filtering hashes that
    /// are recently added/touched or whose DB entry is already fresh.
    pub async fn touch_bulk(&self, hashes: &[ContentHash]) -> Result<()> {
        self.await_post_init().await?;
        let now = Instant::now();
        let now_secs = now_unix(SystemTime::now());

        let mut to_touch = Vec::new();
        for &hash in hashes {
            if self.volatile_added.contains(&hash, now) || self.volatile_touched.contains(&hash, now) {
                continue;
            }
            if let Some(entry) = self.db.get(&hash) {
                if now_secs.saturating_sub(entry.last_access_utc) < self.config.touch_frequency.as_secs() {
                    continue;
                }
            }
            to_touch.push(hash);
        }

        if !to_touch.is_empty() {
            self.event_store
                .touch(EventContext, self.local_machine_id, &to_touch, now_secs)
                .await?;
            for hash in &to_touch {
                self.volatile_touched.add(*hash, now);
            }
        }
        Ok(())
    }

    /// `trim_bulk` (§4.1).
    pub async fn trim_bulk(&self, hashes: &[ContentHash]) -> Result<()> {
        self.await_post_init().await?;
        let now = Instant::now();
        for &hash in hashes {
            self.volatile_added.invalidate(&hash);
            self.volatile_removed.add(hash, now);
        }
        self.event_store
            .remove_locations(EventContext, self.local_machine_id, hashes)
            .await?;
        Counters::add(&self.counters.events_emitted, hashes.len() as u64);
        Ok(())
    }

    /// `get_hashes_in_eviction_order` (§4.1, §4.7).
    pub fn get_hashes_in_eviction_order(&self, candidates: &[EvictionCandidate], reverse: bool) -> Vec<ContentHash> {
        let now_secs = now_unix(SystemTime::now());
        let params = EvictionParams {
            pool_size: self.config.eviction_pool_size,
            window_size: self.config.eviction_window_size,
            removal_fraction: self.config.eviction_removal_fraction,
            discard_fraction: self.config.eviction_discard_fraction,
            min_age_secs: self.config.eviction_min_age.as_secs(),
            content_lifetime: self.config.content_lifetime,
            machine_risk: self.config.machine_risk,
        };
        let order = eviction_order(candidates, &self.db, &params, reverse, now_secs);
        Counters::add(&self.counters.eviction_candidates_emitted, order.len() as u64);
        order
    }

    /// `invalidate_local_machine` (§4.1): clears the on-disk
    /// reconciliation marker and drops this machine's registrations at
    /// the global store.
    pub async fn invalidate_local_machine(&self) -> Result<()> {
        self.await_post_init().await?;
        self.checkpoints.clear_marker().await?;
        self.global.invalidate_local_machine().await
    }
}
