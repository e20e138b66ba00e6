//! Component D: the ordered, append-only event stream, seen from the
//! LLS side as the narrow contract in §4.8.
//!
//! The wire transport for this stream is an external collaborator
//! (§1); this module defines the `EventStore` trait LLS drives, the
//! adapter that applies consumed events into the content location
//! database (component C), and an in-memory implementation used both
//! by tests and as the "temporary, separate event-store instance"
//! reconciliation opens to guarantee its batch lands before any
//! subsequent event from the same node (§4.5 step 5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cluster_state::ClusterState;
use crate::content_db::{ContentLocationDatabase, UnixSeconds};
use crate::error::{Error, ErrorKind, Result};
use crate::hash::ContentHash;
use crate::machine::MachineId;

/// Opaque, totally ordered cursor into the event stream.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequencePoint(pub u64);

impl SequencePoint {
    pub const ZERO: SequencePoint = SequencePoint(0);

    pub fn next(self) -> SequencePoint {
        SequencePoint(self.0 + 1)
    }
}

/// A caller-supplied context threaded through event emission; kept
/// opaque here since its shape (trace ids, deadlines) is a transport
/// concern.
#[derive(Default, Clone, Copy)]
pub struct EventContext;

/// An event as observed by the consuming side, after it flows off the
/// wire. Every incoming event marks its sender active in cluster
/// state (§4.8).
#[derive(Clone)]
pub enum IncomingEvent {
    LocationAdded {
        from: MachineId,
        hashes_with_size: Vec<(ContentHash, u64)>,
    },
    LocationRemoved {
        from: MachineId,
        hashes: Vec<ContentHash>,
    },
    ContentTouched {
        from: MachineId,
        hashes: Vec<ContentHash>,
        now: UnixSeconds,
    },
}

/// Releases a `pause_sending` scope on drop, guaranteeing release on
/// every exit path (normal, error, or cancellation) per §5.
pub struct PauseGuard {
    paused: Arc<AtomicBool>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// The narrow contract LLS drives the event stream through (§4.8).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Begins producing events from `from`. Called when this node
    /// becomes (or remains) Master.
    async fn start_processing(&self, from: SequencePoint) -> Result<()>;

    /// Suspends event production. Called when this node is a Worker.
    async fn suspend_processing(&self) -> Result<()>;

    async fn add_locations(
        &self,
        ctx: EventContext,
        machine_id: MachineId,
        hashes_with_size: &[(ContentHash, u64)],
        touch: bool,
    ) -> Result<()>;

    async fn remove_locations(
        &self,
        ctx: EventContext,
        machine_id: MachineId,
        hashes: &[ContentHash],
    ) -> Result<()>;

    async fn touch(
        &self,
        ctx: EventContext,
        machine_id: MachineId,
        hashes: &[ContentHash],
        now: UnixSeconds,
    ) -> Result<()>;

    async fn reconcile(
        &self,
        ctx: EventContext,
        machine_id: MachineId,
        added: &[(ContentHash, u64)],
        removed: &[ContentHash],
    ) -> Result<()>;

    /// Scoped suppression of production; release is guaranteed on drop
    /// of the returned guard.
    async fn pause_sending(&self) -> PauseGuard;

    /// Read cursor used when creating a checkpoint.
    async fn last_processed_sequence_point(&self) -> Result<Option<SequencePoint>>;

    /// Opens a temporary, independent producer bound to the same
    /// underlying stream, used by reconciliation (§4.5 step 5) to emit
    /// its Reconcile batch so it is observed ahead of any event this
    /// node queues on the (paused) main instance afterwards. Torn down
    /// by the caller once the batch has been sent.
    async fn open_scratch_writer(&self) -> Result<Arc<dyn EventStore>>;
}

/// Applies consumed events into component C, and marks the sender
/// active in component B. Polymorphic capability named in §9's Design
/// Notes ("DB-event-consumer"); no inheritance tree implied.
pub struct EventSink {
    db: Arc<ContentLocationDatabase>,
    cluster: Arc<ClusterState>,
}

impl EventSink {
    pub fn new(db: Arc<ContentLocationDatabase>, cluster: Arc<ClusterState>) -> Self {
        Self { db, cluster }
    }

    pub fn apply(&self, event: IncomingEvent, now: UnixSeconds, instant: std::time::Instant) -> Result<()> {
        match event {
            IncomingEvent::LocationAdded {
                from,
                hashes_with_size,
            } => {
                self.cluster.mark_active(from, instant);
                self.db.apply_add(from, &hashes_with_size, now)
            }
            IncomingEvent::LocationRemoved { from, hashes } => {
                self.cluster.mark_active(from, instant);
                self.db.apply_remove(from, &hashes)
            }
            IncomingEvent::ContentTouched { from, hashes, now: touch_now } => {
                self.cluster.mark_active(from, instant);
                self.db.apply_touch(from, &hashes, touch_now)
            }
        }
    }
}

struct MemoryEventStoreInner {
    log: Vec<(SequencePoint, MachineId, IncomingEvent)>,
    next_seq: AtomicU64,
    producing: AtomicBool,
    paused: Arc<AtomicBool>,
}

/// In-memory `EventStore`, used by tests and as the concrete type
/// behind reconciliation's temporary event-store instance.
pub struct MemoryEventStore {
    local_machine_id: MachineId,
    inner: Mutex<MemoryEventStoreInner>,
}

impl MemoryEventStore {
    pub fn new(local_machine_id: MachineId) -> Self {
        Self {
            local_machine_id,
            inner: Mutex::new(MemoryEventStoreInner {
                log: Vec::new(),
                next_seq: AtomicU64::new(0),
                producing: AtomicBool::new(false),
                paused: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Drains every event appended so far, in emission order.
    pub fn drain(&self) -> Vec<(SequencePoint, MachineId, IncomingEvent)> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.log)
    }

    fn push(&self, machine_id: MachineId, event: IncomingEvent) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.paused.load(Ordering::SeqCst) {
            return Err(Error::simple(ErrorKind::Cancelled));
        }
        if !inner.producing.load(Ordering::SeqCst) {
            return Err(Error::simple(ErrorKind::PreconditionViolated));
        }
        let seq = SequencePoint(inner.next_seq.fetch_add(1, Ordering::SeqCst));
        inner.log.push((seq, machine_id, event));
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn start_processing(&self, _from: SequencePoint) -> Result<()> {
        self.inner.lock().producing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn suspend_processing(&self) -> Result<()> {
        self.inner.lock().producing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn add_locations(
        &self,
        _ctx: EventContext,
        machine_id: MachineId,
        hashes_with_size: &[(ContentHash, u64)],
        _touch: bool,
    ) -> Result<()> {
        self.push(
            machine_id,
            IncomingEvent::LocationAdded {
                from: machine_id,
                hashes_with_size: hashes_with_size.to_vec(),
            },
        )
    }

    async fn remove_locations(
        &self,
        _ctx: EventContext,
        machine_id: MachineId,
        hashes: &[ContentHash],
    ) -> Result<()> {
        self.push(
            machine_id,
            IncomingEvent::LocationRemoved {
                from: machine_id,
                hashes: hashes.to_vec(),
            },
        )
    }

    async fn touch(
        &self,
        _ctx: EventContext,
        machine_id: MachineId,
        hashes: &[ContentHash],
        now: UnixSeconds,
    ) -> Result<()> {
        self.push(
            machine_id,
            IncomingEvent::ContentTouched {
                from: machine_id,
                hashes: hashes.to_vec(),
                now,
            },
        )
    }

    async fn reconcile(
        &self,
        _ctx: EventContext,
        machine_id: MachineId,
        added: &[(ContentHash, u64)],
        removed: &[ContentHash],
    ) -> Result<()> {
        // A reconcile batch is modeled as the add set followed by the
        // remove set, preserving within-call emit order (§5).
        if !added.is_empty() {
            self.push(
                machine_id,
                IncomingEvent::LocationAdded {
                    from: machine_id,
                    hashes_with_size: added.to_vec(),
                },
            )?;
        }
        if !removed.is_empty() {
            self.push(
                machine_id,
                IncomingEvent::LocationRemoved {
                    from: machine_id,
                    hashes: removed.to_vec(),
                },
            )?;
        }
        Ok(())
    }

    async fn pause_sending(&self) -> PauseGuard {
        let paused = self.inner.lock().paused.clone();
        paused.store(true, Ordering::SeqCst);
        PauseGuard { paused }
    }

    async fn last_processed_sequence_point(&self) -> Result<Option<SequencePoint>> {
        let inner = self.inner.lock();
        Ok(inner.log.last().map(|(seq, _, _)| *seq))
    }

    async fn open_scratch_writer(&self) -> Result<Arc<dyn EventStore>> {
        let scratch = MemoryEventStore::new(self.local_machine_id);
        scratch.inner.lock().producing.store(true, Ordering::SeqCst);
        Ok(Arc::new(scratch))
    }
}

impl MemoryEventStore {
    pub fn local_machine_id(&self) -> MachineId {
        self.local_machine_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn hash(b: u8) -> ContentHash {
        let mut raw = [0u8; ContentHash::LENGTH];
        raw[0] = b;
        ContentHash::from_bytes(&raw).unwrap()
    }

    #[tokio::test]
    async fn push_fails_while_suspended() {
        let store = MemoryEventStore::new(MachineId(1));
        let err = store
            .add_locations(EventContext, MachineId(1), &[(hash(1), 1)], false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolated);
    }

    #[tokio::test]
    async fn pause_guard_releases_on_drop() {
        let store = MemoryEventStore::new(MachineId(1));
        store.start_processing(SequencePoint::ZERO).await.unwrap();
        {
            let _guard = store.pause_sending().await;
            let err = store
                .add_locations(EventContext, MachineId(1), &[(hash(1), 1)], false)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Cancelled);
        }
        store
            .add_locations(EventContext, MachineId(1), &[(hash(1), 1)], false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn events_for_a_hash_preserve_emit_order() {
        let store = MemoryEventStore::new(MachineId(1));
        store.start_processing(SequencePoint::ZERO).await.unwrap();
        store
            .add_locations(EventContext, MachineId(1), &[(hash(1), 1), (hash(2), 1)], false)
            .await
            .unwrap();
        store
            .remove_locations(EventContext, MachineId(1), &[hash(1)])
            .await
            .unwrap();
        let log = store.drain();
        assert_eq!(log.len(), 2);
        assert!(log[0].0 < log[1].0);
    }

    #[tokio::test]
    async fn scratch_writer_is_independent_and_already_producing() {
        let main = MemoryEventStore::new(MachineId(1));
        main.start_processing(SequencePoint::ZERO).await.unwrap();
        main.add_locations(EventContext, MachineId(1), &[(hash(1), 1)], false)
            .await
            .unwrap();

        let _pause = main.pause_sending().await;
        let scratch = main.open_scratch_writer().await.unwrap();
        scratch
            .reconcile(EventContext, MachineId(1), &[(hash(2), 2)], &[])
            .await
            .unwrap();

        // the paused main store still rejects new events...
        assert!(main
            .add_locations(EventContext, MachineId(1), &[(hash(3), 3)], false)
            .await
            .is_err());
        // ...while the scratch instance recorded its own batch untouched.
        assert_eq!(main.drain().len(), 1);
    }

    #[test]
    fn event_sink_applies_add_and_marks_sender_active() {
        let db = Arc::new(ContentLocationDatabase::new());
        db.set_writeable(true);
        let cluster = Arc::new(ClusterState::new());
        cluster.upsert(
            MachineId(1),
            crate::machine::MachineLocation::new("a"),
            false,
            Instant::now(),
        );
        let sink = EventSink::new(db.clone(), cluster.clone());
        sink.apply(
            IncomingEvent::LocationAdded {
                from: MachineId(1),
                hashes_with_size: vec![(hash(1), 4)],
            },
            10,
            Instant::now(),
        )
        .unwrap();
        assert!(db.get(&hash(1)).is_some());
    }
}
