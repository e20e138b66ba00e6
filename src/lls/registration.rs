//! The eager/lazy registration decision (§4.2): a pure function over
//! the current volatile-set/cluster-state/DB snapshot, so the policy
//! itself is testable without standing up the whole core.

use std::time::{Duration, Instant};

use crate::content_db::{ContentLocationEntry, UnixSeconds};
use crate::machine::MachineId;

/// Why a registration was classified as eager.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EagerReason {
    RecentRemove,
    RecentInactive,
    Default,
}

/// The action `register_local_location` takes for a single hash.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegistrationAction {
    Skip,
    LazyTouchEventOnly,
    LazyEventOnly,
    EagerGlobal(EagerReason),
}

impl RegistrationAction {
    pub fn emits_event(self) -> bool {
        !matches!(self, RegistrationAction::Skip)
    }

    pub fn writes_eager(self) -> bool {
        matches!(self, RegistrationAction::EagerGlobal(_))
    }
}

/// Everything the policy needs to know about cluster-wide state to
/// decide a single hash, independent of any particular hash.
pub struct PolicyContext<'a> {
    pub now: Instant,
    pub now_unix: UnixSeconds,
    pub skip_redundant_add: bool,
    pub last_inactive_time: Option<Instant>,
    pub recent_inactive_window: Duration,
    pub touch_frequency: Duration,
    pub safe_lazy_threshold: u32,
    pub local_machine_id: MachineId,
    pub is_recently_removed: &'a dyn Fn(Instant) -> bool,
    pub is_recently_added: &'a dyn Fn(Instant) -> bool,
}

/// Decides the action for one hash given its current DB entry (`None`
/// for the *Missing* entry). Priority order is load-bearing: recent
/// removal always wins even if the hash is also in `recentlyAdded`.
pub fn decide(ctx: &PolicyContext<'_>, db_entry: Option<&ContentLocationEntry>) -> RegistrationAction {
    if ctx.skip_redundant_add && (ctx.is_recently_removed)(ctx.now) {
        return RegistrationAction::EagerGlobal(EagerReason::RecentRemove);
    }

    if let Some(last_inactive) = ctx.last_inactive_time {
        if ctx.now.saturating_duration_since(last_inactive) < ctx.recent_inactive_window {
            return RegistrationAction::EagerGlobal(EagerReason::RecentInactive);
        }
    }

    if ctx.skip_redundant_add && (ctx.is_recently_added)(ctx.now) {
        return RegistrationAction::Skip;
    }

    if let Some(entry) = db_entry {
        if entry.locations.contains(ctx.local_machine_id) {
            let age = ctx.now_unix.saturating_sub(entry.last_access_utc);
            return if age < ctx.touch_frequency.as_secs() {
                RegistrationAction::Skip
            } else {
                RegistrationAction::LazyTouchEventOnly
            };
        }
        if entry.replica_count() as u32 >= ctx.safe_lazy_threshold {
            return RegistrationAction::LazyEventOnly;
        }
    }

    RegistrationAction::EagerGlobal(EagerReason::Default)
}
