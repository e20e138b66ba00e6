//! Configuration surface recognized by the Local Location Store.
//!
//! Every knob named in the external interfaces section lives here, on
//! one `serde`-deserializable struct. `validate()` is run once at
//! startup; any violation is a `Fatal` error, since the process must
//! not proceed with a nonsensical configuration.

use std::time::Duration;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Every configuration knob the Local Location Store recognizes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct LlsConfig {
    /// Minimum interval between two touches of the same hash before a
    /// second touch is considered stale.
    pub touch_frequency: Duration,
    /// Drives the reconciliation freshness window (`0.75 *` this).
    pub location_entry_expiry: Duration,
    /// Drives the "recent inactivity" window (`5 *` this).
    pub recompute_inactive_machines_expiry: Duration,
    /// Enables volatile-set suppression of redundant registrations.
    pub skip_redundant_content_location_add: bool,
    /// Replica count above which an Add is classified lazy.
    pub safe_to_lazily_update_machine_count_threshold: u32,

    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Interval between master-initiated checkpoint creation.
    pub create_checkpoint_interval: Duration,
    /// Interval between worker-initiated checkpoint restores.
    pub restore_checkpoint_interval: Duration,
    /// A checkpoint younger than this is considered fresh enough to
    /// skip restoring, the first time a restore is attempted.
    pub restore_checkpoint_age_threshold: Duration,

    /// Wait between reconciliation cycles.
    pub reconciliation_cycle_frequency: Duration,
    /// Cap on the number of diff entries processed in one reconcile
    /// cycle before yielding.
    pub reconciliation_max_cycle_size: usize,
    /// Whether reconciliation runs at all.
    pub enable_reconciliation: bool,

    /// Whether proactive replication runs at all.
    pub enable_proactive_replication: bool,
    /// Whether proactive replication runs inline with restore rather
    /// than as a detached background task.
    pub inline_proactive_replication: bool,
    /// Replica count below which a candidate is proactively replicated.
    pub proactive_copy_locations_threshold: u32,
    /// Pacing delay between successive proactive copy invocations.
    pub delay_for_proactive_replication: Duration,
    /// Stop a proactive replication run after this many outcomes.
    pub proactive_replication_copy_limit: usize,

    /// Size of the bounded pool used by the approximate eviction sort.
    pub eviction_pool_size: usize,
    /// Page size pulled from each half of the eviction stream.
    pub eviction_window_size: usize,
    /// Fraction of the pool emitted as "best" per step.
    pub eviction_removal_fraction: f64,
    /// Fraction of the pool discarded as "worst" per step.
    pub eviction_discard_fraction: f64,
    /// Candidates younger than this are never considered for eviction.
    pub eviction_min_age: Duration,
    /// Half-life-like scale factor in the effective-last-access formula.
    pub content_lifetime: f64,
    /// Per-replica independent unavailability probability.
    pub machine_risk: f64,

    /// Await the initial heartbeat synchronously during startup, rather
    /// than resolving post-initialization in the background.
    pub inline_post_initialization: bool,
}

impl LlsConfig {
    /// Checks every invariant the rest of the crate assumes holds of a
    /// configuration. Called once at startup; failure is `Fatal`.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("touch_frequency", self.touch_frequency),
            ("location_entry_expiry", self.location_entry_expiry),
            (
                "recompute_inactive_machines_expiry",
                self.recompute_inactive_machines_expiry,
            ),
            ("heartbeat_interval", self.heartbeat_interval),
            ("create_checkpoint_interval", self.create_checkpoint_interval),
            (
                "restore_checkpoint_interval",
                self.restore_checkpoint_interval,
            ),
        ];
        for (name, d) in nonzero {
            if d.is_zero() {
                return Err(Error::message(
                    ErrorKind::Fatal,
                    format!("{} must be non-zero", name),
                ));
            }
        }
        if self.eviction_pool_size == 0 {
            return Err(Error::message(
                ErrorKind::Fatal,
                "eviction_pool_size must be non-zero",
            ));
        }
        if self.eviction_window_size == 0 {
            return Err(Error::message(
                ErrorKind::Fatal,
                "eviction_window_size must be non-zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.eviction_removal_fraction)
            || !(0.0..=1.0).contains(&self.eviction_discard_fraction)
        {
            return Err(Error::message(
                ErrorKind::Fatal,
                "eviction removal/discard fractions must be within [0, 1]",
            ));
        }
        if self.eviction_removal_fraction + self.eviction_discard_fraction > 1.0 {
            return Err(Error::message(
                ErrorKind::Fatal,
                "eviction_removal_fraction + eviction_discard_fraction must not exceed 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.machine_risk) {
            return Err(Error::message(
                ErrorKind::Fatal,
                "machine_risk must be a probability within [0, 1]",
            ));
        }
        if self.content_lifetime < 0.0 {
            return Err(Error::message(
                ErrorKind::Fatal,
                "content_lifetime must be non-negative",
            ));
        }
        Ok(())
    }

    /// Window within which a machine is considered "recently inactive"
    /// for the purposes of the eager-write registration policy.
    pub fn recent_inactive_window(&self) -> Duration {
        self.recompute_inactive_machines_expiry * 5
    }

    /// Window within which the reconciliation marker is considered up
    /// to date.
    pub fn reconciliation_freshness_window(&self) -> Duration {
        self.location_entry_expiry.mul_f64(0.75)
    }
}

impl Default for LlsConfig {
    fn default() -> Self {
        Self {
            touch_frequency: Duration::from_secs(30 * 60),
            location_entry_expiry: Duration::from_secs(7 * 24 * 60 * 60),
            recompute_inactive_machines_expiry: Duration::from_secs(10 * 60),
            skip_redundant_content_location_add: true,
            safe_to_lazily_update_machine_count_threshold: 3,

            heartbeat_interval: Duration::from_secs(60),
            create_checkpoint_interval: Duration::from_secs(30 * 60),
            restore_checkpoint_interval: Duration::from_secs(30 * 60),
            restore_checkpoint_age_threshold: Duration::from_secs(5 * 60),

            reconciliation_cycle_frequency: Duration::from_secs(1),
            reconciliation_max_cycle_size: 10_000,
            enable_reconciliation: true,

            enable_proactive_replication: false,
            inline_proactive_replication: false,
            proactive_copy_locations_threshold: 3,
            delay_for_proactive_replication: Duration::from_millis(100),
            proactive_replication_copy_limit: 1_000,

            eviction_pool_size: 256,
            eviction_window_size: 64,
            eviction_removal_fraction: 0.5,
            eviction_discard_fraction: 0.25,
            eviction_min_age: Duration::from_secs(60 * 60),
            content_lifetime: 1.0,
            machine_risk: 0.1,

            inline_post_initialization: false,
        }
    }
}
