//! Component A: time-expiring membership sets for recently-added,
//! recently-touched, and recently-removed hashes.
//!
//! Entries auto-expire after a configured TTL (`TouchFrequency` for the
//! touched set, per §3's Lifecycles). A `linked-hash-map` gives us
//! insertion-order iteration, so expiring the stale prefix of the map
//! is a cheap front-pop rather than a full scan.

use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::hash::ContentHash;

/// A set of content hashes whose membership expires after `ttl`.
pub struct VolatileSet {
    ttl: Duration,
    entries: Mutex<LinkedHashMap<ContentHash, Instant>>,
}

impl VolatileSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LinkedHashMap::new()),
        }
    }

    fn expire_stale(entries: &mut LinkedHashMap<ContentHash, Instant>, ttl: Duration, now: Instant) {
        while let Some((_, &inserted_at)) = entries.front() {
            if now.saturating_duration_since(inserted_at) >= ttl {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Adds `hash` to the set, refreshing its expiry.
    pub fn add(&self, hash: ContentHash, now: Instant) {
        let mut entries = self.entries.lock();
        Self::expire_stale(&mut entries, self.ttl, now);
        entries.remove(&hash);
        entries.insert(hash, now);
    }

    /// True if `hash` is a current (non-expired) member.
    pub fn contains(&self, hash: &ContentHash, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        Self::expire_stale(&mut entries, self.ttl, now);
        entries.contains_key(hash)
    }

    /// Removes `hash` from the set unconditionally (used to invalidate
    /// a hash from `recentlyAdded`/`recentlyRemoved` after the opposite
    /// event occurs).
    pub fn invalidate(&self, hash: &ContentHash) {
        self.entries.lock().remove(hash);
    }

    /// Returns the insertion time of `hash` if it is a current member,
    /// without mutating the set.
    pub fn inserted_at(&self, hash: &ContentHash, now: Instant) -> Option<Instant> {
        let mut entries = self.entries.lock();
        Self::expire_stale(&mut entries, self.ttl, now);
        entries.get(hash).copied()
    }

    #[cfg(test)]
    fn len(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        Self::expire_stale(&mut entries, self.ttl, now);
        entries.len()
    }
}
