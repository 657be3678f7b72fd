// crates/service-gate-core/src/cache.rs
// ============================================================================
// Module: TTL Cache
// Description: Capacity-bounded LRU cache with per-entry expiry.
// Purpose: Back the access-token and identity-claims caches.
// Dependencies: lru, time
// ============================================================================

//! ## Overview
//! [`TtlCache`] combines LRU eviction at a fixed capacity with a time-to-live
//! measured from insertion. Access is synchronized internally so callers can
//! share it behind an `Arc` without extra locking. Expired entries are
//! removed lazily on read. A poisoned lock is recovered rather than treated
//! as a miss.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use lru::LruCache;
use time::OffsetDateTime;

use crate::clock::Clock;

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Cached value with its expiry instant.
struct Slot<V> {
    /// Cached value.
    value: V,
    /// Instant after which the slot is stale.
    expires_at: OffsetDateTime,
}

/// Thread-safe LRU cache with time-based expiry.
///
/// # Invariants
/// - Holds at most `capacity` entries; the least recently used is evicted.
/// - A read never returns an entry older than `ttl`.
pub struct TtlCache<K: Hash + Eq, V> {
    /// Entries in recency order.
    entries: Mutex<LruCache<K, Slot<V>>>,
    /// Lifetime applied at insertion.
    ttl: Duration,
    /// Time source for expiry.
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    /// Creates a cache. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock,
        }
    }

    /// Inserts or replaces `key`, resetting its lifetime.
    pub fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.entries().put(
            key,
            Slot {
                value,
                expires_at,
            },
        );
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let expired = entries.get(key).map(|slot| slot.expires_at <= now)?;
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|slot| slot.value.clone())
    }

    /// Number of entries, including ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the entries, recovering from poisoning.
    fn entries(&self) -> MutexGuard<'_, LruCache<K, Slot<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}
