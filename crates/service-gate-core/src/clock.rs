// crates/service-gate-core/src/clock.rs
// ============================================================================
// Module: Clock
// Description: Injectable wall clock.
// Purpose: Keep time-window checks deterministic under test.
// Dependencies: time
// ============================================================================

//! ## Overview
//! Token skew checks, signature buckets, and cache expiry all read time
//! through [`Clock`] so tests can pin or advance it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

// ============================================================================
// SECTION: Clock Trait
// ============================================================================

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    /// Current reading.
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    /// Creates a clock pinned at `unix_seconds`.
    #[must_use]
    pub fn at_unix(unix_seconds: i64) -> Self {
        let now = OffsetDateTime::from_unix_timestamp(unix_seconds)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self {
            now: Mutex::new(now),
        }
    }

    /// Pins the clock at `now`.
    pub fn set(&self, now: OffsetDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.now.lock().map_or(OffsetDateTime::UNIX_EPOCH, |guard| *guard)
    }
}
