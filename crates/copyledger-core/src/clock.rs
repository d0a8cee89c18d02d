// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Time sources for the ledger.
//!
//! Every timestamp the ledger writes comes from a [`Clock`] handed to it at
//! construction. Timestamps have microsecond resolution, matching what the
//! ledger persists.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use copyledger_core::clock::{Clock, ManualClock};
//!
//! let clock = ManualClock::new(chrono::DateTime::UNIX_EPOCH);
//! let before = clock.now();
//! clock.advance(Duration::from_secs(60));
//! assert_eq!((clock.now() - before).num_seconds(), 60);
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant, truncated to microseconds.
    fn now(&self) -> DateTime<Utc>;
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Wall-clock time that never goes backwards.
///
/// If the system clock steps back, the last issued instant is repeated until
/// wall time catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    /// Creates a new system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self.last_micros.fetch_max(wall, Ordering::SeqCst);
        from_micros(prev.max(wall))
    }
}

/// A clock that only moves when told to. Intended for tests.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { micros: AtomicI64::new(start.timestamp_micros()) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    /// Moves the clock to `at`. Ignored if `at` is earlier than the current instant.
    pub fn set(&self, at: DateTime<Utc>) {
        self.micros.fetch_max(at.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_micros(self.micros.load(Ordering::SeqCst))
    }
}
