//! Monotonic commit-time source
//!
//! Journal seals and historical reads are stamped with a commit time that
//! never goes backward, even if the wall clock does.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A clock source producing strictly increasing commit timestamps.
///
/// Timestamps are nanoseconds since the epoch, seeded from the wall clock;
/// if the wall clock stalls or steps backward (NTP adjustment), the previous
/// high-water mark + 1ns is returned instead.
pub struct CommitClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicU64,
}

impl CommitClock {
    pub fn new() -> Self {
        Self {
            high_water_ns: AtomicU64::new(0),
        }
    }

    /// Returns the next commit timestamp.
    pub fn next_commit_time(&self) -> u64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// The latest commit timestamp handed out, without advancing the clock.
    pub fn last_commit_time(&self) -> u64 {
        self.high_water_ns.load(Ordering::Acquire)
    }
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new()
    }
}
