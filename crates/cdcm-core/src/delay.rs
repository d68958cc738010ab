//! Delay derivation from raw stage timestamps.
//!
//! All timestamps are wall-clock epoch milliseconds. Results never go
//! negative: a timestamp ahead of `now` (clock skew, or a value that has not
//! been initialised yet) yields zero.

use std::sync::atomic::{AtomicI64, Ordering};

use cdcm_pipeline::StageTimestamps;
use serde::Serialize;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn elapsed_since(now: i64, past: i64) -> u64 {
    if now >= past {
        now.abs_diff(past)
    } else {
        0
    }
}

/// Delay of a stage that can never be ahead of the stage feeding it: the
/// downstream timestamp is clamped to the upstream one first.
pub fn chained_delay(now: i64, upstream: i64, downstream: i64) -> u64 {
    elapsed_since(now, downstream.min(upstream))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreDelays {
    pub put: u64,
    pub get: u64,
    pub ack: u64,
}

pub fn store_delays(now: i64, ts: StageTimestamps) -> StoreDelays {
    StoreDelays {
        put: elapsed_since(now, ts.put),
        get: chained_delay(now, ts.put, ts.get),
        ack: chained_delay(now, ts.get, ts.ack),
    }
}
