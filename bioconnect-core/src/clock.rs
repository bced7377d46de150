//! Wall-clock source injected into the store, queue and sync engine.

use chrono::{DateTime, Utc};

/// Source of timestamps for enrollment, queueing and sync bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
