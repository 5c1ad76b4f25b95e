//! Monotonic wall-clock abstraction (component A).
//!
//! Every time-sensitive component (schedule evaluator callers, lease manager,
//! worker heartbeat) takes a `&dyn Clock` rather than calling `Utc::now()`
//! directly, so the whole system can be driven deterministically under a
//! `FakeClock` in tests.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock, backed by the OS.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: holds an instant that only advances when
/// told to.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, delta: chrono::Duration) -> DateTime<Utc> {
        let mut guard = self.now.lock().unwrap();
        *guard += delta;
        *guard
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
