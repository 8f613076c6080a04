//! Wall-clock abstraction. Orchestrators take `&dyn Clock` rather than
//! calling `SystemTime::now()` directly, so render determinism (§3: "render
//! output is a pure function of ... current wall clock") and expiry
//! boundary tests (§8) can pin `now` exactly.

use crate::model::UnixTimestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp;
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A clock pinned to a fixed instant, for deterministic tests. `set` lets a
/// test fast-forward it to exercise expiry boundaries without a second
/// clock or a real sleep.
#[derive(Debug)]
pub struct FixedClock(std::sync::atomic::AtomicI64);

impl FixedClock {
    pub fn new(now: UnixTimestamp) -> Self {
        FixedClock(std::sync::atomic::AtomicI64::new(now))
    }

    pub fn set(&self, now: UnixTimestamp) {
        self.0.store(now, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> UnixTimestamp {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
