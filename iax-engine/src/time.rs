use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Source of both monotonic and wall-clock time.
///
/// Production code uses [`SystemTimeProvider`]; tests drive a
/// [`ManualTimeProvider`] so retransmission and registration timing are
/// deterministic.
pub trait TimeProvider: Send + Sync {
    fn now_instant(&self) -> Instant;
    fn now_system_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    inner: RwLock<(Instant, i64)>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, system_ms: i64) -> Self {
        Self {
            inner: RwLock::new((instant, system_ms)),
        }
    }

    pub fn set_time(&self, instant: Instant, system_ms: i64) {
        *self.inner.write() = (instant, system_ms);
    }

    pub fn advance(&self, duration: Duration) {
        let mut guard = self.inner.write();
        guard.0 += duration;
        guard.1 += duration.as_millis() as i64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        self.inner.read().0
    }

    fn now_system_ms(&self) -> i64 {
        self.inner.read().1
    }
}
