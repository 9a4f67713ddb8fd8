use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time in units of [`TimerServiceConfig::tick`](crate::TimerServiceConfig::tick).
pub type Tick = u64;

/// Source of "now" for deadline computation.
pub trait HostClock: Send + Sync {
    fn now(&self) -> Tick;
}

/// Host monotonic clock, counting whole ticks since construction.
#[derive(Debug, Clone)]
pub struct StdHostClock {
    origin: Instant,
    tick: Duration,
}

impl StdHostClock {
    pub fn new(tick: Duration) -> Self {
        Self {
            origin: Instant::now(),
            tick,
        }
    }
}

impl HostClock for StdHostClock {
    fn now(&self) -> Tick {
        let tick_ns = self.tick.as_nanos().max(1);
        let ticks = self.origin.elapsed().as_nanos() / tick_ns;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now: AtomicU64,
}

impl FakeHostClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: Tick) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, ticks: Tick) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set(&self, now: Tick) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }
}

/// Converts a relative delay to whole ticks, rounding to the nearest tick (halves round up).
pub(crate) fn duration_to_ticks(delay: Duration, tick: Duration) -> Tick {
    let tick_ns = tick.as_nanos().max(1);
    let ticks = (delay.as_nanos() + tick_ns / 2) / tick_ns;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

pub(crate) fn ticks_to_duration(ticks: Tick, tick: Duration) -> Duration {
    let ns = u128::from(ticks) * tick.as_nanos();
    Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
}
