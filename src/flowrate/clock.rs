//! Coarse monotonic clocks for rate monitors.
//!
//! Monitors read the time on every update, so the default clock is a shared
//! counter advanced by a background ticker every [`CLOCK_RATE`] instead of a
//! system call per read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::core::CLOCK_RATE;

/// Source of time for a [`Monitor`](super::Monitor).
///
/// Readings are offsets from an arbitrary origin and never go backwards.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Time since the clock's origin.
    fn now(&self) -> Duration;
}

/// Round `d` to the nearest multiple of [`CLOCK_RATE`].
pub fn clock_round(d: Duration) -> Duration {
    let rate = CLOCK_RATE.as_nanos();
    let rounded = (d.as_nanos() + rate / 2) / rate * rate;
    Duration::from_nanos(rounded as u64)
}

/// A clock advanced by a ticker thread.
///
/// Until [`start`](TickClock::start) is called, readings are computed on
/// demand with the same granularity.
#[derive(Debug)]
pub struct TickClock {
    origin: Instant,
    nanos: AtomicU64,
    started: AtomicBool,
}

impl TickClock {
    /// Create a stopped clock with its origin at the current instant.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            nanos: AtomicU64::new(0),
            started: AtomicBool::new(false),
        })
    }

    /// The process-wide clock, started on first use.
    pub fn global() -> Arc<TickClock> {
        static GLOBAL: OnceLock<Arc<TickClock>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let clock = TickClock::new();
                clock.start();
                clock
            })
            .clone()
    }

    /// Spawn the ticker. Calling this more than once has no effect.
    ///
    /// The ticker exits once the last reference to the clock is dropped.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tick();

        let weak: Weak<TickClock> = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("flowrate-clock".into())
            .spawn(move || {
                while let Some(clock) = weak.upgrade() {
                    clock.tick();
                    drop(clock);
                    std::thread::sleep(CLOCK_RATE);
                }
            });
        if spawned.is_err() {
            self.started.store(false, Ordering::Release);
        }
    }

    /// Whether the ticker is running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> Duration {
        clock_round(self.origin.elapsed())
    }

    fn tick(&self) {
        let nanos = self.elapsed().as_nanos() as u64;
        self.nanos.fetch_max(nanos, Ordering::AcqRel);
    }
}

impl Clock for TickClock {
    fn now(&self) -> Duration {
        if self.is_started() {
            Duration::from_nanos(self.nanos.load(Ordering::Acquire))
        } else {
            self.elapsed()
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move the clock forward.
    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Set the clock to `d`.
    pub fn set(&self, d: Duration) {
        self.nanos.store(d.as_nanos() as u64, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}
