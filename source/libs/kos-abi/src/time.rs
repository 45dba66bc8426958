// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Clock sources and the process-wide time keeper
//! INVARIANTS: `time_get_ns()` is monotonic and measured from boot; the best
//! rated source available at init wins (monotonic > realtime)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Nanoseconds per millisecond.
pub const NSEC_PER_MSEC: u64 = 1_000_000;
/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// A readable clock. Higher `rating` wins during selection.
pub trait ClockSource: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
    /// Quality rating; monotonic sources rate above wall clocks.
    fn rating(&self) -> u32;
    /// Current reading in nanoseconds. Origin is source specific.
    fn read_ns(&self) -> u64;
}

/// Host monotonic clock (`Instant`).
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a monotonic clock whose origin is "now".
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn name(&self) -> &'static str {
        "monotonic"
    }

    fn rating(&self) -> u32 {
        400
    }

    fn read_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Host wall clock. Can jump; only used when nothing better exists.
#[derive(Debug, Default)]
pub struct RealtimeClock;

impl ClockSource for RealtimeClock {
    fn name(&self) -> &'static str {
        "realtime"
    }

    fn rating(&self) -> u32 {
        100
    }

    fn read_ns(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self { now: AtomicU64::new(start_ns) }
    }

    /// Sets the absolute reading.
    pub fn set_ns(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// Advances the reading by `delta_ns`.
    pub fn advance_ns(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }

    /// Advances the reading by whole milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance_ns(ms.saturating_mul(NSEC_PER_MSEC));
    }
}

impl ClockSource for ManualClock {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn rating(&self) -> u32 {
        1
    }

    fn read_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Selected clock plus the reading captured at boot.
#[derive(Debug, Clone)]
pub struct TimeKeeper {
    source: Arc<dyn ClockSource>,
    boot_ns: u64,
}

impl TimeKeeper {
    /// Wraps `source`, treating its current reading as boot time.
    pub fn new(source: Arc<dyn ClockSource>) -> Self {
        let boot_ns = source.read_ns();
        Self { source, boot_ns }
    }

    /// Picks the highest rated source; ties keep the earlier candidate.
    pub fn select_best(candidates: Vec<Arc<dyn ClockSource>>) -> Option<Self> {
        let mut best: Option<Arc<dyn ClockSource>> = None;
        for c in candidates {
            match &best {
                Some(b) if b.rating() >= c.rating() => {}
                _ => best = Some(c),
            }
        }
        best.map(Self::new)
    }

    /// Nanoseconds elapsed since this keeper was created.
    pub fn now_ns(&self) -> u64 {
        self.source.read_ns().saturating_sub(self.boot_ns)
    }

    /// Milliseconds elapsed since boot.
    pub fn now_ms(&self) -> u64 {
        self.now_ns() / NSEC_PER_MSEC
    }

    /// Name of the active source.
    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Underlying source.
    pub fn source(&self) -> Arc<dyn ClockSource> {
        Arc::clone(&self.source)
    }
}

static KEEPER: Lazy<TimeKeeper> = Lazy::new(|| {
    let candidates: Vec<Arc<dyn ClockSource>> =
        vec![Arc::new(RealtimeClock), Arc::new(MonotonicClock::new())];
    TimeKeeper::select_best(candidates)
        .unwrap_or_else(|| TimeKeeper::new(Arc::new(MonotonicClock::new())))
});

/// Process-wide time keeper, initialised on first use.
pub fn keeper() -> &'static TimeKeeper {
    &KEEPER
}

/// Nanoseconds since boot from the best clock source.
pub fn time_get_ns() -> u64 {
    KEEPER.now_ns()
}

/// Wall-clock timestamp split into seconds and nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timespec {
    /// Current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self { sec: d.as_secs() as i64, nsec: d.subsec_nanos() },
            Err(_) => Self::default(),
        }
    }

    /// Builds a timespec from a nanosecond count.
    pub fn from_ns(ns: u64) -> Self {
        Self { sec: (ns / NSEC_PER_SEC) as i64, nsec: (ns % NSEC_PER_SEC) as u32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_outranks_realtime() {
        let keeper = TimeKeeper::select_best(vec![
            Arc::new(RealtimeClock) as Arc<dyn ClockSource>,
            Arc::new(MonotonicClock::new()),
        ])
        .expect("keeper");
        assert_eq!(keeper.source_name(), "monotonic");
    }

    #[test]
    fn keeper_measures_from_boot() {
        let clock = Arc::new(ManualClock::new(5_000));
        let keeper = TimeKeeper::new(clock.clone());
        assert_eq!(keeper.now_ns(), 0);
        clock.advance_ms(3);
        assert_eq!(keeper.now_ns(), 3 * NSEC_PER_MSEC);
        assert_eq!(keeper.now_ms(), 3);
    }

    #[test]
    fn global_time_never_goes_backwards() {
        let a = time_get_ns();
        let b = time_get_ns();
        assert!(b >= a);
        assert_eq!(keeper().source_name(), "monotonic");
    }

    #[test]
    fn empty_candidate_list_selects_nothing() {
        assert!(TimeKeeper::select_best(Vec::new()).is_none());
    }
}
