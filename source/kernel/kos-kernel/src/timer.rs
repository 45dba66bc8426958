// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Timer subsystem: coarse timer wheel plus a sorted hi-res queue
//! OWNERS: @kernel-team
//! PUBLIC API: TimerWheel (create/start/stop/delete/tick/start_ticker), TimerId, TimerKind
//! INVARIANTS:
//!   - A started timer sits in exactly one of {wheel slot, hi-res queue}
//!   - |wheel| + |hi-res| <= number of timers in state Active
//!   - Callbacks run without the timer lock held; equal expiries fire in start order
//!   - A periodic timer stopped while its callback runs is not re-armed

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kos_abi::time::TimeKeeper;
use kos_abi::Errno;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::TimerConfig;

/// Timer identifier, unique for the lifetime of the wheel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw identifier.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Timer flavour; decides which structure a started timer lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TimerKind {
    /// Fires once from the wheel.
    OneShot,
    /// Re-armed from the wheel every `interval_ns`.
    Periodic,
    /// Fires from the sorted queue; periodic when `interval_ns > 0`.
    HiRes,
}

/// Lifecycle state of a timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TimerState {
    /// Created or stopped; not queued.
    Inactive,
    /// Queued and waiting for its expiry.
    Active,
    /// Callback in progress.
    Running,
    /// One-shot that has fired.
    Expired,
}

/// Errors returned by timer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    /// Unknown or deleted timer.
    #[error("no such timer")]
    NotFound,
    /// Periodic timer created with a zero interval.
    #[error("periodic timer needs a non-zero interval")]
    ZeroInterval,
    /// Ticker already running.
    #[error("ticker already running")]
    Already,
    /// The ticker thread could not be spawned.
    #[error("cannot spawn ticker")]
    Spawn,
}

impl TimerError {
    /// Errno equivalent.
    pub const fn errno(self) -> Errno {
        match self {
            Self::NotFound | Self::ZeroInterval => Errno::EINVAL,
            Self::Already => Errno::EBUSY,
            Self::Spawn => Errno::EAGAIN,
        }
    }
}

/// Per-timer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimerStats {
    /// Completed callback invocations.
    pub fire_count: u64,
    /// Clock reading at the last fire.
    pub last_fire_ns: u64,
    /// Wall time spent in callbacks.
    pub total_callback_ns: u64,
    /// Longest single callback.
    pub max_callback_ns: u64,
}

/// Subsystem-wide snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WheelStats {
    /// Registered timers.
    pub timers: usize,
    /// Timers in state Active.
    pub active: usize,
    /// Entries queued in wheel slots.
    pub wheel_len: usize,
    /// Entries queued in the hi-res queue.
    pub hires_len: usize,
    /// Current jiffy.
    pub jiffies: u64,
    /// Callbacks run since creation.
    pub fired: u64,
}

/// Timer callback. Receives the id of the timer that fired.
pub type TimerCallback = Arc<dyn Fn(TimerId) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    Wheel(usize),
    HiRes { expires_ns: u64, seq: u64 },
}

struct Entry {
    kind: TimerKind,
    interval_ns: u64,
    expires_ns: u64,
    seq: u64,
    state: TimerState,
    placement: Option<Placement>,
    callback: TimerCallback,
    stats: TimerStats,
}

impl Entry {
    fn rearms(&self) -> bool {
        match self.kind {
            TimerKind::OneShot => false,
            TimerKind::Periodic => true,
            TimerKind::HiRes => self.interval_ns > 0,
        }
    }
}

struct Inner {
    timers: HashMap<TimerId, Entry>,
    slots: Vec<VecDeque<TimerId>>,
    hires: BTreeMap<(u64, u64), TimerId>,
    jiffies: u64,
    next_seq: u64,
}

impl Inner {
    fn unlink(&mut self, id: TimerId) {
        let Some(entry) = self.timers.get_mut(&id) else {
            return;
        };
        match entry.placement.take() {
            Some(Placement::Wheel(slot)) => {
                if let Some(list) = self.slots.get_mut(slot) {
                    list.retain(|t| *t != id);
                }
            }
            Some(Placement::HiRes { expires_ns, seq }) => {
                self.hires.remove(&(expires_ns, seq));
            }
            None => {}
        }
    }

    fn enqueue(&mut self, id: TimerId, expires_ns: u64, now_ns: u64, resolution_ns: u64) -> Result<(), TimerError> {
        self.unlink(id);
        let seq = self.next_seq;
        self.next_seq += 1;
        let nslots = self.slots.len() as u64;
        let entry = self.timers.get_mut(&id).ok_or(TimerError::NotFound)?;
        entry.expires_ns = expires_ns;
        entry.seq = seq;
        entry.state = TimerState::Active;
        let placement = match entry.kind {
            TimerKind::HiRes => Placement::HiRes { expires_ns, seq },
            TimerKind::OneShot | TimerKind::Periodic => {
                // Already-due timers land in the current slot so the next walk sees them.
                let jiffy = expires_ns.max(now_ns) / resolution_ns;
                Placement::Wheel((jiffy % nslots) as usize)
            }
        };
        entry.placement = Some(placement);
        match placement {
            Placement::Wheel(slot) => self.slots[slot].push_back(id),
            Placement::HiRes { expires_ns, seq } => {
                self.hires.insert((expires_ns, seq), id);
            }
        }
        Ok(())
    }

    /// Pulls every due timer out of both structures, marks it Running and
    /// returns them ordered by (expiry, start order).
    fn collect_due(&mut self, now_ns: u64, resolution_ns: u64) -> Vec<(u64, u64, TimerId, TimerCallback)> {
        let nslots = self.slots.len() as u64;
        let target = now_ns / resolution_ns;
        let walk = if target.saturating_sub(self.jiffies) >= nslots {
            nslots
        } else {
            target.saturating_sub(self.jiffies) + 1
        };
        let mut due_ids = Vec::new();
        for step in 0..walk {
            let slot = ((self.jiffies + step) % nslots) as usize;
            let list = std::mem::take(&mut self.slots[slot]);
            let mut keep = VecDeque::with_capacity(list.len());
            for id in list {
                match self.timers.get(&id) {
                    Some(e) if e.expires_ns <= now_ns => due_ids.push(id),
                    Some(_) => keep.push_back(id),
                    None => {}
                }
            }
            self.slots[slot] = keep;
        }
        self.jiffies = self.jiffies.max(target);

        while let Some((expires_ns, id)) = self.hires.first_key_value().map(|(k, v)| (k.0, *v)) {
            if expires_ns > now_ns {
                break;
            }
            self.hires.pop_first();
            due_ids.push(id);
        }

        let mut due = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(e) = self.timers.get_mut(&id) {
                e.placement = None;
                e.state = TimerState::Running;
                due.push((e.expires_ns, e.seq, id, e.callback.clone()));
            }
        }
        due.sort_by_key(|(expires, seq, _, _)| (*expires, *seq));
        due
    }
}

/// Timer wheel with a companion hi-res queue, driven by [`tick`](Self::tick)
/// or by a ticker thread.
pub struct TimerWheel {
    clock: TimeKeeper,
    resolution_ns: u64,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    fired: AtomicU64,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("resolution_ns", &self.resolution_ns)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TimerWheel {
    /// Builds an idle wheel reading time from `clock`.
    pub fn new(config: &TimerConfig, clock: TimeKeeper) -> Arc<Self> {
        let resolution_ns = config.resolution_ns.max(1);
        let nslots = config.wheel_slots.max(1);
        let jiffies = clock.now_ns() / resolution_ns;
        log::info!("timer: {} slots at {} ns, clock {}", nslots, resolution_ns, clock.source_name());
        Arc::new(Self {
            clock,
            resolution_ns,
            inner: Mutex::new(Inner {
                timers: HashMap::new(),
                slots: (0..nslots).map(|_| VecDeque::new()).collect(),
                hires: BTreeMap::new(),
                jiffies,
                next_seq: 0,
            }),
            next_id: AtomicU64::new(1),
            fired: AtomicU64::new(0),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    /// Nanoseconds since boot on the wheel's clock.
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Registers an inactive timer.
    pub fn create<F>(&self, kind: TimerKind, interval_ns: u64, callback: F) -> Result<TimerId, TimerError>
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        if kind == TimerKind::Periodic && interval_ns == 0 {
            return Err(TimerError::ZeroInterval);
        }
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            kind,
            interval_ns,
            expires_ns: 0,
            seq: 0,
            state: TimerState::Inactive,
            placement: None,
            callback: Arc::new(callback),
            stats: TimerStats::default(),
        };
        self.inner.lock().timers.insert(id, entry);
        log::trace!("timer: created {:?} ({:?})", id, kind);
        Ok(id)
    }

    /// Arms `id` to fire `delay_ns` from now. Re-arms an already active timer.
    pub fn start(&self, id: TimerId, delay_ns: u64) -> Result<(), TimerError> {
        let now = self.now_ns();
        self.start_at(id, now.saturating_add(delay_ns))
    }

    /// Arms `id` at an absolute expiry.
    pub fn start_at(&self, id: TimerId, expires_ns: u64) -> Result<(), TimerError> {
        let now = self.now_ns();
        self.inner.lock().enqueue(id, expires_ns, now, self.resolution_ns)
    }

    /// Removes `id` from its queue without freeing it. Allowed while its
    /// callback runs; the callback finishes and no further fire happens.
    pub fn stop(&self, id: TimerId) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if !inner.timers.contains_key(&id) {
            return Err(TimerError::NotFound);
        }
        inner.unlink(id);
        if let Some(e) = inner.timers.get_mut(&id) {
            e.state = TimerState::Inactive;
        }
        Ok(())
    }

    /// Stops and frees `id`.
    pub fn delete(&self, id: TimerId) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        inner.unlink(id);
        inner.timers.remove(&id).map(|_| ()).ok_or(TimerError::NotFound)
    }

    /// Current state of `id`.
    pub fn state(&self, id: TimerId) -> Option<TimerState> {
        self.inner.lock().timers.get(&id).map(|e| e.state)
    }

    /// Counters of `id`.
    pub fn timer_stats(&self, id: TimerId) -> Option<TimerStats> {
        self.inner.lock().timers.get(&id).map(|e| e.stats)
    }

    /// Expiry of `id` while it is queued.
    pub fn expires(&self, id: TimerId) -> Option<u64> {
        let inner = self.inner.lock();
        inner.timers.get(&id).filter(|e| e.placement.is_some()).map(|e| e.expires_ns)
    }

    /// Fires every timer due at the current clock reading; returns how many
    /// callbacks ran.
    pub fn tick(&self) -> usize {
        let now = self.now_ns();
        let due = self.inner.lock().collect_due(now, self.resolution_ns);
        let count = due.len();
        for (_, _, id, callback) in due {
            let started = Instant::now();
            callback(id);
            let took = started.elapsed().as_nanos() as u64;
            self.fired.fetch_add(1, Ordering::Relaxed);
            self.finish(id, now, took);
        }
        count
    }

    fn finish(&self, id: TimerId, now_ns: u64, took_ns: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.timers.get_mut(&id) else {
            // Deleted from inside its own callback.
            return;
        };
        entry.stats.fire_count += 1;
        entry.stats.last_fire_ns = now_ns;
        entry.stats.total_callback_ns = entry.stats.total_callback_ns.saturating_add(took_ns);
        entry.stats.max_callback_ns = entry.stats.max_callback_ns.max(took_ns);
        if entry.state != TimerState::Running {
            // Stopped or restarted while the callback ran.
            return;
        }
        if entry.rearms() {
            let next = now_ns.saturating_add(entry.interval_ns);
            if let Err(e) = inner.enqueue(id, next, now_ns, self.resolution_ns) {
                log::warn!("timer: cannot re-arm {:?}: {}", id, e);
            }
        } else {
            entry.state = TimerState::Expired;
        }
    }

    /// Spawns the ticker thread, one pass per resolution period.
    pub fn start_ticker(self: &Arc<Self>) -> Result<(), TimerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TimerError::Already);
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_nanos(self.resolution_ns);
        let handle = std::thread::Builder::new()
            .name("kos-timer".into())
            .spawn(move || loop {
                let Some(wheel) = weak.upgrade() else {
                    break;
                };
                if !wheel.running.load(Ordering::Acquire) {
                    break;
                }
                wheel.tick();
                drop(wheel);
                std::thread::sleep(period);
            })
            .map_err(|e| {
                log::error!("timer: cannot spawn ticker: {}", e);
                self.running.store(false, Ordering::Release);
                TimerError::Spawn
            })?;
        *self.ticker.lock() = Some(handle);
        log::info!("timer: ticker started");
        Ok(())
    }

    /// True while the ticker thread runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the ticker and drops every timer.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.ticker.lock().take() {
            if handle.join().is_err() {
                kos_diag::kwarn!("timer: ticker thread panicked");
            }
        }
        let mut inner = self.inner.lock();
        inner.timers.clear();
        inner.hires.clear();
        inner.slots.iter_mut().for_each(VecDeque::clear);
        log::info!("timer: shut down");
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WheelStats {
        let inner = self.inner.lock();
        WheelStats {
            timers: inner.timers.len(),
            active: inner.timers.values().filter(|e| e.state == TimerState::Active).count(),
            wheel_len: inner.slots.iter().map(VecDeque::len).sum(),
            hires_len: inner.hires.len(),
            jiffies: inner.jiffies,
            fired: self.fired.load(Ordering::Relaxed),
        }
    }

    /// Checks the placement invariants; used by tests and debug tooling.
    pub fn check_invariants(&self) -> bool {
        let inner = self.inner.lock();
        let queued = inner.slots.iter().map(VecDeque::len).sum::<usize>() + inner.hires.len();
        let active = inner.timers.values().filter(|e| e.state == TimerState::Active).count();
        let placed_ok = inner.timers.iter().all(|(id, e)| match e.placement {
            None => e.state != TimerState::Active,
            Some(Placement::Wheel(slot)) => {
                e.state == TimerState::Active
                    && inner.slots[slot].iter().filter(|t| *t == id).count() == 1
                    && !inner.hires.values().any(|t| t == id)
            }
            Some(Placement::HiRes { expires_ns, seq }) => {
                e.state == TimerState::Active
                    && inner.hires.get(&(expires_ns, seq)) == Some(id)
                    && !inner.slots.iter().any(|s| s.contains(id))
            }
        });
        queued <= active && placed_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kos_abi::time::{ManualClock, NSEC_PER_MSEC};
    use proptest::prelude::*;

    fn wheel() -> (Arc<TimerWheel>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let wheel = TimerWheel::new(&TimerConfig::default(), TimeKeeper::new(clock.clone()));
        (wheel, clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<TimerId>>>, impl Fn(TimerId) + Send + Sync + Clone + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |id| sink.lock().push(id))
    }

    #[test]
    fn periodic_with_zero_interval_is_rejected() {
        let (w, _) = wheel();
        assert_eq!(w.create(TimerKind::Periodic, 0, |_| {}).unwrap_err(), TimerError::ZeroInterval);
        assert!(w.create(TimerKind::HiRes, 0, |_| {}).is_ok());
    }

    #[test]
    fn oneshot_fires_once_and_expires() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let id = w.create(TimerKind::OneShot, 0, cb).unwrap();
        w.start(id, 5 * NSEC_PER_MSEC).unwrap();
        clock.advance_ms(4);
        assert_eq!(w.tick(), 0);
        clock.advance_ms(1);
        assert_eq!(w.tick(), 1);
        clock.advance_ms(300);
        assert_eq!(w.tick(), 0);
        assert_eq!(*log.lock(), vec![id]);
        assert_eq!(w.state(id), Some(TimerState::Expired));
        assert_eq!(w.timer_stats(id).unwrap().fire_count, 1);
    }

    #[test]
    fn periodic_rearms_from_now() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let id = w.create(TimerKind::Periodic, 2 * NSEC_PER_MSEC, cb).unwrap();
        w.start(id, 2 * NSEC_PER_MSEC).unwrap();
        for _ in 0..6 {
            clock.advance_ms(1);
            w.tick();
        }
        assert_eq!(log.lock().len(), 3);
        assert_eq!(w.state(id), Some(TimerState::Active));
        assert_eq!(w.expires(id), Some(8 * NSEC_PER_MSEC));
    }

    #[test]
    fn far_expiry_survives_slot_wraparound() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let id = w.create(TimerKind::OneShot, 0, cb).unwrap();
        // 300 ms shares a slot with 44 ms on a 256-slot wheel.
        w.start(id, 300 * NSEC_PER_MSEC).unwrap();
        for _ in 0..299 {
            clock.advance_ms(1);
            w.tick();
        }
        assert!(log.lock().is_empty());
        clock.advance_ms(1);
        w.tick();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn equal_expiries_fire_in_start_order() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let a = w.create(TimerKind::HiRes, 0, cb.clone()).unwrap();
        let b = w.create(TimerKind::OneShot, 0, cb.clone()).unwrap();
        let c = w.create(TimerKind::HiRes, 0, cb).unwrap();
        w.start_at(c, 1_500_000).unwrap();
        w.start_at(a, 1_500_000).unwrap();
        w.start_at(b, 1_500_000).unwrap();
        clock.set_ns(2 * NSEC_PER_MSEC);
        assert_eq!(w.tick(), 3);
        assert_eq!(*log.lock(), vec![c, a, b]);
    }

    #[test]
    fn hires_fires_at_nanosecond_granularity() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let id = w.create(TimerKind::HiRes, 0, cb).unwrap();
        w.start(id, 1_000).unwrap();
        clock.advance_ns(999);
        assert_eq!(w.tick(), 0);
        clock.advance_ns(1);
        assert_eq!(w.tick(), 1);
        assert_eq!(*log.lock(), vec![id]);
    }

    #[test]
    fn stop_removes_and_delete_frees() {
        let (w, clock) = wheel();
        let (log, cb) = recorder();
        let id = w.create(TimerKind::OneShot, 0, cb).unwrap();
        w.start(id, NSEC_PER_MSEC).unwrap();
        w.stop(id).unwrap();
        assert_eq!(w.state(id), Some(TimerState::Inactive));
        assert_eq!(w.stats().wheel_len, 0);
        clock.advance_ms(5);
        w.tick();
        assert!(log.lock().is_empty());
        w.delete(id).unwrap();
        assert_eq!(w.stop(id), Err(TimerError::NotFound));
        assert_eq!(w.start(id, 1), Err(TimerError::NotFound));
    }

    #[test]
    fn stop_from_own_callback_prevents_rearm() {
        let (w, clock) = wheel();
        let fires = Arc::new(AtomicU64::new(0));
        let weak = Arc::downgrade(&w);
        let counter = fires.clone();
        let id = w
            .create(TimerKind::Periodic, NSEC_PER_MSEC, move |id| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(w) = weak.upgrade() {
                    w.stop(id).unwrap();
                }
            })
            .unwrap();
        w.start(id, NSEC_PER_MSEC).unwrap();
        for _ in 0..5 {
            clock.advance_ms(1);
            w.tick();
        }
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(w.state(id), Some(TimerState::Inactive));
        assert!(w.check_invariants());
    }

    #[test]
    fn delete_from_own_callback_is_tolerated() {
        let (w, clock) = wheel();
        let weak = Arc::downgrade(&w);
        let id = w
            .create(TimerKind::Periodic, NSEC_PER_MSEC, move |id| {
                if let Some(w) = weak.upgrade() {
                    w.delete(id).unwrap();
                }
            })
            .unwrap();
        w.start(id, 0).unwrap();
        w.tick();
        clock.advance_ms(3);
        assert_eq!(w.tick(), 0);
        assert_eq!(w.stats().timers, 0);
    }

    #[test]
    fn ticker_thread_fires_on_the_host_clock() {
        let clock = Arc::new(kos_abi::time::MonotonicClock::new());
        let w = TimerWheel::new(&TimerConfig::default(), TimeKeeper::new(clock));
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let id = w
            .create(TimerKind::OneShot, 0, move |id| {
                let _ = tx.lock().send(id);
            })
            .unwrap();
        w.start(id, 2 * NSEC_PER_MSEC).unwrap();
        w.start_ticker().unwrap();
        assert_eq!(w.start_ticker(), Err(TimerError::Already));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);
        w.shutdown();
        assert!(!w.is_running());
    }

    proptest! {
        #[test]
        fn placement_invariant_holds(ops in proptest::collection::vec((0u8..4, 0usize..8, 0u64..600), 1..80)) {
            let (w, clock) = wheel();
            let ids: Vec<TimerId> = (0..8)
                .map(|i| {
                    let kind = match i % 3 {
                        0 => TimerKind::OneShot,
                        1 => TimerKind::Periodic,
                        _ => TimerKind::HiRes,
                    };
                    w.create(kind, NSEC_PER_MSEC * (1 + i as u64), |_| {}).unwrap()
                })
                .collect();
            for (op, idx, arg) in ops {
                let id = ids[idx];
                match op {
                    0 => { let _ = w.start(id, arg * 100_000); }
                    1 => { let _ = w.stop(id); }
                    2 => { clock.advance_ns(arg * 50_000); w.tick(); }
                    _ => { let _ = w.start_at(id, arg * 1_000); }
                }
                prop_assert!(w.check_invariants());
            }
        }
    }
}
