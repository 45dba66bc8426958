// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: IRQ registry: priority ordered handler chains, threaded handlers,
//! per-handler statistics and the IRQ-to-CPU balancer
//! OWNERS: @kernel-team
//! PUBLIC API: IrqRegistry (register_named/unregister/dispatch/balance), IrqFlags, IrqReturn
//! INVARIANTS:
//!   - An IRQ is Active iff its chain is non-empty (Disabled masks an Active IRQ)
//!   - A threaded IRQ has exactly one servicing thread while it has handlers
//!   - Chains run in ascending priority; equal priorities keep registration order
//!   - Handlers never run with a descriptor lock held
//!   - Rebalancing only changes where the next dispatch is accounted

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use kos_abi::Errno;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use crate::config::{BalancePolicy, IrqConfig};

/// Number of IRQ lines.
pub const NR_IRQS: u32 = 256;

bitflags! {
    /// Registration flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line may carry several handlers; every handler must set it.
        const SHARED = 1 << 0;
        /// Run the chain on a dedicated thread instead of the dispatcher.
        const THREADED = 1 << 1;
        /// Keep the current CPU when the balancer runs.
        const NO_BALANCE = 1 << 2;
    }
}

/// Handler verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IrqReturn {
    /// The device behind this handler raised the interrupt.
    Handled,
    /// Not ours.
    NotHandled,
}

/// Descriptor state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IrqState {
    /// No handlers.
    Inactive,
    /// Handlers registered, line unmasked.
    Active,
    /// Masked by `disable`.
    Disabled,
}

/// Handle returned by registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct HandlerId(u64);

/// Errors reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IrqError {
    /// IRQ number outside `0..NR_IRQS`.
    #[error("invalid irq {0}")]
    Invalid(u32),
    /// Line already claimed without `SHARED` on both sides.
    #[error("irq busy")]
    Busy,
    /// Unknown handler.
    #[error("no such handler")]
    NotFound,
    /// Balancer already running.
    #[error("balancer already running")]
    Already,
    /// Worker thread could not be spawned.
    #[error("cannot spawn irq thread")]
    Spawn,
}

impl IrqError {
    /// Errno equivalent.
    pub const fn errno(self) -> Errno {
        match self {
            Self::Invalid(_) => Errno::EINVAL,
            Self::Busy | Self::Already => Errno::EBUSY,
            Self::NotFound => Errno::ENOENT,
            Self::Spawn => Errno::EAGAIN,
        }
    }
}

/// Handler callback; receives the IRQ number.
pub type IrqHandlerFn = Arc<dyn Fn(u32) -> IrqReturn + Send + Sync>;

struct Handler {
    id: HandlerId,
    name: String,
    priority: i32,
    func: IrqHandlerFn,
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Handler {
    fn call(&self, irq: u32) -> IrqReturn {
        let started = Instant::now();
        let verdict = (self.func)(irq);
        let took = started.elapsed().as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(took, Ordering::Relaxed);
        self.max_ns.fetch_max(took, Ordering::Relaxed);
        verdict
    }
}

fn run_chain(irq: u32, chain: &[Arc<Handler>]) -> IrqReturn {
    let mut verdict = IrqReturn::NotHandled;
    for h in chain {
        if h.call(irq) == IrqReturn::Handled {
            verdict = IrqReturn::Handled;
        }
    }
    verdict
}

#[derive(Default)]
struct Wake {
    pending: u64,
    stop: bool,
}

struct IrqThread {
    wake: Arc<(Mutex<Wake>, Condvar)>,
    join: JoinHandle<()>,
}

impl IrqThread {
    fn stop(self) {
        {
            let (lock, cv) = &*self.wake;
            lock.lock().stop = true;
            cv.notify_all();
        }
        if self.join.join().is_err() {
            kos_diag::kwarn!("irq: handler thread panicked");
        }
    }
}

struct Desc {
    state: IrqState,
    flags: IrqFlags,
    chain: Vec<Arc<Handler>>,
    thread: Option<IrqThread>,
    cpu: u32,
    count: u64,
    unhandled: u64,
    masked: u64,
    window: u64,
    per_cpu: Vec<u64>,
}

impl Desc {
    fn new(nr_cpus: u32) -> Self {
        Self {
            state: IrqState::Inactive,
            flags: IrqFlags::empty(),
            chain: Vec::new(),
            thread: None,
            cpu: 0,
            count: 0,
            unhandled: 0,
            masked: 0,
            window: 0,
            per_cpu: vec![0; nr_cpus as usize],
        }
    }
}

/// Per-handler snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    /// Handle.
    pub id: HandlerId,
    /// Name given at registration.
    pub name: String,
    /// Chain position key.
    pub priority: i32,
    /// Invocations.
    pub count: u64,
    /// Cumulative service time.
    pub total_ns: u64,
    /// Longest single invocation.
    pub max_ns: u64,
}

/// Per-IRQ snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IrqInfo {
    /// Line number.
    pub irq: u32,
    /// Descriptor state.
    pub state: IrqState,
    /// Served by a dedicated thread.
    pub threaded: bool,
    /// Target CPU.
    pub cpu: u32,
    /// Dispatches accepted.
    pub count: u64,
    /// Dispatches no handler claimed.
    pub unhandled: u64,
    /// Dispatches dropped while disabled or inactive.
    pub masked: u64,
    /// Dispatches accounted per CPU.
    pub per_cpu: Vec<u64>,
    /// Chain in run order.
    pub handlers: Vec<HandlerInfo>,
}

/// Registry-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IrqStats {
    /// Dispatch calls.
    pub dispatched: u64,
    /// Dispatches that started while another was running.
    pub nested: u64,
    /// Deepest nesting observed.
    pub max_depth: u32,
    /// Balancer passes.
    pub balance_runs: u64,
    /// CPU reassignments made by the balancer.
    pub migrations: u64,
}

/// The IRQ table.
pub struct IrqRegistry {
    config: IrqConfig,
    descs: Vec<Arc<Mutex<Desc>>>,
    next_handler: AtomicU64,
    depth: AtomicU32,
    max_depth: AtomicU32,
    nested: AtomicU64,
    dispatched: AtomicU64,
    balance_runs: AtomicU64,
    migrations: AtomicU64,
    running: AtomicBool,
    balancer_wake: Arc<(Mutex<bool>, Condvar)>,
    balancer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IrqRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqRegistry")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl IrqRegistry {
    /// Builds a registry with every line inactive on CPU 0.
    pub fn new(config: IrqConfig) -> Arc<Self> {
        let nr_cpus = config.nr_cpus.max(1);
        log::info!("irq: {} lines, {} cpus, policy {:?}", NR_IRQS, nr_cpus, config.balance_policy);
        Arc::new(Self {
            descs: (0..NR_IRQS).map(|_| Arc::new(Mutex::new(Desc::new(nr_cpus)))).collect(),
            config: IrqConfig { nr_cpus, ..config },
            next_handler: AtomicU64::new(1),
            depth: AtomicU32::new(0),
            max_depth: AtomicU32::new(0),
            nested: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            balance_runs: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            running: AtomicBool::new(false),
            balancer_wake: Arc::new((Mutex::new(false), Condvar::new())),
            balancer: Mutex::new(None),
        })
    }

    fn desc(&self, irq: u32) -> Result<&Arc<Mutex<Desc>>, IrqError> {
        self.descs.get(irq as usize).ok_or(IrqError::Invalid(irq))
    }

    /// Adds `handler` to the chain of `irq`, ordered by `priority`.
    pub fn register_named<F>(
        &self,
        irq: u32,
        name: &str,
        priority: i32,
        flags: IrqFlags,
        handler: F,
    ) -> Result<HandlerId, IrqError>
    where
        F: Fn(u32) -> IrqReturn + Send + Sync + 'static,
    {
        let desc = self.desc(irq)?;
        let mut d = desc.lock();
        if !d.chain.is_empty() && !(d.flags.contains(IrqFlags::SHARED) && flags.contains(IrqFlags::SHARED)) {
            log::debug!("irq {}: {} refused, line busy", irq, name);
            return Err(IrqError::Busy);
        }
        if flags.contains(IrqFlags::THREADED) && d.thread.is_none() {
            d.thread = Some(spawn_irq_thread(irq, desc.clone())?);
        }
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Handler {
            id,
            name: name.to_string(),
            priority,
            func: Arc::new(handler),
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        });
        let pos = d.chain.iter().position(|h| h.priority > priority).unwrap_or(d.chain.len());
        d.chain.insert(pos, entry);
        d.flags |= flags;
        if d.state == IrqState::Inactive {
            d.state = IrqState::Active;
        }
        log::debug!("irq {}: registered {} (prio {}, {:?})", irq, name, priority, flags);
        Ok(id)
    }

    /// Removes a handler; the last removal deactivates the line and stops
    /// its thread.
    pub fn unregister(&self, irq: u32, id: HandlerId) -> Result<(), IrqError> {
        let desc = self.desc(irq)?;
        let thread = {
            let mut d = desc.lock();
            let pos = d.chain.iter().position(|h| h.id == id).ok_or(IrqError::NotFound)?;
            let removed = d.chain.remove(pos);
            log::debug!("irq {}: unregistered {}", irq, removed.name);
            if d.chain.is_empty() {
                d.state = IrqState::Inactive;
                d.flags = IrqFlags::empty();
                d.thread.take()
            } else {
                None
            }
        };
        if let Some(t) = thread {
            t.stop();
        }
        Ok(())
    }

    /// Masks `irq`; dispatches are counted and dropped.
    pub fn disable(&self, irq: u32) -> Result<(), IrqError> {
        let mut d = self.desc(irq)?.lock();
        if d.state == IrqState::Active {
            d.state = IrqState::Disabled;
        }
        Ok(())
    }

    /// Unmasks `irq`.
    pub fn enable(&self, irq: u32) -> Result<(), IrqError> {
        let mut d = self.desc(irq)?.lock();
        if d.state == IrqState::Disabled {
            d.state = IrqState::Active;
        }
        Ok(())
    }

    /// Delivers one interrupt on `irq`. Threaded lines only wake their
    /// thread and report `Handled`.
    pub fn dispatch(&self, irq: u32) -> Result<IrqReturn, IrqError> {
        let desc = self.desc(irq)?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let (chain, wake) = {
            let mut d = desc.lock();
            if d.state != IrqState::Active {
                d.masked += 1;
                return Ok(IrqReturn::NotHandled);
            }
            d.count += 1;
            d.window += 1;
            let cpu = d.cpu as usize;
            if let Some(slot) = d.per_cpu.get_mut(cpu) {
                *slot += 1;
            }
            (d.chain.clone(), d.thread.as_ref().map(|t| t.wake.clone()))
        };
        if let Some(wake) = wake {
            let (lock, cv) = &*wake;
            lock.lock().pending += 1;
            cv.notify_one();
            return Ok(IrqReturn::Handled);
        }

        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > 1 {
            self.nested.fetch_add(1, Ordering::Relaxed);
        }
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        let verdict = run_chain(irq, &chain);
        self.depth.fetch_sub(1, Ordering::AcqRel);
        if verdict == IrqReturn::NotHandled {
            desc.lock().unhandled += 1;
            log::trace!("irq {}: unhandled", irq);
        }
        Ok(verdict)
    }

    /// Current dispatch nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// CPU `irq` is routed to.
    pub fn cpu(&self, irq: u32) -> Result<u32, IrqError> {
        Ok(self.desc(irq)?.lock().cpu)
    }

    /// Pins `irq` to `cpu` (taken modulo the CPU count).
    pub fn set_affinity(&self, irq: u32, cpu: u32) -> Result<(), IrqError> {
        let mut d = self.desc(irq)?.lock();
        d.cpu = cpu % self.config.nr_cpus;
        Ok(())
    }

    /// Snapshot of one line.
    pub fn info(&self, irq: u32) -> Result<IrqInfo, IrqError> {
        let d = self.desc(irq)?.lock();
        Ok(IrqInfo {
            irq,
            state: d.state,
            threaded: d.thread.is_some(),
            cpu: d.cpu,
            count: d.count,
            unhandled: d.unhandled,
            masked: d.masked,
            per_cpu: d.per_cpu.clone(),
            handlers: d
                .chain
                .iter()
                .map(|h| HandlerInfo {
                    id: h.id,
                    name: h.name.clone(),
                    priority: h.priority,
                    count: h.count.load(Ordering::Relaxed),
                    total_ns: h.total_ns.load(Ordering::Relaxed),
                    max_ns: h.max_ns.load(Ordering::Relaxed),
                })
                .collect(),
        })
    }

    /// Lines that currently have handlers.
    pub fn active_irqs(&self) -> Vec<u32> {
        (0..NR_IRQS).filter(|&irq| self.descs[irq as usize].lock().state != IrqState::Inactive).collect()
    }

    /// Registry counters.
    pub fn stats(&self) -> IrqStats {
        IrqStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            nested: self.nested.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
            balance_runs: self.balance_runs.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
        }
    }

    /// One balancer pass under the configured policy; returns how many
    /// lines moved.
    pub fn balance(&self) -> usize {
        self.balance_with(self.config.balance_policy)
    }

    /// One balancer pass under `policy`.
    pub fn balance_with(&self, policy: BalancePolicy) -> usize {
        let nr_cpus = self.config.nr_cpus;
        // (irq, load since last pass, current cpu)
        let mut lines: Vec<(u32, u64, u32)> = Vec::new();
        for irq in 0..NR_IRQS {
            let mut d = self.descs[irq as usize].lock();
            if d.state == IrqState::Inactive || d.flags.contains(IrqFlags::NO_BALANCE) {
                continue;
            }
            lines.push((irq, d.window, d.cpu));
            d.window = 0;
        }
        self.balance_runs.fetch_add(1, Ordering::Relaxed);

        let plan: Vec<(u32, u32)> = match policy {
            BalancePolicy::None => Vec::new(),
            BalancePolicy::RoundRobin => {
                lines.iter().enumerate().map(|(i, &(irq, _, _))| (irq, i as u32 % nr_cpus)).collect()
            }
            BalancePolicy::LoadBased => plan_by_load(&lines, nr_cpus),
            BalancePolicy::Adaptive => {
                let mut load = vec![0u64; nr_cpus as usize];
                for &(_, w, cpu) in &lines {
                    load[(cpu % nr_cpus) as usize] += w;
                }
                let max = load.iter().copied().max().unwrap_or(0);
                let min = load.iter().copied().min().unwrap_or(0);
                // Within a quarter of the busiest CPU counts as balanced.
                if max - min <= max / 4 {
                    Vec::new()
                } else {
                    plan_by_load(&lines, nr_cpus)
                }
            }
        };

        let mut moved = 0;
        for (irq, cpu) in plan {
            let mut d = self.descs[irq as usize].lock();
            if d.cpu != cpu {
                log::trace!("irq {}: cpu {} -> {}", irq, d.cpu, cpu);
                d.cpu = cpu;
                moved += 1;
            }
        }
        self.migrations.fetch_add(moved as u64, Ordering::Relaxed);
        moved
    }

    /// Spawns the balancer thread; a `none` policy spawns nothing.
    pub fn start_balancer(self: &Arc<Self>) -> Result<(), IrqError> {
        if self.config.balance_policy == BalancePolicy::None {
            log::debug!("irq: balancing disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(IrqError::Already);
        }
        *self.balancer_wake.0.lock() = false;
        let weak: Weak<Self> = Arc::downgrade(self);
        let wake = self.balancer_wake.clone();
        let interval = Duration::from_millis(self.config.balance_interval_ms.max(1));
        let handle = std::thread::Builder::new()
            .name("kos-irq-balance".into())
            .spawn(move || loop {
                {
                    let (lock, cv) = &*wake;
                    let mut stop = lock.lock();
                    if !*stop {
                        cv.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.balance();
            })
            .map_err(|e| {
                log::error!("irq: cannot spawn balancer: {}", e);
                self.running.store(false, Ordering::Release);
                IrqError::Spawn
            })?;
        *self.balancer.lock() = Some(handle);
        log::info!("irq: balancer started ({:?} every {:?})", self.config.balance_policy, interval);
        Ok(())
    }

    /// True while the balancer thread runs.
    pub fn is_balancing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the balancer and every handler thread and clears all chains.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        {
            let (lock, cv) = &*self.balancer_wake;
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.balancer.lock().take() {
            if handle.join().is_err() {
                kos_diag::kwarn!("irq: balancer thread panicked");
            }
        }
        for desc in &self.descs {
            let thread = {
                let mut d = desc.lock();
                d.chain.clear();
                d.state = IrqState::Inactive;
                d.flags = IrqFlags::empty();
                d.thread.take()
            };
            if let Some(t) = thread {
                t.stop();
            }
        }
        log::info!("irq: shut down");
    }
}

fn plan_by_load(lines: &[(u32, u64, u32)], nr_cpus: u32) -> Vec<(u32, u32)> {
    let mut order: Vec<&(u32, u64, u32)> = lines.iter().collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut load = vec![0u64; nr_cpus as usize];
    let mut plan = Vec::with_capacity(order.len());
    for &&(irq, w, _) in &order {
        let mut target = 0usize;
        for (cpu, l) in load.iter().enumerate() {
            if *l < load[target] {
                target = cpu;
            }
        }
        // Idle lines still count so they spread instead of piling on CPU 0.
        load[target] += w.max(1);
        plan.push((irq, target as u32));
    }
    plan
}

fn spawn_irq_thread(irq: u32, desc: Arc<Mutex<Desc>>) -> Result<IrqThread, IrqError> {
    let wake: Arc<(Mutex<Wake>, Condvar)> = Arc::new((Mutex::new(Wake::default()), Condvar::new()));
    let shared = wake.clone();
    let join = std::thread::Builder::new()
        .name(format!("kos-irq/{}", irq))
        .spawn(move || loop {
            let pending = {
                let (lock, cv) = &*shared;
                let mut w = lock.lock();
                while w.pending == 0 && !w.stop {
                    cv.wait(&mut w);
                }
                if w.stop {
                    break;
                }
                std::mem::take(&mut w.pending)
            };
            for _ in 0..pending {
                let chain = desc.lock().chain.clone();
                if run_chain(irq, &chain) == IrqReturn::NotHandled {
                    desc.lock().unhandled += 1;
                }
            }
        })
        .map_err(|e| {
            log::error!("irq {}: cannot spawn handler thread: {}", irq, e);
            IrqError::Spawn
        })?;
    log::debug!("irq {}: handler thread started", irq);
    Ok(IrqThread { wake, join })
}
