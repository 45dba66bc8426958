// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel bring-up, process contexts and the syscall entry point
//! OWNERS: @kernel-team
//! PUBLIC API: boot, boot_with_clock, Kernel, ProcessContext, KernelStats, BootError
//! DEPENDS_ON: timer, irq, sched, syscall, usermem, kos-vfs, kos-net, kos-diag
//! INVARIANTS:
//!   - Every live (non-zombie) process has exactly one ProcessContext
//!   - The scheduler tick reaches the scheduler only through TIMER_IRQ
//!   - shutdown is idempotent and joins every worker thread

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kos_abi::time::{ClockSource, MonotonicClock, RealtimeClock, TimeKeeper, NSEC_PER_MSEC};
use kos_abi::{Credentials, Errno, Pid};
use kos_net::{NetError, NetStack, NetStats};
use kos_vfs::{Vfs, VfsContext, VfsError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, KernelConfig};
use crate::irq::{IrqError, IrqFlags, IrqRegistry, IrqReturn, IrqStats};
use crate::sched::{ProcessState, SchedStats, Scheduler, INIT_PID, SIGKILL};
use crate::syscall::{Args, SysResult, SyscallContext, SyscallCount, SyscallTable};
use crate::timer::{TimerError, TimerId, TimerKind, TimerWheel, WheelStats};
use crate::usermem::{UserMemory, DEFAULT_HEAP_MAX};

/// Line the scheduler tick is raised on.
pub const TIMER_IRQ: u32 = 0;

/// Failures while bringing the kernel up.
#[derive(Debug, Error)]
pub enum BootError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Root filesystem could not be created.
    #[error("vfs: {0}")]
    Vfs(#[from] VfsError),
    /// Network stack could not be created or started.
    #[error("net: {0}")]
    Net(#[from] NetError),
    /// Tick timer could not be armed.
    #[error("timer: {0}")]
    Timer(#[from] TimerError),
    /// Tick line could not be claimed.
    #[error("irq: {0}")]
    Irq(#[from] IrqError),
    /// No usable clock source.
    #[error("no clock source available")]
    NoClock,
}

/// Per-process state the syscall layer works on.
#[derive(Debug)]
pub struct ProcessContext {
    /// Owning process.
    pub pid: Pid,
    /// Descriptor table, cwd, umask and credentials.
    pub vfs: VfsContext,
    /// Simulated address space.
    pub mem: Mutex<UserMemory>,
}

/// Whole-kernel counter snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct KernelStats {
    /// Nanoseconds since boot.
    pub uptime_ns: u64,
    /// Selected clock source.
    pub clock: &'static str,
    /// Processes with a live context.
    pub processes: usize,
    /// Timer wheel.
    pub timers: WheelStats,
    /// IRQ registry.
    pub irqs: IrqStats,
    /// Scheduler.
    pub sched: SchedStats,
    /// Network stack.
    pub net: NetStats,
    /// Syscalls that have been called at least once.
    pub syscalls: Vec<SyscallCount>,
    /// Dispatches with a number outside the table.
    pub syscalls_out_of_range: u64,
}

/// A booted kernel.
pub struct Kernel {
    config: KernelConfig,
    clock: TimeKeeper,
    timers: Arc<TimerWheel>,
    irqs: Arc<IrqRegistry>,
    sched: Arc<Scheduler>,
    vfs: Arc<Vfs>,
    net: Arc<NetStack>,
    syscalls: SyscallTable,
    procs: RwLock<HashMap<Pid, Arc<ProcessContext>>>,
    tick_timer: Mutex<Option<TimerId>>,
    down: AtomicBool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("clock", &self.clock.source_name())
            .field("processes", &self.procs.read().len())
            .field("down", &self.down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Boots with the best available host clock.
pub fn boot(config: KernelConfig) -> Result<Arc<Kernel>, BootError> {
    let candidates: Vec<Arc<dyn ClockSource>> = vec![Arc::new(MonotonicClock::new()), Arc::new(RealtimeClock)];
    let clock = TimeKeeper::select_best(candidates).ok_or(BootError::NoClock)?;
    boot_inner(config, clock)
}

/// Boots on an explicit clock source, typically a `ManualClock` in tests.
pub fn boot_with_clock(config: KernelConfig, source: Arc<dyn ClockSource>) -> Result<Arc<Kernel>, BootError> {
    boot_inner(config, TimeKeeper::new(source))
}

fn boot_inner(config: KernelConfig, clock: TimeKeeper) -> Result<Arc<Kernel>, BootError> {
    config.validate()?;
    kos_diag::configure(config.panic.clone().into());
    log::info!("kos: booting on {}", clock.source_name());

    let timers = TimerWheel::new(&config.timer, clock.clone());
    let irqs = IrqRegistry::new(config.irq.clone());
    let sched = Arc::new(Scheduler::new(config.sched.clone()));
    let vfs = Vfs::with_clock(config.vfs.clone(), clock.source())?;
    let net = NetStack::new(config.net.clone(), clock.source())?;

    let init = Arc::new(ProcessContext {
        pid: INIT_PID,
        vfs: VfsContext::new(vfs.clone(), Credentials::ROOT, INIT_PID),
        mem: Mutex::new(UserMemory::new(DEFAULT_HEAP_MAX)),
    });
    let kernel = Arc::new(Kernel {
        config,
        clock,
        timers,
        irqs,
        sched,
        vfs,
        net,
        syscalls: SyscallTable::with_defaults(),
        procs: RwLock::new(HashMap::from([(INIT_PID, init)])),
        tick_timer: Mutex::new(None),
        down: AtomicBool::new(false),
    });
    if let Err(e) = kernel.start() {
        log::error!("kos: boot failed: {}", e);
        kernel.shutdown();
        return Err(e);
    }
    log::info!("kos: up, {} syscalls registered", kernel.syscalls.registered().len());
    Ok(kernel)
}

impl Kernel {
    fn start(&self) -> Result<(), BootError> {
        let sched = Arc::downgrade(&self.sched);
        self.irqs.register_named(TIMER_IRQ, "sched-tick", 0, IrqFlags::NO_BALANCE, move |_| {
            match sched.upgrade() {
                Some(s) => {
                    s.tick();
                    IrqReturn::Handled
                }
                None => IrqReturn::NotHandled,
            }
        })?;

        let irqs: Weak<IrqRegistry> = Arc::downgrade(&self.irqs);
        let period = self.config.sched.tick_ms.max(1) * NSEC_PER_MSEC;
        let tick = self.timers.create(TimerKind::Periodic, period, move |_| {
            if let Some(r) = irqs.upgrade() {
                if let Err(e) = r.dispatch(TIMER_IRQ) {
                    log::warn!("kos: tick dispatch failed: {}", e);
                }
            }
        })?;
        self.timers.start(tick, period)?;
        *self.tick_timer.lock() = Some(tick);

        self.net.start()?;
        if self.config.timer.autostart_ticker {
            self.timers.start_ticker()?;
        }
        self.irqs.start_balancer()?;
        Ok(())
    }

    /// Configuration the kernel booted with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Boot-relative clock.
    pub fn clock(&self) -> &TimeKeeper {
        &self.clock
    }

    /// Timer wheel.
    pub fn timers(&self) -> &Arc<TimerWheel> {
        &self.timers
    }

    /// IRQ registry.
    pub fn irqs(&self) -> &Arc<IrqRegistry> {
        &self.irqs
    }

    /// Scheduler.
    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Filesystem.
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Network stack.
    pub fn net(&self) -> &Arc<NetStack> {
        &self.net
    }

    /// Syscall table.
    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    /// Context of a live process.
    pub fn process(&self, pid: Pid) -> Option<Arc<ProcessContext>> {
        self.procs.read().get(&pid).cloned()
    }

    /// Pids with a live context, ascending.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.procs.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Starts a fresh child of init running as `cred`, with an empty
    /// address space and no open files.
    pub fn spawn_process(&self, name: &str, cred: Credentials) -> SysResult<Pid> {
        let pid = self.sched.fork(INIT_PID)?;
        self.sched.set_name(pid, name)?;
        let ctx = Arc::new(ProcessContext {
            pid,
            vfs: VfsContext::new(self.vfs.clone(), cred, pid),
            mem: Mutex::new(UserMemory::new(DEFAULT_HEAP_MAX)),
        });
        self.procs.write().insert(pid, ctx);
        log::debug!("kos: spawned {} as pid {} (uid {})", name, pid, cred.uid);
        Ok(pid)
    }

    /// Duplicates `parent`: scheduler record, descriptor table and memory.
    pub fn fork(&self, parent: Pid) -> SysResult<Pid> {
        let pctx = self.process(parent).ok_or(Errno::ESRCH)?;
        let pid = self.sched.fork(parent)?;
        let ctx = Arc::new(ProcessContext {
            pid,
            vfs: pctx.vfs.fork(pid),
            mem: Mutex::new(pctx.mem.lock().clone()),
        });
        self.procs.write().insert(pid, ctx);
        Ok(pid)
    }

    /// Ends `pid` with `code`. Its context is dropped, which closes its
    /// files and releases its locks.
    pub fn exit_process(&self, pid: Pid, code: i32) -> SysResult<()> {
        if pid == INIT_PID {
            return Err(Errno::EPERM.into());
        }
        self.sched.exit(pid, code)?;
        self.procs.write().remove(&pid);
        Ok(())
    }

    /// Sends `sig` to `pid`; a process killed outright loses its context.
    pub fn kill(&self, pid: Pid, sig: u32) -> SysResult<()> {
        if pid == INIT_PID && sig == SIGKILL {
            return Err(Errno::EPERM.into());
        }
        self.sched.kill(pid, sig)?;
        let gone = self.sched.process(pid).map(|p| p.state == ProcessState::Zombie).unwrap_or(true);
        if gone {
            self.procs.write().remove(&pid);
        }
        Ok(())
    }

    /// Runs syscall `nr` on behalf of `pid`'s main thread. Negative results
    /// are negated errnos.
    pub fn syscall(&self, pid: Pid, nr: u32, regs: [u64; 6]) -> i64 {
        if self.down.load(Ordering::Acquire) {
            return Errno::ESRCH.as_neg();
        }
        let Some(process) = self.process(pid) else {
            return Errno::ESRCH.as_neg();
        };
        let tid = match self.sched.main_thread(pid) {
            Ok(tid) => tid,
            Err(e) => return e.errno().as_neg(),
        };
        let ctx = SyscallContext { kernel: self, pid, tid, process };
        self.syscalls.dispatch(nr, &ctx, &Args::new(regs))
    }

    /// Raises `irq` as if the hardware had.
    pub fn raise_irq(&self, irq: u32) -> Result<IrqReturn, IrqError> {
        self.irqs.dispatch(irq)
    }

    /// Runs one timer pass by hand; returns the callbacks fired.
    pub fn tick(&self) -> usize {
        self.timers.tick()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            uptime_ns: self.clock.now_ns(),
            clock: self.clock.source_name(),
            processes: self.procs.read().len(),
            timers: self.timers.stats(),
            irqs: self.irqs.stats(),
            sched: self.sched.stats(),
            net: self.net.stats(),
            syscalls: self.syscalls.counts(),
            syscalls_out_of_range: self.syscalls.out_of_range(),
        }
    }

    /// [`Kernel::stats`] as pretty JSON.
    pub fn stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.stats())
    }

    /// True once [`Kernel::shutdown`] ran.
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Stops every worker and drops every process context. Later calls
    /// do nothing.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("kos: shutting down");
        self.timers.shutdown();
        self.irqs.shutdown();
        self.net.shutdown();
        self.tick_timer.lock().take();
        let procs = std::mem::take(&mut *self.procs.write());
        log::info!("kos: released {} process contexts", procs.len());
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
