// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler and process/thread tables
//! OWNERS: @kernel-team
//! PUBLIC API: Scheduler (tick/schedule/yield_now, create_thread/destroy_thread,
//!   fork/exit/wait4/kill), ExitStatus, WaitTarget
//! INVARIANTS:
//!   - Ready queue is FIFO and only holds threads in state Ready
//!   - At most one thread is Running; it is not in the ready queue
//!   - A zombie owns no threads; its children are reparented to init
//!   - PIDs and TIDs are never reused while the kernel runs

use std::collections::{BTreeMap, VecDeque};

use kos_abi::{Errno, Pid, Tid};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use crate::config::SchedConfig;

/// Pid of the first process; orphans are reparented to it.
pub const INIT_PID: Pid = 1;
/// Highest stack address handed to threads.
pub const STACK_TOP: u64 = 0x7fff_f000_0000;
/// Number of signals.
pub const NSIG: u32 = 64;
/// Uncatchable termination.
pub const SIGKILL: u32 = 9;
/// Sent to a parent when a child exits.
pub const SIGCHLD: u32 = 17;

/// Errors returned by scheduler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedError {
    /// No such process.
    #[error("no such process {0}")]
    NoSuchProcess(Pid),
    /// No such thread.
    #[error("no such thread {0}")]
    NoSuchThread(Tid),
    /// Caller has no child matching the wait target.
    #[error("no child processes")]
    NoChildren,
    /// Signal number outside `0..NSIG`.
    #[error("invalid signal {0}")]
    InvalidSignal(u32),
    /// Thread limit reached.
    #[error("thread limit reached")]
    Again,
}

impl SchedError {
    /// Errno equivalent.
    pub const fn errno(self) -> Errno {
        match self {
            Self::NoSuchProcess(_) | Self::NoSuchThread(_) => Errno::ESRCH,
            Self::NoChildren => Errno::ECHILD,
            Self::InvalidSignal(_) => Errno::EINVAL,
            Self::Again => Errno::EAGAIN,
        }
    }
}

/// Thread state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    /// Waiting in the ready queue.
    Ready,
    /// Installed as current.
    Running,
    /// Off the ready queue until woken.
    Blocked,
}

/// Process state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// Has live threads.
    Running,
    /// Exited, waiting to be reaped.
    Zombie,
}

/// How a process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExitStatus {
    /// `exit(code)`.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(u32),
}

impl ExitStatus {
    /// Encoding written through `wait4`'s status pointer.
    pub const fn wait_status(self) -> i32 {
        match self {
            Self::Exited(code) => (code & 0xff) << 8,
            Self::Signaled(sig) => (sig & 0x7f) as i32,
        }
    }
}

/// Which children `wait4` considers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTarget {
    /// Any child.
    Any,
    /// One specific child.
    Pid(Pid),
}

/// Stack reservation of a thread; the guard sits directly below `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StackRegion {
    /// Lowest usable address.
    pub base: u64,
    /// Usable bytes.
    pub size: u64,
    /// Unmapped bytes below `base`.
    pub guard: u64,
}

impl StackRegion {
    /// Initial stack pointer.
    pub const fn top(&self) -> u64 {
        self.base + self.size
    }

    /// True when `addr` falls into the guard.
    pub const fn in_guard(&self, addr: u64) -> bool {
        addr < self.base && addr >= self.base - self.guard
    }
}

/// Thread snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    /// Thread id.
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    /// State.
    pub state: ThreadState,
    /// Ticks consumed in the current slice.
    pub runtime: u64,
    /// Ticks consumed in total.
    pub total_runtime: u64,
    /// Stack reservation.
    pub stack: StackRegion,
}

/// Process snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: Pid,
    /// Parent id.
    pub ppid: Pid,
    /// Command name.
    pub name: String,
    /// State.
    pub state: ProcessState,
    /// Set once the process is a zombie.
    pub exit: Option<ExitStatus>,
    /// Live and zombie children.
    pub children: Vec<Pid>,
    /// Threads, main thread first.
    pub threads: Vec<Tid>,
    /// Pending signal bitmap; bit `n` is signal `n`.
    pub pending_signals: u64,
}

/// Scheduler counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedStats {
    /// Ticks seen.
    pub ticks: u64,
    /// Times a new thread was installed as current.
    pub context_switches: u64,
    /// Timeslice expiries.
    pub preemptions: u64,
    /// Successful forks.
    pub forks: u64,
    /// Processes that exited.
    pub exits: u64,
    /// Threads waiting in the ready queue.
    pub ready: usize,
    /// Live threads.
    pub threads: usize,
    /// Process records, zombies included.
    pub processes: usize,
}

struct Thread {
    pid: Pid,
    state: ThreadState,
    runtime: u64,
    total_runtime: u64,
    stack: StackRegion,
}

struct Process {
    ppid: Pid,
    name: String,
    state: ProcessState,
    exit: Option<ExitStatus>,
    children: Vec<Pid>,
    threads: Vec<Tid>,
    pending_signals: u64,
}

struct Inner {
    procs: BTreeMap<Pid, Process>,
    threads: BTreeMap<Tid, Thread>,
    ready: VecDeque<Tid>,
    current: Option<Tid>,
    next_pid: Pid,
    next_tid: Tid,
    stack_cursor: u64,
    free_stacks: Vec<StackRegion>,
    stats: SchedStats,
}

impl Inner {
    fn alloc_stack(&mut self, size: u64, guard: u64) -> StackRegion {
        if let Some(region) = self.free_stacks.pop() {
            return region;
        }
        self.stack_cursor -= size + guard;
        StackRegion { base: self.stack_cursor + guard, size, guard }
    }

    fn add_thread(&mut self, pid: Pid, size: u64, guard: u64) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        let stack = self.alloc_stack(size, guard);
        self.threads.insert(tid, Thread { pid, state: ThreadState::Ready, runtime: 0, total_runtime: 0, stack });
        self.ready.push_back(tid);
        if let Some(p) = self.procs.get_mut(&pid) {
            p.threads.push(tid);
        }
        log::trace!("sched: tid {} (pid {}) stack {:#x}+{:#x}", tid, pid, stack.base, stack.size);
        tid
    }

    fn drop_thread(&mut self, tid: Tid) -> Option<Thread> {
        let thread = self.threads.remove(&tid)?;
        self.ready.retain(|t| *t != tid);
        if self.current == Some(tid) {
            self.current = None;
        }
        if let Some(p) = self.procs.get_mut(&thread.pid) {
            p.threads.retain(|t| *t != tid);
        }
        self.free_stacks.push(thread.stack);
        Some(thread)
    }

    fn install_next(&mut self) -> Option<Tid> {
        if self.current.is_some() {
            return self.current;
        }
        while let Some(tid) = self.ready.pop_front() {
            let Some(t) = self.threads.get_mut(&tid) else {
                continue;
            };
            kos_diag::kassert!(t.state == ThreadState::Ready, "sched: tid {} queued while {:?}", tid, t.state);
            t.state = ThreadState::Running;
            self.current = Some(tid);
            self.stats.context_switches += 1;
            return Some(tid);
        }
        None
    }

    fn terminate(&mut self, pid: Pid, status: ExitStatus) -> Result<(), SchedError> {
        let proc = self.procs.get(&pid).ok_or(SchedError::NoSuchProcess(pid))?;
        if proc.state == ProcessState::Zombie {
            return Ok(());
        }
        let threads = proc.threads.clone();
        for tid in threads {
            self.drop_thread(tid);
        }
        let (ppid, children) = match self.procs.get_mut(&pid) {
            Some(p) => {
                p.state = ProcessState::Zombie;
                p.exit = Some(status);
                (p.ppid, std::mem::take(&mut p.children))
            }
            None => return Err(SchedError::NoSuchProcess(pid)),
        };
        if pid != INIT_PID {
            for child in &children {
                if let Some(c) = self.procs.get_mut(child) {
                    c.ppid = INIT_PID;
                }
            }
            if let Some(init) = self.procs.get_mut(&INIT_PID) {
                init.children.extend(children);
            }
        }
        if let Some(parent) = self.procs.get_mut(&ppid) {
            parent.pending_signals |= 1 << SIGCHLD;
        }
        self.stats.exits += 1;
        log::debug!("sched: pid {} exited {:?}", pid, status);
        Ok(())
    }
}

/// Process/thread tables plus the global FIFO ready queue.
pub struct Scheduler {
    config: SchedConfig,
    inner: Mutex<Inner>,
    child_exit: Condvar,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("config", &self.config).field("stats", &self.stats()).finish()
    }
}

impl Scheduler {
    /// Creates the tables with `init` (pid 1) running on its main thread.
    pub fn new(config: SchedConfig) -> Self {
        let mut inner = Inner {
            procs: BTreeMap::new(),
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            current: None,
            next_pid: INIT_PID,
            next_tid: 1,
            stack_cursor: STACK_TOP,
            free_stacks: Vec::new(),
            stats: SchedStats::default(),
        };
        inner.procs.insert(
            INIT_PID,
            Process {
                ppid: 0,
                name: "init".into(),
                state: ProcessState::Running,
                exit: None,
                children: Vec::new(),
                threads: Vec::new(),
                pending_signals: 0,
            },
        );
        inner.next_pid = INIT_PID + 1;
        inner.add_thread(INIT_PID, config.stack_size, config.guard_size);
        inner.install_next();
        log::info!("sched: timeslice {} ticks, init running", config.timeslice_ms);
        Self { config, inner: Mutex::new(inner), child_exit: Condvar::new() }
    }

    /// Configuration in use.
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Thread installed as current.
    pub fn current(&self) -> Option<Tid> {
        self.inner.lock().current
    }

    /// Counts one tick against the current thread, preempting it when its
    /// slice is used up. Returns the preempted thread.
    pub fn tick(&self) -> Option<Tid> {
        let mut inner = self.inner.lock();
        inner.stats.ticks += 1;
        let Some(tid) = inner.current else {
            inner.install_next();
            return None;
        };
        let timeslice = self.config.timeslice_ms.max(1);
        let Some(t) = inner.threads.get_mut(&tid) else {
            kos_diag::kpanic!("sched: current tid {} missing from thread table", tid);
        };
        t.runtime += 1;
        t.total_runtime += 1;
        if t.runtime < timeslice {
            return None;
        }
        t.runtime = 0;
        t.state = ThreadState::Ready;
        inner.ready.push_back(tid);
        inner.current = None;
        inner.stats.preemptions += 1;
        inner.install_next();
        Some(tid)
    }

    /// Installs the ready-queue head when nothing runs; returns current.
    pub fn schedule(&self) -> Option<Tid> {
        self.inner.lock().install_next()
    }

    /// Moves `tid` (if current) to the back of the queue and schedules.
    pub fn yield_now(&self, tid: Tid) -> Result<Option<Tid>, SchedError> {
        let mut inner = self.inner.lock();
        let t = inner.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread(tid))?;
        if t.state == ThreadState::Running {
            t.state = ThreadState::Ready;
            t.runtime = 0;
            inner.ready.push_back(tid);
            inner.current = None;
        }
        Ok(inner.install_next())
    }

    /// Takes `tid` off the ready queue until [`wake`](Self::wake).
    pub fn block(&self, tid: Tid) -> Result<(), SchedError> {
        let mut inner = self.inner.lock();
        let t = inner.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread(tid))?;
        t.state = ThreadState::Blocked;
        inner.ready.retain(|x| *x != tid);
        if inner.current == Some(tid) {
            inner.current = None;
        }
        Ok(())
    }

    /// Returns a blocked thread to the ready queue.
    pub fn wake(&self, tid: Tid) -> Result<(), SchedError> {
        let mut inner = self.inner.lock();
        let t = inner.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread(tid))?;
        if t.state == ThreadState::Blocked {
            t.state = ThreadState::Ready;
            inner.ready.push_back(tid);
        }
        Ok(())
    }

    /// Adds a thread to `pid` and queues it.
    pub fn create_thread(&self, pid: Pid) -> Result<Tid, SchedError> {
        let mut inner = self.inner.lock();
        match inner.procs.get(&pid) {
            Some(p) if p.state == ProcessState::Running => {}
            _ => return Err(SchedError::NoSuchProcess(pid)),
        }
        if inner.threads.len() >= self.config.max_threads {
            return Err(SchedError::Again);
        }
        Ok(inner.add_thread(pid, self.config.stack_size, self.config.guard_size))
    }

    /// Removes a thread and releases its stack. The last thread leaving a
    /// process exits it with status 0.
    pub fn destroy_thread(&self, tid: Tid) -> Result<(), SchedError> {
        let mut inner = self.inner.lock();
        let thread = inner.drop_thread(tid).ok_or(SchedError::NoSuchThread(tid))?;
        let orphaned = inner.procs.get(&thread.pid).map(|p| p.threads.is_empty()).unwrap_or(false);
        if orphaned {
            inner.terminate(thread.pid, ExitStatus::Exited(0))?;
            drop(inner);
            self.child_exit.notify_all();
        }
        Ok(())
    }

    /// Duplicates `parent` into a new process with one ready thread.
    pub fn fork(&self, parent: Pid) -> Result<Pid, SchedError> {
        let mut inner = self.inner.lock();
        if inner.threads.len() >= self.config.max_threads {
            return Err(SchedError::Again);
        }
        let name = match inner.procs.get(&parent) {
            Some(p) if p.state == ProcessState::Running => p.name.clone(),
            _ => return Err(SchedError::NoSuchProcess(parent)),
        };
        let pid = inner.next_pid;
        inner.next_pid += 1;
        inner.procs.insert(
            pid,
            Process {
                ppid: parent,
                name,
                state: ProcessState::Running,
                exit: None,
                children: Vec::new(),
                threads: Vec::new(),
                pending_signals: 0,
            },
        );
        if let Some(p) = inner.procs.get_mut(&parent) {
            p.children.push(pid);
        }
        inner.add_thread(pid, self.config.stack_size, self.config.guard_size);
        inner.stats.forks += 1;
        log::debug!("sched: fork {} -> {}", parent, pid);
        Ok(pid)
    }

    /// Renames a process (`exec` stand-in for the command name).
    pub fn set_name(&self, pid: Pid, name: &str) -> Result<(), SchedError> {
        let mut inner = self.inner.lock();
        let p = inner.procs.get_mut(&pid).ok_or(SchedError::NoSuchProcess(pid))?;
        p.name = name.to_string();
        Ok(())
    }

    /// Turns `pid` into a zombie with `exit(code)`.
    pub fn exit(&self, pid: Pid, code: i32) -> Result<(), SchedError> {
        self.inner.lock().terminate(pid, ExitStatus::Exited(code))?;
        self.child_exit.notify_all();
        Ok(())
    }

    /// Reaps a zombie child of `parent`. With `nohang` an unfinished child
    /// yields `Ok(None)`; otherwise the call blocks until one exits.
    pub fn wait4(&self, parent: Pid, target: WaitTarget, nohang: bool) -> Result<Option<(Pid, ExitStatus)>, SchedError> {
        let mut inner = self.inner.lock();
        loop {
            let children = match inner.procs.get(&parent) {
                Some(p) => p.children.clone(),
                None => return Err(SchedError::NoSuchProcess(parent)),
            };
            let candidates: Vec<Pid> = children
                .into_iter()
                .filter(|c| match target {
                    WaitTarget::Any => true,
                    WaitTarget::Pid(p) => *c == p,
                })
                .collect();
            if candidates.is_empty() {
                return Err(SchedError::NoChildren);
            }
            let zombie = candidates.iter().copied().find(|c| {
                inner.procs.get(c).map(|p| p.state == ProcessState::Zombie).unwrap_or(false)
            });
            if let Some(child) = zombie {
                let status = inner
                    .procs
                    .remove(&child)
                    .and_then(|p| p.exit)
                    .unwrap_or(ExitStatus::Exited(0));
                if let Some(p) = inner.procs.get_mut(&parent) {
                    p.children.retain(|c| *c != child);
                }
                log::debug!("sched: {} reaped {}", parent, child);
                return Ok(Some((child, status)));
            }
            if nohang {
                return Ok(None);
            }
            self.child_exit.wait(&mut inner);
        }
    }

    /// Sends `sig` to `pid`. Signal 0 only checks existence; SIGKILL
    /// terminates at once; anything else is left pending.
    pub fn kill(&self, pid: Pid, sig: u32) -> Result<(), SchedError> {
        if sig >= NSIG {
            return Err(SchedError::InvalidSignal(sig));
        }
        let mut inner = self.inner.lock();
        let state = inner.procs.get(&pid).map(|p| p.state).ok_or(SchedError::NoSuchProcess(pid))?;
        if sig == 0 || state == ProcessState::Zombie {
            return Ok(());
        }
        if sig == SIGKILL {
            inner.terminate(pid, ExitStatus::Signaled(sig))?;
            drop(inner);
            self.child_exit.notify_all();
            return Ok(());
        }
        if let Some(p) = inner.procs.get_mut(&pid) {
            p.pending_signals |= 1 << sig;
        }
        Ok(())
    }

    /// Returns and clears the pending signal bitmap of `pid`.
    pub fn take_signals(&self, pid: Pid) -> Result<u64, SchedError> {
        let mut inner = self.inner.lock();
        let p = inner.procs.get_mut(&pid).ok_or(SchedError::NoSuchProcess(pid))?;
        Ok(std::mem::take(&mut p.pending_signals))
    }

    /// Parent of `pid`.
    pub fn getppid(&self, pid: Pid) -> Result<Pid, SchedError> {
        self.inner.lock().procs.get(&pid).map(|p| p.ppid).ok_or(SchedError::NoSuchProcess(pid))
    }

    /// Main thread of `pid`.
    pub fn main_thread(&self, pid: Pid) -> Result<Tid, SchedError> {
        let inner = self.inner.lock();
        inner.procs.get(&pid).and_then(|p| p.threads.first().copied()).ok_or(SchedError::NoSuchProcess(pid))
    }

    /// Owning process of `tid`.
    pub fn pid_of(&self, tid: Tid) -> Result<Pid, SchedError> {
        self.inner.lock().threads.get(&tid).map(|t| t.pid).ok_or(SchedError::NoSuchThread(tid))
    }

    /// Process snapshot.
    pub fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        let inner = self.inner.lock();
        inner.procs.get(&pid).map(|p| ProcessInfo {
            pid,
            ppid: p.ppid,
            name: p.name.clone(),
            state: p.state,
            exit: p.exit,
            children: p.children.clone(),
            threads: p.threads.clone(),
            pending_signals: p.pending_signals,
        })
    }

    /// Thread snapshot.
    pub fn thread(&self, tid: Tid) -> Option<ThreadInfo> {
        let inner = self.inner.lock();
        inner.threads.get(&tid).map(|t| ThreadInfo {
            tid,
            pid: t.pid,
            state: t.state,
            runtime: t.runtime,
            total_runtime: t.total_runtime,
            stack: t.stack,
        })
    }

    /// Ready queue in run order.
    pub fn ready_queue(&self) -> Vec<Tid> {
        self.inner.lock().ready.iter().copied().collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedStats {
        let inner = self.inner.lock();
        SchedStats {
            ready: inner.ready.len(),
            threads: inner.threads.len(),
            processes: inner.procs.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn sched(timeslice_ms: u64) -> Scheduler {
        Scheduler::new(SchedConfig { timeslice_ms, ..SchedConfig::default() })
    }

    #[test]
    fn init_runs_first() {
        let s = sched(10);
        let tid = s.current().unwrap();
        assert_eq!(s.pid_of(tid).unwrap(), INIT_PID);
        assert_eq!(s.thread(tid).unwrap().state, ThreadState::Running);
        assert_eq!(s.getppid(INIT_PID).unwrap(), 0);
    }

    #[test]
    fn timeslice_expiry_rotates_fifo() {
        let s = sched(3);
        let t1 = s.current().unwrap();
        let t2 = s.create_thread(INIT_PID).unwrap();
        let t3 = s.create_thread(INIT_PID).unwrap();
        assert_eq!(s.tick(), None);
        assert_eq!(s.tick(), None);
        assert_eq!(s.tick(), Some(t1));
        assert_eq!(s.current(), Some(t2));
        assert_eq!(s.ready_queue(), vec![t3, t1]);
        for _ in 0..3 {
            s.tick();
        }
        assert_eq!(s.current(), Some(t3));
        assert_eq!(s.thread(t1).unwrap().total_runtime, 3);
        assert_eq!(s.stats().preemptions, 2);
    }

    #[test]
    fn yield_moves_to_back() {
        let s = sched(10);
        let t1 = s.current().unwrap();
        let t2 = s.create_thread(INIT_PID).unwrap();
        assert_eq!(s.yield_now(t1).unwrap(), Some(t2));
        assert_eq!(s.ready_queue(), vec![t1]);
    }

    #[test]
    fn stacks_are_disjoint_with_guards() {
        let s = sched(10);
        let a = s.thread(s.create_thread(INIT_PID).unwrap()).unwrap().stack;
        let b = s.thread(s.create_thread(INIT_PID).unwrap()).unwrap().stack;
        assert_eq!(a.size, SchedConfig::default().stack_size);
        assert!(b.top() <= a.base - a.guard);
        assert!(a.in_guard(a.base - 1));
        assert!(!a.in_guard(a.base));
    }

    #[test]
    fn destroyed_thread_leaves_queue_and_recycles_stack() {
        let s = sched(10);
        let t2 = s.create_thread(INIT_PID).unwrap();
        let stack = s.thread(t2).unwrap().stack;
        s.destroy_thread(t2).unwrap();
        assert!(s.ready_queue().is_empty());
        assert_eq!(s.destroy_thread(t2), Err(SchedError::NoSuchThread(t2)));
        let t3 = s.create_thread(INIT_PID).unwrap();
        assert_eq!(s.thread(t3).unwrap().stack, stack);
        assert!(t3 > t2);
    }

    #[test]
    fn thread_limit_is_enforced() {
        let s = Scheduler::new(SchedConfig { max_threads: 2, ..SchedConfig::default() });
        s.create_thread(INIT_PID).unwrap();
        assert_eq!(s.create_thread(INIT_PID), Err(SchedError::Again));
        assert_eq!(s.fork(INIT_PID), Err(SchedError::Again));
    }

    #[test]
    fn fork_exit_wait_reaps_zombie() {
        let s = sched(10);
        let child = s.fork(INIT_PID).unwrap();
        assert_eq!(s.getppid(child).unwrap(), INIT_PID);
        assert_eq!(s.wait4(INIT_PID, WaitTarget::Any, true).unwrap(), None);
        s.exit(child, 3).unwrap();
        let info = s.process(child).unwrap();
        assert_eq!(info.state, ProcessState::Zombie);
        assert!(info.threads.is_empty());
        assert_ne!(s.take_signals(INIT_PID).unwrap() & (1 << SIGCHLD), 0);
        let (pid, status) = s.wait4(INIT_PID, WaitTarget::Pid(child), false).unwrap().unwrap();
        assert_eq!(pid, child);
        assert_eq!(status, ExitStatus::Exited(3));
        assert_eq!(status.wait_status(), 3 << 8);
        assert!(s.process(child).is_none());
        assert_eq!(s.wait4(INIT_PID, WaitTarget::Any, false), Err(SchedError::NoChildren));
    }

    #[test]
    fn wait_for_foreign_pid_is_echild() {
        let s = sched(10);
        let a = s.fork(INIT_PID).unwrap();
        let b = s.fork(INIT_PID).unwrap();
        let err = s.wait4(a, WaitTarget::Pid(b), true).unwrap_err();
        assert_eq!(err.errno(), Errno::ECHILD);
    }

    #[test]
    fn orphans_are_reparented_to_init() {
        let s = sched(10);
        let a = s.fork(INIT_PID).unwrap();
        let b = s.fork(a).unwrap();
        s.exit(a, 0).unwrap();
        assert_eq!(s.getppid(b).unwrap(), INIT_PID);
        assert!(s.process(INIT_PID).unwrap().children.contains(&b));
    }

    #[test]
    fn blocking_wait_wakes_on_exit() {
        let s = Arc::new(sched(10));
        let child = s.fork(INIT_PID).unwrap();
        let s2 = s.clone();
        let waiter = std::thread::spawn(move || s2.wait4(INIT_PID, WaitTarget::Any, false));
        std::thread::sleep(Duration::from_millis(20));
        s.exit(child, 7).unwrap();
        let reaped = waiter.join().unwrap().unwrap();
        assert_eq!(reaped, Some((child, ExitStatus::Exited(7))));
    }

    #[test]
    fn kill_sets_pending_or_terminates() {
        let s = sched(10);
        let child = s.fork(INIT_PID).unwrap();
        s.kill(child, 0).unwrap();
        s.kill(child, 15).unwrap();
        assert_eq!(s.process(child).unwrap().pending_signals, 1 << 15);
        assert_eq!(s.kill(child, NSIG), Err(SchedError::InvalidSignal(NSIG)));
        assert_eq!(s.kill(4242, 0).unwrap_err().errno(), Errno::ESRCH);
        s.kill(child, SIGKILL).unwrap();
        let (_, status) = s.wait4(INIT_PID, WaitTarget::Any, true).unwrap().unwrap();
        assert_eq!(status, ExitStatus::Signaled(SIGKILL));
        assert_eq!(status.wait_status(), 9);
    }

    #[test]
    fn last_thread_exit_makes_zombie() {
        let s = sched(10);
        let child = s.fork(INIT_PID).unwrap();
        let tid = s.main_thread(child).unwrap();
        s.destroy_thread(tid).unwrap();
        assert_eq!(s.process(child).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn blocked_threads_are_skipped_until_woken() {
        let s = sched(1);
        let t1 = s.current().unwrap();
        let t2 = s.create_thread(INIT_PID).unwrap();
        s.block(t2).unwrap();
        assert_eq!(s.tick(), Some(t1));
        assert_eq!(s.current(), Some(t1));
        s.wake(t2).unwrap();
        s.tick();
        assert_eq!(s.current(), Some(t2));
    }
}
