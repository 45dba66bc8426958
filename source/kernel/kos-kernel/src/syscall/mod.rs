// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, SyscallContext, SyscallError, Handler
//! DEPENDS_ON: kernel (process table), sched, usermem, kos-vfs
//! INVARIANTS: Fixed MAX_SYSCALL window; numbers mirror x86-64 Linux; every
//! failure leaves the dispatcher as a negated errno; unregistered numbers
//! return -ENOSYS

pub mod api;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kos_abi::nr::MAX_SYSCALL;
use kos_abi::{Errno, Pid, Tid, MAX_FDS};
use kos_vfs::VfsError;
use parking_lot::MutexGuard;
use serde::Serialize;
use thiserror::Error;

use crate::kernel::{Kernel, ProcessContext};
use crate::sched::SchedError;
use crate::usermem::UserMemory;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, SyscallError>;

/// Syscall arguments, in register order.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Args {
    regs: [u64; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [u64; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> u64 {
        self.regs[index]
    }

    /// Register `index` as a descriptor; must lie in `[0, MAX_FDS)`.
    pub fn fd(&self, index: usize) -> SysResult<i32> {
        let raw = self.regs[index] as i64;
        if raw < 0 || raw >= MAX_FDS as i64 {
            return Err(Errno::EBADF.into());
        }
        Ok(raw as i32)
    }
}

/// Error returned by the handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyscallError {
    /// VFS operation failed.
    #[error(transparent)]
    Vfs(#[from] VfsError),
    /// Process lifecycle operation failed.
    #[error(transparent)]
    Sched(#[from] SchedError),
    /// Argument validation or a direct errno.
    #[error(transparent)]
    Errno(#[from] Errno),
}

impl SyscallError {
    /// Errno handed back to the caller.
    pub const fn errno(self) -> Errno {
        match self {
            Self::Vfs(e) => e.errno(),
            Self::Sched(e) => e.errno(),
            Self::Errno(e) => e,
        }
    }
}

/// Per-call environment: the calling process and the kernel it runs in.
pub struct SyscallContext<'a> {
    /// Kernel services.
    pub kernel: &'a Kernel,
    /// Calling process.
    pub pid: Pid,
    /// Calling thread.
    pub tid: Tid,
    /// File and memory state of the caller.
    pub process: Arc<ProcessContext>,
}

impl SyscallContext<'_> {
    /// Locks the caller's user memory. Never hold the guard across a call
    /// that may block.
    pub fn mem(&self) -> MutexGuard<'_, UserMemory> {
        self.process.mem.lock()
    }

    /// Reads a path argument.
    pub fn path(&self, addr: u64) -> SysResult<String> {
        Ok(self.mem().read_cstr(addr)?)
    }

    /// Copies `bytes` to user address `addr`.
    pub fn copy_out(&self, addr: u64, bytes: &[u8]) -> SysResult<()> {
        Ok(self.mem().write(addr, bytes)?)
    }

    /// Copies `len` bytes from user address `addr`.
    pub fn copy_in(&self, addr: u64, len: u64) -> SysResult<Vec<u8>> {
        Ok(self.mem().read(addr, len)?)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&SyscallContext<'_>, &Args) -> SysResult<i64>;

/// Call and failure counts of one syscall number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyscallCount {
    /// Number.
    pub nr: u32,
    /// Name, when known.
    pub name: Option<&'static str>,
    /// Dispatches.
    pub calls: u64,
    /// Dispatches that returned an errno.
    pub failures: u64,
}

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
    calls: Vec<AtomicU64>,
    failures: Vec<AtomicU64>,
    out_of_range: AtomicU64,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable").field("registered", &self.registered().len()).finish_non_exhaustive()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self {
            handlers: [NONE; MAX_SYSCALL],
            calls: (0..MAX_SYSCALL).map(|_| AtomicU64::new(0)).collect(),
            failures: (0..MAX_SYSCALL).map(|_| AtomicU64::new(0)).collect(),
            out_of_range: AtomicU64::new(0),
        }
    }

    /// Table with every handler in [`api`] registered.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        api::register_all(&mut table);
        table
    }

    /// Registers a handler.
    pub fn register(&mut self, number: u32, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    /// Numbers with a handler.
    pub fn registered(&self) -> Vec<u32> {
        (0..MAX_SYSCALL as u32).filter(|n| self.handlers[*n as usize].is_some()).collect()
    }

    /// Executes the handler referenced by `number`. Negative results are
    /// negated errnos.
    #[must_use]
    pub fn dispatch(&self, number: u32, ctx: &SyscallContext<'_>, args: &Args) -> i64 {
        let idx = number as usize;
        if idx >= MAX_SYSCALL {
            self.out_of_range.fetch_add(1, Ordering::Relaxed);
            log::trace!("syscall: pid {} nr {} out of range", ctx.pid, number);
            return Errno::ENOSYS.as_neg();
        }
        self.calls[idx].fetch_add(1, Ordering::Relaxed);
        let result = self.handlers[idx].ok_or(SyscallError::Errno(Errno::ENOSYS)).and_then(|h| h(ctx, args));
        match result {
            Ok(value) => value,
            Err(err) => {
                self.failures[idx].fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "syscall: pid {} {} failed: {}",
                    ctx.pid,
                    kos_abi::nr::name(number).unwrap_or("?"),
                    err
                );
                err.errno().as_neg()
            }
        }
    }

    /// Counters of one number.
    pub fn count(&self, number: u32) -> SyscallCount {
        let idx = number as usize;
        SyscallCount {
            nr: number,
            name: kos_abi::nr::name(number),
            calls: self.calls.get(idx).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0),
            failures: self.failures.get(idx).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0),
        }
    }

    /// Counters of every number that has been called.
    pub fn counts(&self) -> Vec<SyscallCount> {
        (0..MAX_SYSCALL as u32).map(|n| self.count(n)).filter(|c| c.calls > 0).collect()
    }

    /// Dispatches rejected because the number was outside the table.
    pub fn out_of_range(&self) -> u64 {
        self.out_of_range.load(Ordering::Relaxed)
    }
}
