// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: KOS kernel core running as an ordinary host process
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module (ManualClock driven), proptests for
//!   wheel placement and user-memory bounds, syscall surface tests under tests/
//!
//! PUBLIC API:
//!   - boot/boot_with_clock: bring up timers, IRQs, scheduler, VFS and netstack
//!   - Kernel::syscall: x86-64 numbered syscall entry, negated errno on failure
//!   - TimerWheel: wheel + hi-res queue, one-shot and periodic timers
//!   - IrqRegistry: priority-ordered shared chains, threaded lines, balancer
//!   - Scheduler: FIFO ready queue, timeslices, fork/exit/wait4/kill
//!   - KernelConfig: JSON configuration with per-subsystem sections
//!
//! INVARIANTS:
//!   - A started timer sits in exactly one of {wheel slot, hi-res queue}
//!   - An IRQ line is active iff its chain is non-empty
//!   - At most one thread runs; the ready queue only holds Ready threads
//!   - User pointers are validated before any copy in or out

pub mod config;
pub mod irq;
pub mod kernel;
pub mod logging;
pub mod sched;
pub mod syscall;
pub mod timer;
pub mod usermem;

pub use config::{
    BalancePolicy, ConfigError, IrqConfig, KernelConfig, PanicSection, SchedConfig, TimerConfig, CONFIG_ENV,
};
pub use irq::{IrqError, IrqFlags, IrqRegistry, IrqReturn, IrqState, NR_IRQS};
pub use kernel::{boot, boot_with_clock, BootError, Kernel, KernelStats, ProcessContext, TIMER_IRQ};
pub use sched::{ExitStatus, SchedError, Scheduler, WaitTarget, INIT_PID};
pub use syscall::{Args, SyscallError, SyscallTable};
pub use timer::{TimerError, TimerId, TimerKind, TimerState, TimerWheel};
pub use usermem::{validate_user_range, UserMemory};
