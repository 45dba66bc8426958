// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Single-entry panic path, non-fatal warnings and post-mortem records
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module (report, core dump codec, recursion guard)
//!
//! PUBLIC API:
//!   - panic(msg, file, line, func) -> !, kpanic!/kassert!/kwarn! macros
//!   - warn(msg, file, line, func): logs with a truncated backtrace and returns
//!   - configure(PanicConfig): log path, core directory, blink pattern toggle
//!   - CoreDump encode/decode for post-mortem tooling
//!
//! INVARIANTS:
//!   - A second panic while one is in progress prints "DOUBLE PANIC" and aborts without
//!     taking locks or allocating
//!   - Backtraces are bounded (64 frames for panics, 5 for warnings)

mod backtrace;
mod coredump;
mod panic;
mod state;

pub use backtrace::{capture_frames, MAX_PANIC_FRAMES, MAX_WARN_FRAMES};
pub use coredump::{core_dump_path, CoreDump, CoreDumpError, CORE_MAGIC, CORE_VERSION};
pub use panic::{
    blink_pattern, config, configure, panic, panic_count, render_report, warn, BlinkStep,
    PanicConfig, PanicGate, PanicReport, BANNER_WIDTH, DEFAULT_CORE_DIR, DEFAULT_PANIC_LOG,
};
pub use state::SystemState;

/// Panics through the kernel panic path with a formatted message.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {
        $crate::panic(&::std::format!($($arg)*), ::std::file!(), ::std::line!(), ::std::module_path!())
    };
}

/// Asserts an invariant; on failure goes through [`panic`].
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::kpanic!("assertion failed: {}", ::std::stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::kpanic!($($arg)+);
        }
    };
}

/// Emits a non-fatal warning with a short backtrace.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::warn(&::std::format!($($arg)*), ::std::file!(), ::std::line!(), ::std::module_path!())
    };
}
