// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel panic path
//!
//! Order of operations on `panic`:
//!   1. recursion guard (DOUBLE PANIC -> immediate abort)
//!   2. count + timestamp + header to the panic log and stderr
//!   3. bounded symbolic backtrace
//!   4. system state dump
//!   5. binary core dump under `core_dir`
//!   6. sync + close the log
//!   7. blink pattern, abort

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use kos_abi::time::{Timespec, NSEC_PER_SEC};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::backtrace::{capture_frames, MAX_PANIC_FRAMES, MAX_WARN_FRAMES};
use crate::coredump::{core_dump_path, CoreDump};
use crate::state::SystemState;

/// Default panic log location.
pub const DEFAULT_PANIC_LOG: &str = "/tmp/kos_panic.log";
/// Default directory for core dumps.
pub const DEFAULT_CORE_DIR: &str = "/tmp";
/// Width of the banner framing each panic log entry.
pub const BANNER_WIDTH: usize = 80;

/// Panic path configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanicConfig {
    /// Append-mode human readable log.
    pub log_path: PathBuf,
    /// Directory receiving `kos_core.<pid>.<ts>` files.
    pub core_dir: PathBuf,
    /// Emit the blink pattern before aborting.
    pub blink: bool,
}

impl Default for PanicConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_PANIC_LOG),
            core_dir: PathBuf::from(DEFAULT_CORE_DIR),
            blink: true,
        }
    }
}

static CONFIG: Lazy<RwLock<PanicConfig>> = Lazy::new(|| RwLock::new(PanicConfig::default()));
static GATE: PanicGate = PanicGate::new();
static LOG_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Installs a new panic configuration.
pub fn configure(cfg: PanicConfig) {
    *CONFIG.write() = cfg;
}

/// Current panic configuration.
pub fn config() -> PanicConfig {
    CONFIG.read().clone()
}

/// Number of panics entered by this process.
pub fn panic_count() -> u64 {
    GATE.count()
}

/// Recursion guard plus panic counter.
#[derive(Debug)]
pub struct PanicGate {
    in_panic: AtomicBool,
    count: AtomicU64,
}

impl PanicGate {
    /// Creates an idle gate.
    pub const fn new() -> Self {
        Self { in_panic: AtomicBool::new(false), count: AtomicU64::new(0) }
    }

    /// Enters the panic path. Returns the panic ordinal, or `None` when a
    /// panic is already in progress.
    pub fn enter(&self) -> Option<u64> {
        if self.in_panic.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.count.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// True while a panic is in progress.
    pub fn in_panic(&self) -> bool {
        self.in_panic.load(Ordering::SeqCst)
    }

    /// Panics entered so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for PanicGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything recorded about one panic.
#[derive(Clone, Debug)]
pub struct PanicReport {
    /// Panic ordinal within this process.
    pub ordinal: u64,
    /// Message.
    pub message: String,
    /// Source file.
    pub file: String,
    /// Source line.
    pub line: u32,
    /// Function or module.
    pub func: String,
    /// Wall-clock time of the panic.
    pub time: Timespec,
    /// Symbolic frames, innermost first.
    pub frames: Vec<String>,
    /// Host snapshot.
    pub state: SystemState,
}

impl PanicReport {
    /// Builds a report for the calling thread.
    pub fn capture(ordinal: u64, message: &str, file: &str, line: u32, func: &str, max_frames: usize) -> Self {
        Self {
            ordinal,
            message: message.to_string(),
            file: file.to_string(),
            line,
            func: func.to_string(),
            time: Timespec::now(),
            frames: capture_frames(max_frames),
            state: SystemState::capture(),
        }
    }

    /// Core-dump record for this report.
    pub fn core_dump(&self) -> CoreDump {
        CoreDump {
            timestamp_ns: (self.time.sec.max(0) as u64)
                .saturating_mul(NSEC_PER_SEC)
                .saturating_add(self.time.nsec as u64),
            pid: self.state.pid,
            tid: self.state.tid,
            process_name: self.state.process_name.clone(),
            panic_msg: self.message.clone(),
            stack_frames: self.frames.clone(),
            system_state: self.state.to_string(),
        }
    }
}

/// Renders the human readable log entry for `report` framed by banners.
pub fn render_report(report: &PanicReport, kind: &str) -> String {
    let banner = "=".repeat(BANNER_WIDTH);
    let mut out = String::new();
    out.push_str(&banner);
    out.push('\n');
    out.push_str(&format!(
        "KOS {kind} #{} at {}.{:09}\n",
        report.ordinal, report.time.sec, report.time.nsec
    ));
    out.push_str(&format!("  message : {}\n", report.message));
    out.push_str(&format!("  location: {}:{} ({})\n", report.file, report.line, report.func));
    out.push_str("  backtrace:\n");
    for (i, frame) in report.frames.iter().enumerate() {
        out.push_str(&format!("    #{i:02} {frame}\n"));
    }
    out.push_str("  system state:\n");
    for line in report.state.to_string().lines() {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&banner);
    out.push('\n');
    out
}

fn append_log(path: &Path, text: &str) -> io::Result<()> {
    let _guard = LOG_LOCK.lock();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()
}

/// One step of the diagnostic blink pattern (on/off with a duration).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlinkStep {
    /// Indicator lit.
    pub on: bool,
    /// Step duration in milliseconds.
    pub ms: u64,
}

/// Short-short-short, long-long-long, short-short-short.
pub fn blink_pattern() -> Vec<BlinkStep> {
    let mut steps = Vec::with_capacity(18);
    for ms in [100u64, 100, 100, 300, 300, 300, 100, 100, 100] {
        steps.push(BlinkStep { on: true, ms });
        steps.push(BlinkStep { on: false, ms: 100 });
    }
    steps
}

fn blink() {
    let mut err = io::stderr().lock();
    for step in blink_pattern() {
        let _ = err.write_all(if step.on { b"*" } else { b"." });
        let _ = err.flush();
        std::thread::sleep(Duration::from_millis(step.ms));
    }
    let _ = err.write_all(b"\n");
}

fn double_panic() -> ! {
    // No locks, no allocation.
    let _ = io::stderr().write_all(b"\nDOUBLE PANIC\n");
    std::process::abort()
}

/// Kernel panic. Never returns.
pub fn panic(msg: &str, file: &str, line: u32, func: &str) -> ! {
    let Some(ordinal) = GATE.enter() else {
        double_panic();
    };
    let cfg = config();
    log::error!("kernel panic #{ordinal}: {msg} at {file}:{line}");
    let report = PanicReport::capture(ordinal, msg, file, line, func, MAX_PANIC_FRAMES);
    let text = render_report(&report, "PANIC");
    let _ = io::stderr().write_all(text.as_bytes());
    if let Err(err) = append_log(&cfg.log_path, &text) {
        let _ = writeln!(io::stderr(), "panic log {} unavailable: {err}", cfg.log_path.display());
    }
    let path = core_dump_path(&cfg.core_dir, report.state.pid, report.time.sec);
    match report.core_dump().write_to(&path) {
        Ok(()) => {
            let _ = writeln!(io::stderr(), "core dump written to {}", path.display());
        }
        Err(err) => {
            let _ = writeln!(io::stderr(), "core dump {} failed: {err}", path.display());
        }
    }
    let _ = io::stdout().flush();
    if cfg.blink {
        blink();
    }
    std::process::abort()
}

/// Non-fatal warning: logs with a 5-frame backtrace and returns.
pub fn warn(msg: &str, file: &str, line: u32, func: &str) {
    log::warn!("{msg} at {file}:{line}");
    let report = PanicReport::capture(0, msg, file, line, func, MAX_WARN_FRAMES);
    let text = render_report(&report, "WARNING");
    let path = config().log_path;
    if let Err(err) = append_log(&path, &text) {
        log::debug!("warning not persisted to {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejects_reentry() {
        let gate = PanicGate::new();
        assert_eq!(gate.enter(), Some(1));
        assert!(gate.in_panic());
        assert_eq!(gate.enter(), None);
        assert_eq!(gate.count(), 1);
    }

    #[test]
    fn report_is_framed_by_banners() {
        let report = PanicReport::capture(3, "boom", "x.rs", 9, "f", 4);
        let text = render_report(&report, "PANIC");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.first().map(|l| l.len()), Some(BANNER_WIDTH));
        assert_eq!(lines.last().map(|l| l.len()), Some(BANNER_WIDTH));
        assert!(text.contains("KOS PANIC #3"));
        assert!(text.contains("x.rs:9"));
    }

    #[test]
    fn core_dump_carries_message_and_frames() {
        let report = PanicReport::capture(1, "double free", "a.rs", 1, "g", MAX_PANIC_FRAMES);
        let dump = report.core_dump();
        assert_eq!(dump.panic_msg, "double free");
        assert_eq!(dump.stack_frames, report.frames);
        assert!(dump.stack_frames.len() <= MAX_PANIC_FRAMES);
    }

    #[test]
    fn warn_appends_to_configured_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("panic.log");
        configure(PanicConfig { log_path: log_path.clone(), core_dir: dir.path().into(), blink: false });
        warn("disk almost full", "w.rs", 3, "h");
        crate::kwarn!("second {}", 2);
        let text = std::fs::read_to_string(&log_path).expect("log");
        assert!(text.contains("KOS WARNING"));
        assert!(text.contains("disk almost full"));
        assert!(text.contains("second 2"));
        configure(PanicConfig::default());
    }

    #[test]
    fn blink_pattern_alternates() {
        let steps = blink_pattern();
        assert_eq!(steps.len(), 18);
        assert!(steps.iter().step_by(2).all(|s| s.on));
        assert!(steps.iter().skip(1).step_by(2).all(|s| !s.on));
    }
}
