// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host process/system snapshot taken during a panic.
//!
//! Everything is read from procfs when available; missing sources degrade to
//! zero/"unknown" instead of failing, since this runs on the panic path.

use std::fmt;
use std::fs;

use kos_abi::time::Timespec;

/// Snapshot of the host process and machine at panic time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemState {
    /// Process id.
    pub pid: u32,
    /// Parent process id.
    pub ppid: u32,
    /// Host thread id of the panicking thread (0 when unknown).
    pub tid: u32,
    /// Real uid.
    pub uid: u32,
    /// Real gid.
    pub gid: u32,
    /// Resident set size in KiB.
    pub rss_kib: u64,
    /// Total machine memory in KiB.
    pub mem_total_kib: u64,
    /// Available machine memory in KiB.
    pub mem_available_kib: u64,
    /// `uname`-style description.
    pub uname: String,
    /// Process name.
    pub process_name: String,
    /// Wall-clock time of the snapshot.
    pub time: Timespec,
}

impl SystemState {
    /// Captures the current state. Never fails.
    pub fn capture() -> Self {
        let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
        let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
        Self {
            pid: std::process::id(),
            ppid: std::os::unix::process::parent_id(),
            tid: current_tid(),
            uid: status_field(&status, "Uid:").unwrap_or(0) as u32,
            gid: status_field(&status, "Gid:").unwrap_or(0) as u32,
            rss_kib: status_field(&status, "VmRSS:").unwrap_or(0),
            mem_total_kib: status_field(&meminfo, "MemTotal:").unwrap_or(0),
            mem_available_kib: status_field(&meminfo, "MemAvailable:").unwrap_or(0),
            uname: uname(),
            process_name: process_name(),
            time: Timespec::now(),
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pid={} ppid={} tid={} uid={} gid={}", self.pid, self.ppid, self.tid, self.uid, self.gid)?;
        writeln!(
            f,
            "memory: rss={}KiB total={}KiB available={}KiB",
            self.rss_kib, self.mem_total_kib, self.mem_available_kib
        )?;
        writeln!(f, "uname: {}", self.uname)?;
        writeln!(f, "process: {}", self.process_name)?;
        write!(f, "time: {}.{:09}", self.time.sec, self.time.nsec)
    }
}

/// Parses the first integer after `key` in a `/proc` style "Key:  value ..." listing.
fn status_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn current_tid() -> u32 {
    fs::read_link("/proc/thread-self")
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).and_then(|n| n.parse().ok()))
        .unwrap_or(0)
}

fn uname() -> String {
    let read = |name: &str| {
        fs::read_to_string(format!("/proc/sys/kernel/{name}"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    };
    format!("{} {} {}", read("ostype"), read("hostname"), read("osrelease"))
}

fn process_name() -> String {
    std::env::args()
        .next()
        .and_then(|a| a.rsplit('/').next().map(str::to_string))
        .unwrap_or_else(|| "kos".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_field_parses_first_number() {
        let text = "Name:\tkos\nUid:\t1000\t1000\t1000\t1000\nVmRSS:\t  2048 kB\n";
        assert_eq!(status_field(text, "Uid:"), Some(1000));
        assert_eq!(status_field(text, "VmRSS:"), Some(2048));
        assert_eq!(status_field(text, "Gid:"), None);
    }

    #[test]
    fn capture_reports_own_pid() {
        let state = SystemState::capture();
        assert_eq!(state.pid, std::process::id());
        assert!(state.to_string().contains("pid="));
    }
}
