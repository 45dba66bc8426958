// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Symbolic stack capture.

use std::backtrace::Backtrace;

/// Frame bound for panics.
pub const MAX_PANIC_FRAMES: usize = 64;
/// Frame bound for warnings.
pub const MAX_WARN_FRAMES: usize = 5;

/// Captures up to `max` symbolic frames of the current thread.
///
/// Frames belonging to the capture machinery itself are skipped so the first
/// entry is the caller of the panic/warn path.
pub fn capture_frames(max: usize) -> Vec<String> {
    let rendered = Backtrace::force_capture().to_string();
    let mut frames = Vec::new();
    for line in rendered.lines() {
        if frames.len() >= max {
            break;
        }
        let trimmed = line.trim_start();
        let Some((index, symbol)) = trimmed.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if is_internal(symbol) {
            continue;
        }
        frames.push(symbol.trim().to_string());
    }
    frames
}

fn is_internal(symbol: &str) -> bool {
    symbol.starts_with("std::backtrace")
        || symbol.starts_with("std::backtrace_rs")
        || symbol.starts_with("kos_diag::backtrace")
        || symbol.starts_with("kos_diag::panic::")
}
