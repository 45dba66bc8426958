// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions used by every KOS crate
//! OWNERS: @kernel-team
//! PUBLIC API: Errno, nr::* syscall numbers, time::{ClockSource, TimeKeeper, time_get_ns}, limits
//! INVARIANTS: Errno values mirror x86-64 Linux; negative returns are `-errno`
//! DEPENDS_ON: once_cell (global time keeper), thiserror (Errno display)

pub mod errno;
pub mod nr;
pub mod time;

pub use errno::Errno;

/// Maximum number of descriptors a single context may hold.
pub const MAX_FDS: usize = 1024;

/// First address considered to belong to "kernel space" by pointer validation.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// Maximum length of a full path, including the terminator.
pub const PATH_MAX: usize = 4096;

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 255;

/// Process identifier.
pub type Pid = u32;

/// Thread identifier.
pub type Tid = u32;

/// Credentials carried by a caller into permission checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Credentials {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

impl Credentials {
    /// Superuser credentials.
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };

    /// Creates credentials from a uid/gid pair.
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Returns true for uid 0.
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}
