// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall numbers. Numbering follows x86-64 Linux for convenience only; the
//! table is not an ABI clone.
#![allow(missing_docs)]

/// Size of the dispatch table. Numbers at or above this are rejected.
pub const MAX_SYSCALL: usize = 256;

pub const READ: u32 = 0;
pub const WRITE: u32 = 1;
pub const OPEN: u32 = 2;
pub const CLOSE: u32 = 3;
pub const STAT: u32 = 4;
pub const FSTAT: u32 = 5;
pub const LSTAT: u32 = 6;
pub const POLL: u32 = 7;
pub const LSEEK: u32 = 8;
pub const MMAP: u32 = 9;
pub const MPROTECT: u32 = 10;
pub const MUNMAP: u32 = 11;
pub const BRK: u32 = 12;
pub const ACCESS: u32 = 21;
pub const SCHED_YIELD: u32 = 24;
pub const NANOSLEEP: u32 = 35;
pub const GETPID: u32 = 39;
pub const SOCKET: u32 = 41;
pub const CONNECT: u32 = 42;
pub const ACCEPT: u32 = 43;
pub const SENDTO: u32 = 44;
pub const RECVFROM: u32 = 45;
pub const BIND: u32 = 49;
pub const LISTEN: u32 = 50;
pub const CLONE: u32 = 56;
pub const FORK: u32 = 57;
pub const EXECVE: u32 = 59;
pub const EXIT: u32 = 60;
pub const WAIT4: u32 = 61;
pub const KILL: u32 = 62;
pub const UNAME: u32 = 63;
pub const FCNTL: u32 = 72;
pub const FSYNC: u32 = 74;
pub const TRUNCATE: u32 = 76;
pub const FTRUNCATE: u32 = 77;
pub const GETCWD: u32 = 79;
pub const CHDIR: u32 = 80;
pub const RENAME: u32 = 82;
pub const MKDIR: u32 = 83;
pub const RMDIR: u32 = 84;
pub const LINK: u32 = 86;
pub const UNLINK: u32 = 87;
pub const SYMLINK: u32 = 88;
pub const READLINK: u32 = 89;
pub const CHMOD: u32 = 90;
pub const CHOWN: u32 = 92;
pub const UMASK: u32 = 95;
pub const GETTIMEOFDAY: u32 = 96;
pub const GETUID: u32 = 102;
pub const GETGID: u32 = 104;
pub const GETPPID: u32 = 110;
pub const GETTID: u32 = 186;
pub const CLOCK_GETTIME: u32 = 228;

/// Human readable name for tracing; unknown numbers yield `None`.
pub fn name(nr: u32) -> Option<&'static str> {
    Some(match nr {
        READ => "read",
        WRITE => "write",
        OPEN => "open",
        CLOSE => "close",
        STAT => "stat",
        FSTAT => "fstat",
        LSTAT => "lstat",
        POLL => "poll",
        LSEEK => "lseek",
        MMAP => "mmap",
        MPROTECT => "mprotect",
        MUNMAP => "munmap",
        BRK => "brk",
        ACCESS => "access",
        SCHED_YIELD => "sched_yield",
        NANOSLEEP => "nanosleep",
        GETPID => "getpid",
        SOCKET => "socket",
        CONNECT => "connect",
        ACCEPT => "accept",
        SENDTO => "sendto",
        RECVFROM => "recvfrom",
        BIND => "bind",
        LISTEN => "listen",
        CLONE => "clone",
        FORK => "fork",
        EXECVE => "execve",
        EXIT => "exit",
        WAIT4 => "wait4",
        KILL => "kill",
        UNAME => "uname",
        FCNTL => "fcntl",
        FSYNC => "fsync",
        TRUNCATE => "truncate",
        FTRUNCATE => "ftruncate",
        GETCWD => "getcwd",
        CHDIR => "chdir",
        RENAME => "rename",
        MKDIR => "mkdir",
        RMDIR => "rmdir",
        LINK => "link",
        UNLINK => "unlink",
        SYMLINK => "symlink",
        READLINK => "readlink",
        CHMOD => "chmod",
        CHOWN => "chown",
        UMASK => "umask",
        GETTIMEOFDAY => "gettimeofday",
        GETUID => "getuid",
        GETGID => "getgid",
        GETPPID => "getppid",
        GETTID => "gettid",
        CLOCK_GETTIME => "clock_gettime",
        _ => return None,
    })
}
