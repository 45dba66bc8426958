// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Errno values shared by the syscall, VFS and network surfaces.

use thiserror::Error;

/// Error numbers; discriminants match x86-64 Linux.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[allow(missing_docs)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("no such process")]
    ESRCH = 3,
    #[error("interrupted system call")]
    EINTR = 4,
    #[error("input/output error")]
    EIO = 5,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("cannot allocate memory")]
    ENOMEM = 12,
    #[error("permission denied")]
    EACCES = 13,
    #[error("bad address")]
    EFAULT = 14,
    #[error("device or resource busy")]
    EBUSY = 16,
    #[error("file exists")]
    EEXIST = 17,
    #[error("invalid cross-device link")]
    EXDEV = 18,
    #[error("no such device")]
    ENODEV = 19,
    #[error("not a directory")]
    ENOTDIR = 20,
    #[error("is a directory")]
    EISDIR = 21,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("too many open files in system")]
    ENFILE = 23,
    #[error("too many open files")]
    EMFILE = 24,
    #[error("file too large")]
    EFBIG = 27,
    #[error("no space left on device")]
    ENOSPC = 28,
    #[error("illegal seek")]
    ESPIPE = 29,
    #[error("read-only file system")]
    EROFS = 30,
    #[error("too many links")]
    EMLINK = 31,
    #[error("broken pipe")]
    EPIPE = 32,
    #[error("numerical result out of range")]
    ERANGE = 34,
    #[error("resource deadlock avoided")]
    EDEADLK = 35,
    #[error("file name too long")]
    ENAMETOOLONG = 36,
    #[error("no locks available")]
    ENOLCK = 37,
    #[error("function not implemented")]
    ENOSYS = 38,
    #[error("directory not empty")]
    ENOTEMPTY = 39,
    #[error("too many levels of symbolic links")]
    ELOOP = 40,
    #[error("no data available")]
    ENODATA = 61,
    #[error("protocol error")]
    EPROTO = 71,
    #[error("message too long")]
    EMSGSIZE = 90,
    #[error("protocol not supported")]
    EPROTONOSUPPORT = 93,
    #[error("operation not supported")]
    EOPNOTSUPP = 95,
    #[error("address family not supported")]
    EAFNOSUPPORT = 97,
    #[error("address already in use")]
    EADDRINUSE = 98,
    #[error("cannot assign requested address")]
    EADDRNOTAVAIL = 99,
    #[error("network is unreachable")]
    ENETUNREACH = 101,
    #[error("software caused connection abort")]
    ECONNABORTED = 103,
    #[error("connection reset by peer")]
    ECONNRESET = 104,
    #[error("no buffer space available")]
    ENOBUFS = 105,
    #[error("transport endpoint is already connected")]
    EISCONN = 106,
    #[error("transport endpoint is not connected")]
    ENOTCONN = 107,
    #[error("connection timed out")]
    ETIMEDOUT = 110,
    #[error("connection refused")]
    ECONNREFUSED = 111,
    #[error("no route to host")]
    EHOSTUNREACH = 113,
    #[error("operation already in progress")]
    EALREADY = 114,
    #[error("operation now in progress")]
    EINPROGRESS = 115,
}

impl Errno {
    /// Alias used by the routing layer when no route matches.
    pub const ENOROUTE: Errno = Errno::ENETUNREACH;

    /// Positive errno value.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Negated errno, as returned across the syscall boundary.
    pub const fn as_neg(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Maps a positive errno back to the enum.
    pub fn from_code(code: i32) -> Option<Self> {
        ALL.iter().copied().find(|e| e.code() == code.abs())
    }
}

const ALL: &[Errno] = &[
    Errno::EPERM,
    Errno::ENOENT,
    Errno::ESRCH,
    Errno::EINTR,
    Errno::EIO,
    Errno::EBADF,
    Errno::ECHILD,
    Errno::EAGAIN,
    Errno::ENOMEM,
    Errno::EACCES,
    Errno::EFAULT,
    Errno::EBUSY,
    Errno::EEXIST,
    Errno::EXDEV,
    Errno::ENODEV,
    Errno::ENOTDIR,
    Errno::EISDIR,
    Errno::EINVAL,
    Errno::ENFILE,
    Errno::EMFILE,
    Errno::EFBIG,
    Errno::ENOSPC,
    Errno::ESPIPE,
    Errno::EROFS,
    Errno::EMLINK,
    Errno::EPIPE,
    Errno::ERANGE,
    Errno::EDEADLK,
    Errno::ENAMETOOLONG,
    Errno::ENOLCK,
    Errno::ENOSYS,
    Errno::ENOTEMPTY,
    Errno::ELOOP,
    Errno::ENODATA,
    Errno::EPROTO,
    Errno::EMSGSIZE,
    Errno::EPROTONOSUPPORT,
    Errno::EOPNOTSUPP,
    Errno::EAFNOSUPPORT,
    Errno::EADDRINUSE,
    Errno::EADDRNOTAVAIL,
    Errno::ENETUNREACH,
    Errno::ECONNABORTED,
    Errno::ECONNRESET,
    Errno::ENOBUFS,
    Errno::EISCONN,
    Errno::ENOTCONN,
    Errno::ETIMEDOUT,
    Errno::ECONNREFUSED,
    Errno::EHOSTUNREACH,
    Errno::EALREADY,
    Errno::EINPROGRESS,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_codes_match_linux() {
        assert_eq!(Errno::ENOENT.as_neg(), -2);
        assert_eq!(Errno::ENOSYS.as_neg(), -38);
        assert_eq!(Errno::EADDRINUSE.code(), 98);
    }

    #[test]
    fn from_code_accepts_either_sign() {
        assert_eq!(Errno::from_code(13), Some(Errno::EACCES));
        assert_eq!(Errno::from_code(-13), Some(Errno::EACCES));
        assert_eq!(Errno::from_code(9999), None);
    }

    #[test]
    fn noroute_alias_is_netunreach() {
        assert_eq!(Errno::ENOROUTE, Errno::ENETUNREACH);
    }
}
