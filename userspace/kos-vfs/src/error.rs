// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! VFS error type and the negative domain codes exposed to callers.

use kos_abi::Errno;
use thiserror::Error;

/// Result alias used across the VFS.
pub type Result<T> = core::result::Result<T, VfsError>;

/// Errors produced by VFS operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VfsError {
    /// Path component or object does not exist.
    #[error("no such file or directory")]
    NotFound,
    /// Target already exists.
    #[error("file exists")]
    Exists,
    /// A non-final path component is not a directory.
    #[error("not a directory")]
    NotDir,
    /// Operation not valid on a directory.
    #[error("is a directory")]
    IsDir,
    /// Directory still has entries.
    #[error("directory not empty")]
    NotEmpty,
    /// Permission bits deny the access.
    #[error("permission denied")]
    Access,
    /// Caller is not allowed to perform the operation at all.
    #[error("operation not permitted")]
    Perm,
    /// Malformed argument.
    #[error("invalid argument")]
    Invalid,
    /// Descriptor is not open or not open for the requested access.
    #[error("bad file descriptor")]
    BadFd,
    /// Descriptor table is full.
    #[error("too many open files")]
    TooManyFiles,
    /// Superblock ran out of inodes.
    #[error("no space left on device")]
    NoSpace,
    /// Symlink resolution exceeded the nesting limit.
    #[error("too many levels of symbolic links")]
    Loop,
    /// Component or path too long.
    #[error("file name too long")]
    NameTooLong,
    /// Object is in use (mount point, busy superblock).
    #[error("device or resource busy")]
    Busy,
    /// Conflicting byte-range lock.
    #[error("resource temporarily unavailable")]
    Again,
    /// Rename or link across superblocks.
    #[error("cross-device link")]
    CrossDevice,
    /// Unknown filesystem type.
    #[error("no such device")]
    NoDevice,
    /// Extended attribute not present.
    #[error("no data available")]
    NoData,
    /// Seek on an object without a position.
    #[error("illegal seek")]
    IllegalSeek,
    /// Result does not fit the caller's buffer.
    #[error("result out of range")]
    Range,
    /// Filesystem op not supported by this inode.
    #[error("operation not supported")]
    NotSupported,
}

impl VfsError {
    /// Errno equivalent.
    pub const fn errno(self) -> Errno {
        match self {
            Self::NotFound => Errno::ENOENT,
            Self::Exists => Errno::EEXIST,
            Self::NotDir => Errno::ENOTDIR,
            Self::IsDir => Errno::EISDIR,
            Self::NotEmpty => Errno::ENOTEMPTY,
            Self::Access => Errno::EACCES,
            Self::Perm => Errno::EPERM,
            Self::Invalid => Errno::EINVAL,
            Self::BadFd => Errno::EBADF,
            Self::TooManyFiles => Errno::EMFILE,
            Self::NoSpace => Errno::ENOSPC,
            Self::Loop => Errno::ELOOP,
            Self::NameTooLong => Errno::ENAMETOOLONG,
            Self::Busy => Errno::EBUSY,
            Self::Again => Errno::EAGAIN,
            Self::CrossDevice => Errno::EXDEV,
            Self::NoDevice => Errno::ENODEV,
            Self::NoData => Errno::ENODATA,
            Self::IllegalSeek => Errno::ESPIPE,
            Self::Range => Errno::ERANGE,
            Self::NotSupported => Errno::EOPNOTSUPP,
        }
    }

    /// Negative domain code (`VFS_ENOENT` and friends).
    pub const fn code(self) -> i32 {
        -self.errno().code()
    }
}

impl From<VfsError> for Errno {
    fn from(value: VfsError) -> Self {
        value.errno()
    }
}

/// `-ENOENT`.
pub const VFS_ENOENT: i32 = VfsError::NotFound.code();
/// `-EEXIST`.
pub const VFS_EEXIST: i32 = VfsError::Exists.code();
/// `-ENOTDIR`.
pub const VFS_ENOTDIR: i32 = VfsError::NotDir.code();
/// `-EISDIR`.
pub const VFS_EISDIR: i32 = VfsError::IsDir.code();
/// `-ENOTEMPTY`.
pub const VFS_ENOTEMPTY: i32 = VfsError::NotEmpty.code();
/// `-EACCES`.
pub const VFS_EACCES: i32 = VfsError::Access.code();
/// `-EPERM`.
pub const VFS_EPERM: i32 = VfsError::Perm.code();
/// `-EINVAL`.
pub const VFS_EINVAL: i32 = VfsError::Invalid.code();
/// `-EBADF`.
pub const VFS_EBADF: i32 = VfsError::BadFd.code();
/// `-EMFILE`.
pub const VFS_EMFILE: i32 = VfsError::TooManyFiles.code();
/// `-ELOOP`.
pub const VFS_ELOOP: i32 = VfsError::Loop.code();
/// `-EBUSY`.
pub const VFS_EBUSY: i32 = VfsError::Busy.code();
/// `-EAGAIN`.
pub const VFS_EAGAIN: i32 = VfsError::Again.code();
