// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Virtual filesystem for the KOS userspace kernel
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptests for locks and dcache LRU,
//!   integration scenarios under tests/
//!
//! PUBLIC API:
//!   - Vfs: namespace boot, mount/umount, path walk, namei operations
//!   - VfsContext: per-process POSIX-like calls (open/read/write/stat/...)
//!   - Dcache: bounded LRU dentry cache with TTL and revalidation
//!   - posix_lock/remove_posix_locks: byte-range advisory locks
//!   - Ramfs/Devfs: built-in filesystem types
//!
//! INVARIANTS:
//!   - Inode and dentry handles are counted; dropping the last handle runs
//!     iput/dput, and an unlinked inode is reclaimed only then
//!   - Directory inode locks are taken before child inode locks; two
//!     directories lock ancestor first, otherwise lower inode number first
//!   - The dcache never evicts a dentry with a non-zero count
//!   - Symlink resolution stops at 40 nested links with `Loop`

pub mod api;
pub mod config;
pub mod dcache;
pub mod dentry;
pub mod devfs;
pub mod error;
pub mod file;
pub mod inode;
pub mod lock;
mod namei;
pub mod path;
pub mod ramfs;
pub mod superblock;
pub mod vfs;

pub use api::{DirEntry, DirStream, Stat, VfsContext, F_OK, R_OK, W_OK, XATTR_CREATE, XATTR_REPLACE, X_OK};
pub use config::VfsConfig;
pub use dcache::{Dcache, DcacheLookup, DcacheStats};
pub use dentry::{Dentry, DentryRef};
pub use error::{Result, VfsError};
pub use file::File;
pub use inode::{Acl, AclEntry, AclTag, FileType, Ino, Inode, InodeRef};
pub use lock::{posix_lock, remove_posix_locks, Flock, LockCmd, LockType};
pub use path::LookupFlags;
pub use superblock::{FileSystemType, StatFs, SuperBlock, SuperOps};
pub use vfs::{MountInfo, Vfs};
