// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Superblocks and filesystem types.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kos_abi::time::Timespec;
use kos_abi::Credentials;
use parking_lot::Mutex;

use crate::error::{Result, VfsError};
use crate::inode::{FileOps, FileType, Ino, Inode, InodeData, InodeInner, InodeOps, InodeRef, S_IFMT};

/// Filesystem statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatFs {
    /// Filesystem type name.
    pub fs_type: &'static str,
    /// Device number.
    pub dev: u32,
    /// Block size.
    pub block_size: u32,
    /// Inode budget.
    pub total_inodes: u64,
    /// Inodes still available.
    pub free_inodes: u64,
    /// Longest accepted component.
    pub name_max: u32,
}

/// Superblock operation capability set.
pub trait SuperOps: Send + Sync {
    /// Filesystem type name.
    fn fs_name(&self) -> &'static str;

    /// Initial in-core state for a new inode of `ty`.
    fn alloc_inode(&self, ty: FileType) -> InodeInner {
        InodeInner { data: InodeData::for_type(ty), ..InodeInner::default() }
    }

    /// Inode ops installed on inodes of `ty`.
    fn inode_ops(&self, _ty: FileType) -> Option<Arc<dyn InodeOps>> {
        None
    }

    /// Reads an inode that is not in the in-core hash.
    fn read_inode(&self, _ino: Ino) -> Result<InodeInner> {
        Err(VfsError::NotFound)
    }

    /// Writes back an inode before it leaves the hash.
    fn write_inode(&self, _inode: &Inode) -> Result<()> {
        Ok(())
    }

    /// Reclaims an inode whose last link and last handle are gone.
    fn delete_inode(&self, _inode: &Inode) {}

    /// Called when the last handle to a linked inode goes away. Returning true
    /// evicts it from the hash.
    fn drop_inode(&self, _inode: &Inode) -> bool {
        true
    }

    /// Filesystem statistics.
    fn statfs(&self, sb: &SuperBlock) -> StatFs {
        StatFs {
            fs_type: self.fs_name(),
            dev: sb.dev(),
            block_size: sb.block_size(),
            total_inodes: sb.max_inodes(),
            free_inodes: sb.free_inodes(),
            name_max: kos_abi::NAME_MAX as u32,
        }
    }
}

/// Mountable filesystem type.
pub trait FileSystemType: Send + Sync {
    /// Registered name (`ramfs`, `devfs`).
    fn name(&self) -> &'static str;

    /// Builds a superblock with a populated root directory.
    fn mount(&self, dev: u32, source: &str) -> Result<Arc<SuperBlock>>;
}

/// One mounted filesystem instance.
pub struct SuperBlock {
    dev: u32,
    block_size: u32,
    max_inodes: u64,
    free_inodes: AtomicU64,
    next_ino: AtomicU64,
    root_ino: AtomicU64,
    inodes: Mutex<HashMap<Ino, Arc<Inode>>>,
    ops: Arc<dyn SuperOps>,
    this: Weak<SuperBlock>,
}

impl fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("fs", &self.ops.fs_name())
            .field("dev", &self.dev)
            .field("free_inodes", &self.free_inodes())
            .finish_non_exhaustive()
    }
}

impl SuperBlock {
    /// Creates an empty superblock.
    pub fn new(dev: u32, ops: Arc<dyn SuperOps>, max_inodes: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            dev,
            block_size: 4096,
            max_inodes,
            free_inodes: AtomicU64::new(max_inodes),
            next_ino: AtomicU64::new(1),
            root_ino: AtomicU64::new(0),
            inodes: Mutex::new(HashMap::new()),
            ops,
            this: this.clone(),
        })
    }

    /// Device number.
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Block size.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Inode budget.
    pub fn max_inodes(&self) -> u64 {
        self.max_inodes
    }

    /// Inodes still available.
    pub fn free_inodes(&self) -> u64 {
        self.free_inodes.load(Ordering::Acquire)
    }

    /// Filesystem type name.
    pub fn fs_name(&self) -> &'static str {
        self.ops.fs_name()
    }

    /// Operation set.
    pub fn ops(&self) -> &Arc<dyn SuperOps> {
        &self.ops
    }

    /// Root directory inode number (0 until set).
    pub fn root_ino(&self) -> Ino {
        self.root_ino.load(Ordering::Acquire)
    }

    /// Records the root directory inode.
    pub fn set_root(&self, ino: Ino) {
        self.root_ino.store(ino, Ordering::Release);
    }

    /// Inodes currently in the in-core hash.
    pub fn cached_inodes(&self) -> usize {
        self.inodes.lock().len()
    }

    /// Statistics via the filesystem op.
    pub fn statfs(&self) -> StatFs {
        self.ops.statfs(self)
    }

    /// `alloc_inode` with the filesystem's default op sets.
    pub fn alloc_inode(&self, mode: u32, cred: &Credentials) -> Result<InodeRef> {
        let ty = FileType::from_mode(mode).ok_or(VfsError::Invalid)?;
        self.alloc_inode_with(mode, cred, self.ops.inode_ops(ty), None)
    }

    /// `alloc_inode` with explicit op sets (device nodes).
    pub fn alloc_inode_with(
        &self,
        mode: u32,
        cred: &Credentials,
        iops: Option<Arc<dyn InodeOps>>,
        fops: Option<Arc<dyn FileOps>>,
    ) -> Result<InodeRef> {
        let ty = FileType::from_mode(mode).ok_or(VfsError::Invalid)?;
        self.free_inodes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| VfsError::NoSpace)?;
        let ino = self.next_ino.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.ops.alloc_inode(ty);
        let now = Timespec::now();
        inner.attr.mode = (mode & !S_IFMT) | ty.mode_bits();
        inner.attr.uid = cred.uid;
        inner.attr.gid = cred.gid;
        inner.attr.nlink = if ty == FileType::Directory { 2 } else { 1 };
        inner.attr.blksize = self.block_size;
        inner.attr.atime = now;
        inner.attr.mtime = now;
        inner.attr.ctime = now;
        let inode = Arc::new(Inode::new(ino, self.this.clone(), self.dev, inner, iops, fops));
        let handle = inode.get_ref();
        self.inodes.lock().insert(ino, inode);
        log::trace!("vfs: dev {} alloc ino {ino} mode {mode:o}", self.dev);
        Ok(handle)
    }

    /// `iget`: hashed inode with its count raised, or a stub read in by the
    /// filesystem.
    pub fn iget(&self, ino: Ino) -> Result<InodeRef> {
        let mut table = self.inodes.lock();
        if let Some(inode) = table.get(&ino) {
            return Ok(inode.get_ref());
        }
        let inner = self.ops.read_inode(ino)?;
        let ty = inner.attr.file_type().ok_or(VfsError::Invalid)?;
        let inode =
            Arc::new(Inode::new(ino, self.this.clone(), self.dev, inner, self.ops.inode_ops(ty), None));
        let handle = inode.get_ref();
        table.insert(ino, inode);
        Ok(handle)
    }

    /// `iput` tail: the last handle to `inode` went away.
    pub(crate) fn release(&self, inode: &Arc<Inode>) {
        let mut table = self.inodes.lock();
        if inode.refcount() != 0 {
            return;
        }
        if inode.nlink() == 0 {
            table.remove(&inode.ino());
            drop(table);
            self.ops.delete_inode(inode);
            self.free_inodes.fetch_add(1, Ordering::AcqRel);
            log::trace!("vfs: dev {} deleted ino {}", self.dev, inode.ino());
        } else if self.ops.drop_inode(inode) {
            match self.ops.write_inode(inode) {
                Ok(()) => {
                    table.remove(&inode.ino());
                }
                Err(err) => kos_diag::kwarn!("vfs: writeback of ino {} failed: {err}", inode.ino()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{S_IFDIR, S_IFREG};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingOps {
        deleted: AtomicUsize,
        written: AtomicUsize,
    }

    impl SuperOps for CountingOps {
        fn fs_name(&self) -> &'static str {
            "counting"
        }

        fn write_inode(&self, _inode: &Inode) -> Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete_inode(&self, _inode: &Inode) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn alloc_consumes_budget_and_reports_nospace() {
        let sb = SuperBlock::new(7, Arc::new(CountingOps::default()), 2);
        let a = sb.alloc_inode(S_IFREG | 0o644, &Credentials::ROOT).expect("first");
        let _b = sb.alloc_inode(S_IFDIR | 0o755, &Credentials::ROOT).expect("second");
        assert_eq!(sb.alloc_inode(S_IFREG, &Credentials::ROOT).unwrap_err(), VfsError::NoSpace);
        assert_eq!(a.nlink(), 1);
        assert_eq!(sb.free_inodes(), 0);
    }

    #[test]
    fn iput_of_unlinked_inode_deletes_it() {
        let ops = Arc::new(CountingOps::default());
        let sb = SuperBlock::new(1, ops.clone(), 8);
        let inode = sb.alloc_inode(S_IFREG | 0o600, &Credentials::ROOT).expect("alloc");
        let ino = inode.ino();
        let second = sb.iget(ino).expect("hashed");
        assert_eq!(inode.refcount(), 2);
        inode.write().attr.nlink = 0;
        drop(inode);
        assert_eq!(ops.deleted.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(ops.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(sb.free_inodes(), 8);
        assert_eq!(sb.iget(ino).unwrap_err(), VfsError::NotFound);
    }

    #[test]
    fn iput_of_linked_inode_writes_back_and_evicts() {
        let ops = Arc::new(CountingOps::default());
        let sb = SuperBlock::new(1, ops.clone(), 8);
        let inode = sb.alloc_inode(S_IFREG | 0o600, &Credentials::new(5, 5)).expect("alloc");
        assert_eq!(inode.attr().uid, 5);
        drop(inode);
        assert_eq!(ops.written.load(Ordering::SeqCst), 1);
        assert_eq!(sb.cached_inodes(), 0);
    }
}
