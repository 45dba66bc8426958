// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inodes: metadata, payload, refcounting and permission checks.
//!
//! An inode lives in its superblock's hash for as long as the filesystem wants
//! it there; [`InodeRef`] is the counted handle (`iget`/`iput`). Dropping the
//! last handle hands the inode back to the superblock, which either deletes it
//! (`nlink == 0`) or asks the filesystem whether to evict it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use kos_abi::time::Timespec;
use kos_abi::Credentials;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, VfsError};
use crate::lock::HeldLock;
use crate::superblock::SuperBlock;

/// Inode number.
pub type Ino = u64;

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// FIFO.
pub const S_IFIFO: u32 = 0o010_000;
/// Set-user-id.
pub const S_ISUID: u32 = 0o4000;
/// Set-group-id.
pub const S_ISGID: u32 = 0o2000;
/// Sticky bit: only owners may remove entries.
pub const S_ISVTX: u32 = 0o1000;
/// Permission bits plus suid/sgid/sticky.
pub const S_IALLUGO: u32 = 0o7777;

/// Execute / search.
pub const MAY_EXEC: u32 = 0o1;
/// Write.
pub const MAY_WRITE: u32 = 0o2;
/// Read.
pub const MAY_READ: u32 = 0o4;

/// Size of the accounting unit reported in `blocks`.
pub const BLOCK_UNIT: u64 = 512;

/// Tagged inode variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file with a byte payload.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device backed by file ops.
    CharDevice,
    /// Named pipe.
    Fifo,
    /// Unix socket node.
    Socket,
}

impl FileType {
    /// Decodes the `S_IFMT` bits of `mode`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// `S_IFMT` bits for this type.
    pub const fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }
}

/// Inode attributes (`stat` fields).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InodeAttr {
    /// Type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last access.
    pub atime: Timespec,
    /// Last content change.
    pub mtime: Timespec,
    /// Last metadata change.
    pub ctime: Timespec,
    /// Preferred I/O size.
    pub blksize: u32,
    /// Allocated 512-byte units.
    pub blocks: u64,
    /// Device number for device nodes.
    pub rdev: u32,
}

impl InodeAttr {
    /// File type decoded from `mode`.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.mode & S_IALLUGO
    }

    /// Sets size and recomputes the block count.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.blocks = size.div_ceil(BLOCK_UNIT);
    }
}

/// Per-type payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InodeData {
    /// No payload (fifo, socket, freshly allocated stub).
    #[default]
    Empty,
    /// Regular file bytes.
    File(Vec<u8>),
    /// Directory entries, name -> inode number.
    Dir(BTreeMap<String, Ino>),
    /// Symlink target.
    Symlink(String),
    /// Device number.
    Device(u32),
}

impl InodeData {
    /// Initial payload for a new inode of type `ty`.
    pub fn for_type(ty: FileType) -> Self {
        match ty {
            FileType::Regular => Self::File(Vec::new()),
            FileType::Directory => Self::Dir(BTreeMap::new()),
            FileType::Symlink => Self::Symlink(String::new()),
            FileType::CharDevice => Self::Device(0),
            FileType::Fifo | FileType::Socket => Self::Empty,
        }
    }
}

/// State guarded by the inode's reader-writer lock.
#[derive(Clone, Debug, Default)]
pub struct InodeInner {
    /// Attributes.
    pub attr: InodeAttr,
    /// Payload.
    pub data: InodeData,
    /// Bumped whenever the directory map is handed out for mutation.
    pub dir_version: u64,
}

impl InodeInner {
    /// Touches mtime and ctime.
    pub fn touch_modified(&mut self) {
        let now = Timespec::now();
        self.attr.mtime = now;
        self.attr.ctime = now;
    }

    /// Directory map, or `NotDir`.
    pub fn dir(&self) -> Result<&BTreeMap<String, Ino>> {
        match &self.data {
            InodeData::Dir(map) => Ok(map),
            _ => Err(VfsError::NotDir),
        }
    }

    /// Mutable directory map, or `NotDir`.
    pub fn dir_mut(&mut self) -> Result<&mut BTreeMap<String, Ino>> {
        match &mut self.data {
            InodeData::Dir(map) => {
                self.dir_version = self.dir_version.wrapping_add(1);
                Ok(map)
            }
            _ => Err(VfsError::NotDir),
        }
    }
}

/// POSIX ACL entry tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AclTag {
    /// File owner.
    UserObj,
    /// Named user.
    User(u32),
    /// Owning group.
    GroupObj,
    /// Named group.
    Group(u32),
    /// Upper bound for named entries and the group class.
    Mask,
    /// Everyone else.
    Other,
}

/// One ACL entry: tag plus `rwx` bits (`MAY_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AclEntry {
    /// Who the entry applies to.
    pub tag: AclTag,
    /// `MAY_READ | MAY_WRITE | MAY_EXEC` subset.
    pub perm: u32,
}

/// Access control list attached to an inode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Acl {
    /// Entries in any order.
    pub entries: Vec<AclEntry>,
}

impl Acl {
    fn find(&self, tag: AclTag) -> Option<u32> {
        self.entries.iter().find(|e| e.tag == tag).map(|e| e.perm)
    }

    /// POSIX.1e access check algorithm.
    pub fn check(&self, attr: &InodeAttr, cred: &Credentials, mask: u32) -> Result<()> {
        let granted = |perm: u32| perm & mask == mask;
        let acl_mask = self.find(AclTag::Mask).unwrap_or(0o7);
        if cred.uid == attr.uid {
            let perm = self.find(AclTag::UserObj).unwrap_or((attr.mode >> 6) & 0o7);
            return if granted(perm) { Ok(()) } else { Err(VfsError::Access) };
        }
        if let Some(perm) = self.find(AclTag::User(cred.uid)) {
            return if granted(perm & acl_mask) { Ok(()) } else { Err(VfsError::Access) };
        }
        let mut group_matched = false;
        for entry in &self.entries {
            let matches = match entry.tag {
                AclTag::GroupObj => cred.gid == attr.gid,
                AclTag::Group(gid) => cred.gid == gid,
                _ => false,
            };
            if matches {
                group_matched = true;
                if granted(entry.perm & acl_mask) {
                    return Ok(());
                }
            }
        }
        if group_matched {
            return Err(VfsError::Access);
        }
        let other = self.find(AclTag::Other).unwrap_or(attr.mode & 0o7);
        if granted(other) {
            Ok(())
        } else {
            Err(VfsError::Access)
        }
    }
}

/// Inode operation capability set. Every method has a generic default.
pub trait InodeOps: Send + Sync {
    /// Resolves `name` inside directory `dir`.
    fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<Ino>> {
        Ok(dir.read().dir()?.get(name).copied())
    }

    /// Filesystem-specific access check. `None` defers to ACL/mode bits.
    fn permission(&self, _inode: &Inode, _cred: &Credentials, _mask: u32) -> Option<Result<()>> {
        None
    }
}

/// File operation capability set used by device-like inodes.
pub trait FileOps: Send + Sync {
    /// Reads at `pos` into `buf`.
    fn read(&self, inode: &Inode, pos: u64, buf: &mut [u8]) -> Result<usize>;
    /// Writes `data` at `pos`.
    fn write(&self, inode: &Inode, pos: u64, data: &[u8]) -> Result<usize>;
}

/// Filesystem object.
pub struct Inode {
    ino: Ino,
    sb: Weak<SuperBlock>,
    dev: u32,
    count: AtomicU32,
    inner: RwLock<InodeInner>,
    iops: Option<Arc<dyn InodeOps>>,
    fops: Option<Arc<dyn FileOps>>,
    xattrs: RwLock<BTreeMap<String, Vec<u8>>>,
    acl: RwLock<Option<Acl>>,
    pub(crate) locks: Mutex<Vec<HeldLock>>,
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("dev", &self.dev)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Inode {
    pub(crate) fn new(
        ino: Ino,
        sb: Weak<SuperBlock>,
        dev: u32,
        inner: InodeInner,
        iops: Option<Arc<dyn InodeOps>>,
        fops: Option<Arc<dyn FileOps>>,
    ) -> Self {
        Self {
            ino,
            sb,
            dev,
            count: AtomicU32::new(0),
            inner: RwLock::new(inner),
            iops,
            fops,
            xattrs: RwLock::new(BTreeMap::new()),
            acl: RwLock::new(None),
            locks: Mutex::new(Vec::new()),
        }
    }

    /// Inode number, unique within its superblock.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Device number of the owning superblock.
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Owning superblock, if still mounted.
    pub fn sb(&self) -> Option<Arc<SuperBlock>> {
        self.sb.upgrade()
    }

    /// Outstanding [`InodeRef`] handles.
    pub fn refcount(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Shared view of attributes and payload.
    pub fn read(&self) -> RwLockReadGuard<'_, InodeInner> {
        self.inner.read()
    }

    /// Exclusive view of attributes and payload.
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeInner> {
        self.inner.write()
    }

    /// Snapshot of the attributes.
    pub fn attr(&self) -> InodeAttr {
        self.inner.read().attr.clone()
    }

    /// Decoded file type.
    pub fn file_type(&self) -> Option<FileType> {
        self.inner.read().attr.file_type()
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    /// Current link count.
    pub fn nlink(&self) -> u32 {
        self.inner.read().attr.nlink
    }

    /// Inode op capability set.
    pub fn iops(&self) -> Option<&Arc<dyn InodeOps>> {
        self.iops.as_ref()
    }

    /// File op capability set.
    pub fn fops(&self) -> Option<&Arc<dyn FileOps>> {
        self.fops.as_ref()
    }

    /// Resolves `name` in this directory through the inode ops or the generic map.
    pub fn lookup(&self, name: &str) -> Result<Option<Ino>> {
        match &self.iops {
            Some(ops) => ops.lookup(self, name),
            None => Ok(self.read().dir()?.get(name).copied()),
        }
    }

    /// `inode_permission`: inode op, then ACL, then mode bits. uid 0 bypasses
    /// ACL and mode bits.
    pub fn permission(&self, cred: &Credentials, mask: u32) -> Result<()> {
        if let Some(verdict) = self.iops.as_ref().and_then(|ops| ops.permission(self, cred, mask)) {
            return verdict;
        }
        if cred.is_root() {
            return Ok(());
        }
        let attr = self.attr();
        if let Some(acl) = self.acl.read().as_ref() {
            return acl.check(&attr, cred, mask);
        }
        generic_permission(&attr, cred, mask)
    }

    /// Truncates or extends the payload; size, blocks, mtime and ctime change
    /// together under the write lock.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let len_usize = usize::try_from(len).map_err(|_| VfsError::Invalid)?;
        let mut inner = self.inner.write();
        match &mut inner.data {
            InodeData::File(bytes) => bytes.resize(len_usize, 0),
            InodeData::Dir(_) => return Err(VfsError::IsDir),
            _ => return Err(VfsError::Invalid),
        }
        inner.attr.set_size(len);
        inner.touch_modified();
        Ok(())
    }

    /// Installs or clears the ACL.
    pub fn set_acl(&self, acl: Option<Acl>) {
        *self.acl.write() = acl;
        self.inner.write().attr.ctime = Timespec::now();
    }

    /// Current ACL.
    pub fn acl(&self) -> Option<Acl> {
        self.acl.read().clone()
    }

    /// Extended attributes.
    pub fn xattrs(&self) -> &RwLock<BTreeMap<String, Vec<u8>>> {
        &self.xattrs
    }

    pub(crate) fn get_ref(self: &Arc<Self>) -> InodeRef {
        self.count.fetch_add(1, Ordering::AcqRel);
        InodeRef(Arc::clone(self))
    }
}

/// Mode-bit check: owner bits, then group bits, then other bits.
pub fn generic_permission(attr: &InodeAttr, cred: &Credentials, mask: u32) -> Result<()> {
    if cred.is_root() {
        return Ok(());
    }
    let bits = if cred.uid == attr.uid {
        (attr.mode >> 6) & 0o7
    } else if cred.gid == attr.gid {
        (attr.mode >> 3) & 0o7
    } else {
        attr.mode & 0o7
    };
    if bits & mask == mask {
        Ok(())
    } else {
        Err(VfsError::Access)
    }
}

/// Counted inode handle. Dropping it is `iput`.
pub struct InodeRef(Arc<Inode>);

impl InodeRef {
    /// Underlying shared inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.0
    }

    /// True when both handles name the same inode.
    pub fn ptr_eq(&self, other: &InodeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.0.get_ref()
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.0
    }
}

impl fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(sb) = self.0.sb.upgrade() {
                sb.release(&self.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(mode: u32, uid: u32, gid: u32) -> InodeAttr {
        InodeAttr { mode: S_IFREG | mode, uid, gid, nlink: 1, ..InodeAttr::default() }
    }

    #[test]
    fn generic_permission_picks_one_class() {
        let a = attr(0o640, 1000, 100);
        assert!(generic_permission(&a, &Credentials::new(1000, 1), MAY_READ | MAY_WRITE).is_ok());
        assert!(generic_permission(&a, &Credentials::new(1001, 100), MAY_READ).is_ok());
        assert_eq!(
            generic_permission(&a, &Credentials::new(1001, 100), MAY_WRITE),
            Err(VfsError::Access)
        );
        assert_eq!(generic_permission(&a, &Credentials::new(1002, 2), MAY_READ), Err(VfsError::Access));
        assert!(generic_permission(&a, &Credentials::ROOT, MAY_WRITE | MAY_EXEC).is_ok());
    }

    #[test]
    fn owner_class_does_not_fall_through() {
        let a = attr(0o077, 1000, 100);
        assert_eq!(generic_permission(&a, &Credentials::new(1000, 100), MAY_READ), Err(VfsError::Access));
    }

    #[test]
    fn acl_named_user_is_capped_by_mask() {
        let a = attr(0o600, 1000, 100);
        let acl = Acl {
            entries: vec![
                AclEntry { tag: AclTag::UserObj, perm: 0o6 },
                AclEntry { tag: AclTag::User(2000), perm: 0o6 },
                AclEntry { tag: AclTag::GroupObj, perm: 0 },
                AclEntry { tag: AclTag::Mask, perm: MAY_READ },
                AclEntry { tag: AclTag::Other, perm: 0 },
            ],
        };
        let named = Credentials::new(2000, 5);
        assert!(acl.check(&a, &named, MAY_READ).is_ok());
        assert_eq!(acl.check(&a, &named, MAY_WRITE), Err(VfsError::Access));
        assert_eq!(acl.check(&a, &Credentials::new(3000, 5), MAY_READ), Err(VfsError::Access));
    }

    #[test]
    fn acl_group_match_without_grant_denies() {
        let a = attr(0o604, 1000, 100);
        let acl = Acl {
            entries: vec![
                AclEntry { tag: AclTag::GroupObj, perm: 0 },
                AclEntry { tag: AclTag::Other, perm: MAY_READ },
            ],
        };
        assert_eq!(acl.check(&a, &Credentials::new(1, 100), MAY_READ), Err(VfsError::Access));
        assert!(acl.check(&a, &Credentials::new(1, 7), MAY_READ).is_ok());
    }

    #[test]
    fn file_type_round_trips_through_mode() {
        for ty in [
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::CharDevice,
            FileType::Fifo,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_mode(ty.mode_bits() | 0o644), Some(ty));
        }
        assert_eq!(FileType::from_mode(0o644), None);
    }
}
