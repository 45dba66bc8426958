// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dentries: cached name -> inode bindings.
//!
//! The child -> parent link is an owning, counted [`DentryRef`]; parents never
//! point at children (the dcache hash is the only way down). A dentry's count
//! therefore includes one reference per live child, which keeps parents of
//! cached entries out of LRU eviction.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::inode::InodeRef;

/// Dentry identity used in dcache keys.
pub type DentryId = u64;

pub(crate) const D_HASHED: u32 = 1 << 0;
pub(crate) const D_ROOT: u32 = 1 << 1;
pub(crate) const D_MOUNTED: u32 = 1 << 2;

static NEXT_DENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Name bound to an inode under a parent.
pub struct Dentry {
    id: DentryId,
    name: RwLock<String>,
    parent: RwLock<Option<DentryRef>>,
    inode: InodeRef,
    count: AtomicU32,
    cache_time_ns: AtomicU64,
    flags: AtomicU32,
}

impl fmt::Debug for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dentry")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("ino", &self.inode.ino())
            .field("count", &self.refcount())
            .finish()
    }
}

impl Dentry {
    /// `d_alloc`: a new, unhashed dentry holding one reference.
    pub fn alloc(name: &str, parent: Option<DentryRef>, inode: InodeRef) -> DentryRef {
        let dentry = Arc::new(Self {
            id: NEXT_DENTRY_ID.fetch_add(1, Ordering::Relaxed),
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(parent),
            inode,
            count: AtomicU32::new(0),
            cache_time_ns: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        });
        DentryRef::get(&dentry)
    }

    /// A filesystem or mount root: never hashed, children may be cached.
    pub(crate) fn alloc_root(name: &str, parent: Option<DentryRef>, inode: InodeRef) -> DentryRef {
        let root = Self::alloc(name, parent, inode);
        root.set_flag(D_ROOT);
        root
    }

    /// Identity.
    pub fn id(&self) -> DentryId {
        self.id
    }

    /// Component name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Parent, or `None` for the namespace root.
    pub fn parent(&self) -> Option<DentryRef> {
        self.parent.read().clone()
    }

    /// Bound inode.
    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    /// Outstanding references (users plus live children).
    pub fn refcount(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// In the dcache hash.
    pub fn is_hashed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & D_HASHED != 0
    }

    /// Filesystem or mount root.
    pub fn is_root(&self) -> bool {
        self.flags.load(Ordering::Acquire) & D_ROOT != 0
    }

    /// Something is mounted on this dentry.
    pub fn is_mountpoint(&self) -> bool {
        self.flags.load(Ordering::Acquire) & D_MOUNTED != 0
    }

    /// Absolute path reconstructed from the parent chain.
    pub fn path(&self) -> String {
        let mut parts = Vec::new();
        let mut cur = self.parent().map(|p| (self.name(), p));
        while let Some((name, parent)) = cur {
            parts.push(name);
            cur = parent.parent().map(|gp| (parent.name(), gp));
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        parts.reverse();
        let mut path = String::new();
        for part in parts {
            path.push('/');
            path.push_str(&part);
        }
        path
    }

    pub(crate) fn cache_time_ns(&self) -> u64 {
        self.cache_time_ns.load(Ordering::Acquire)
    }

    pub(crate) fn set_cache_time_ns(&self, now: u64) {
        self.cache_time_ns.store(now, Ordering::Release);
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub(crate) fn rebind(&self, parent: DentryRef, name: &str) {
        *self.name.write() = name.to_string();
        // Old parent reference drops after the lock is released.
        let old = self.parent.write().replace(parent);
        drop(old);
    }
}

/// Counted dentry handle; cloning is `dget`, dropping is `dput`.
pub struct DentryRef(Arc<Dentry>);

impl DentryRef {
    pub(crate) fn get(dentry: &Arc<Dentry>) -> Self {
        dentry.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(dentry))
    }

    pub(crate) fn arc(&self) -> &Arc<Dentry> {
        &self.0
    }

    /// True when both handles name the same dentry.
    pub fn ptr_eq(&self, other: &DentryRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for DentryRef {
    fn clone(&self) -> Self {
        Self::get(&self.0)
    }
}

impl Deref for DentryRef {
    type Target = Dentry;

    fn deref(&self) -> &Dentry {
        &self.0
    }
}

impl fmt::Debug for DentryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Drop for DentryRef {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{S_IFDIR, S_IFREG};
    use crate::ramfs::Ramfs;
    use crate::superblock::FileSystemType;
    use kos_abi::Credentials;

    #[test]
    fn children_pin_their_parent_and_build_paths() {
        let sb = Ramfs::new(8).mount(1, "t").expect("mount");
        let root = Dentry::alloc_root("/", None, sb.iget(sb.root_ino()).expect("root"));
        let dir = Dentry::alloc(
            "etc",
            Some(root.clone()),
            sb.alloc_inode(S_IFDIR | 0o755, &Credentials::ROOT).expect("dir"),
        );
        assert_eq!(root.refcount(), 2);
        let file = Dentry::alloc(
            "hosts",
            Some(dir.clone()),
            sb.alloc_inode(S_IFREG | 0o644, &Credentials::ROOT).expect("file"),
        );
        assert_eq!(file.path(), "/etc/hosts");
        assert_eq!(root.path(), "/");
        assert_eq!(dir.refcount(), 2);
        drop(file);
        assert_eq!(dir.refcount(), 1);
        assert!(root.is_root());
        assert!(!dir.is_hashed());
    }
}
