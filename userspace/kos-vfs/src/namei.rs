// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Directory mutations: create, link, unlink, rename.
//!
//! Lock order: directory inode before child inode; with two directories the
//! ancestor first, otherwise lower inode number first. The dcache is only
//! touched after inode locks are released.

use kos_abi::time::Timespec;
use kos_abi::Credentials;
use parking_lot::RwLockWriteGuard;

use crate::dentry::{Dentry, DentryRef};
use crate::error::{Result, VfsError};
use crate::inode::{
    FileType, Inode, InodeData, InodeInner, S_IALLUGO, S_IFDIR, S_IFLNK, S_IFMT, S_ISGID, S_ISVTX,
    MAY_EXEC, MAY_WRITE,
};
use crate::path::check_name;
use crate::vfs::Vfs;

/// Sticky directories only let the entry owner, the directory owner or root
/// remove an entry.
fn check_sticky(dir: &Inode, victim: &Inode, cred: &Credentials) -> Result<()> {
    let dir_attr = dir.attr();
    if dir_attr.mode & S_ISVTX == 0 || cred.is_root() {
        return Ok(());
    }
    if cred.uid == victim.attr().uid || cred.uid == dir_attr.uid {
        Ok(())
    } else {
        Err(VfsError::Perm)
    }
}

fn may_modify(dir: &DentryRef, cred: &Credentials) -> Result<()> {
    if !dir.inode().is_dir() {
        return Err(VfsError::NotDir);
    }
    dir.inode().permission(cred, MAY_WRITE | MAY_EXEC)
}

fn is_ancestor(ancestor: &DentryRef, dentry: &DentryRef) -> bool {
    let mut cur = Some(dentry.clone());
    while let Some(d) = cur {
        if d.ptr_eq(ancestor) {
            return true;
        }
        cur = d.parent();
    }
    false
}

impl Vfs {
    fn create_node(
        &self,
        dir: &DentryRef,
        name: &str,
        mode: u32,
        cred: &Credentials,
        init: impl FnOnce(&mut InodeInner),
    ) -> Result<DentryRef> {
        check_name(name)?;
        may_modify(dir, cred)?;
        if dir.is_mountpoint() {
            return Err(VfsError::Busy);
        }
        let sb = dir.inode().sb().ok_or(VfsError::NotFound)?;
        let child = {
            let mut parent = dir.inode().write();
            if parent.attr.nlink == 0 {
                return Err(VfsError::NotFound);
            }
            if parent.dir()?.contains_key(name) {
                return Err(VfsError::Exists);
            }
            let child = sb.alloc_inode(mode, cred)?;
            {
                let mut inner = child.write();
                init(&mut *inner);
                if parent.attr.mode & S_ISGID != 0 {
                    inner.attr.gid = parent.attr.gid;
                    if inner.attr.file_type() == Some(FileType::Directory) {
                        inner.attr.mode |= S_ISGID;
                    }
                }
            }
            parent.dir_mut()?.insert(name.to_string(), child.ino());
            if mode & S_IFMT == S_IFDIR {
                parent.attr.nlink += 1;
            }
            parent.touch_modified();
            child
        };
        Ok(self.dcache.insert(Dentry::alloc(name, Some(dir.clone()), child)))
    }

    /// Creates a node of the type encoded in `mode` (regular file when no type
    /// bits are given).
    pub fn create(&self, dir: &DentryRef, name: &str, mode: u32, cred: &Credentials) -> Result<DentryRef> {
        let mode = if mode & S_IFMT == 0 { mode | FileType::Regular.mode_bits() } else { mode };
        self.create_node(dir, name, mode, cred, |_| {})
    }

    /// Creates a directory.
    pub fn mkdir(&self, dir: &DentryRef, name: &str, mode: u32, cred: &Credentials) -> Result<DentryRef> {
        self.create_node(dir, name, S_IFDIR | (mode & S_IALLUGO), cred, |_| {})
    }

    /// Creates a symlink pointing at `target`.
    pub fn symlink(&self, dir: &DentryRef, name: &str, target: &str, cred: &Credentials) -> Result<DentryRef> {
        if target.is_empty() {
            return Err(VfsError::NotFound);
        }
        if target.len() >= kos_abi::PATH_MAX {
            return Err(VfsError::NameTooLong);
        }
        self.create_node(dir, name, S_IFLNK | 0o777, cred, |inner| {
            inner.data = InodeData::Symlink(target.to_string());
            inner.attr.set_size(target.len() as u64);
        })
    }

    /// Adds a hard link to `old` as `dir/name`.
    pub fn link(&self, old: &DentryRef, dir: &DentryRef, name: &str, cred: &Credentials) -> Result<DentryRef> {
        check_name(name)?;
        if old.inode().is_dir() {
            return Err(VfsError::Perm);
        }
        if old.inode().dev() != dir.inode().dev() {
            return Err(VfsError::CrossDevice);
        }
        may_modify(dir, cred)?;
        {
            let mut parent = dir.inode().write();
            if parent.attr.nlink == 0 {
                return Err(VfsError::NotFound);
            }
            if parent.dir()?.contains_key(name) {
                return Err(VfsError::Exists);
            }
            let mut target = old.inode().write();
            if target.attr.nlink == 0 {
                return Err(VfsError::NotFound);
            }
            target.attr.nlink += 1;
            target.attr.ctime = Timespec::now();
            parent.dir_mut()?.insert(name.to_string(), old.inode().ino());
            parent.touch_modified();
        }
        Ok(self.dcache.insert(Dentry::alloc(name, Some(dir.clone()), old.inode().clone())))
    }

    /// Removes a non-directory entry.
    pub fn unlink(&self, dir: &DentryRef, name: &str, cred: &Credentials) -> Result<()> {
        check_name(name)?;
        may_modify(dir, cred)?;
        let victim = self.d_lookup(dir, name)?.ok_or(VfsError::NotFound)?;
        if victim.inode().is_dir() {
            return Err(VfsError::IsDir);
        }
        if victim.is_mountpoint() {
            return Err(VfsError::Busy);
        }
        check_sticky(dir.inode(), victim.inode(), cred)?;
        {
            let mut parent = dir.inode().write();
            let map = parent.dir_mut()?;
            if map.get(name) != Some(&victim.inode().ino()) {
                return Err(VfsError::NotFound);
            }
            map.remove(name);
            parent.touch_modified();
        }
        {
            let mut inner = victim.inode().write();
            inner.attr.nlink = inner.attr.nlink.saturating_sub(1);
            inner.attr.ctime = Timespec::now();
        }
        self.dcache.d_drop(&victim);
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, dir: &DentryRef, name: &str, cred: &Credentials) -> Result<()> {
        check_name(name)?;
        may_modify(dir, cred)?;
        let victim = self.d_lookup(dir, name)?.ok_or(VfsError::NotFound)?;
        if !victim.inode().is_dir() {
            return Err(VfsError::NotDir);
        }
        if victim.is_mountpoint() {
            return Err(VfsError::Busy);
        }
        check_sticky(dir.inode(), victim.inode(), cred)?;
        {
            let mut parent = dir.inode().write();
            let mut target = victim.inode().write();
            if !target.dir()?.is_empty() {
                return Err(VfsError::NotEmpty);
            }
            let map = parent.dir_mut()?;
            if map.get(name) != Some(&victim.inode().ino()) {
                return Err(VfsError::NotFound);
            }
            map.remove(name);
            parent.attr.nlink = parent.attr.nlink.saturating_sub(1);
            parent.touch_modified();
            target.attr.nlink = 0;
            target.attr.ctime = Timespec::now();
        }
        self.dcache.d_drop(&victim);
        Ok(())
    }

    /// Renames `old_dir/old_name` to `new_dir/new_name`, replacing a
    /// compatible target.
    pub fn rename(
        &self,
        old_dir: &DentryRef,
        old_name: &str,
        new_dir: &DentryRef,
        new_name: &str,
        cred: &Credentials,
    ) -> Result<()> {
        check_name(old_name)?;
        check_name(new_name)?;
        may_modify(old_dir, cred)?;
        may_modify(new_dir, cred)?;
        let src = self.d_lookup(old_dir, old_name)?.ok_or(VfsError::NotFound)?;
        if src.inode().dev() != new_dir.inode().dev() {
            return Err(VfsError::CrossDevice);
        }
        if src.is_mountpoint() {
            return Err(VfsError::Busy);
        }
        check_sticky(old_dir.inode(), src.inode(), cred)?;
        let src_is_dir = src.inode().is_dir();
        if src_is_dir && is_ancestor(&src, new_dir) {
            return Err(VfsError::Invalid);
        }
        let dst = self.d_lookup(new_dir, new_name)?;
        if let Some(dst) = &dst {
            if dst.inode().ptr_eq(src.inode()) {
                return Ok(());
            }
            if dst.is_mountpoint() {
                return Err(VfsError::Busy);
            }
            check_sticky(new_dir.inode(), dst.inode(), cred)?;
            match (src_is_dir, dst.inode().is_dir()) {
                (true, false) => return Err(VfsError::NotDir),
                (false, true) => return Err(VfsError::IsDir),
                (true, true) if !dst.inode().read().dir()?.is_empty() => return Err(VfsError::NotEmpty),
                _ => {}
            }
        }
        let same_dir = old_dir.ptr_eq(new_dir);
        {
            let (mut old_guard, mut new_guard) = lock_pair(old_dir, new_dir);
            if old_guard.dir()?.get(old_name) != Some(&src.inode().ino()) {
                return Err(VfsError::NotFound);
            }
            let expected_dst = dst.as_ref().map(|d| d.inode().ino());
            let new_map_dst = match new_guard.as_mut() {
                Some(g) => g.dir()?.get(new_name).copied(),
                None => old_guard.dir()?.get(new_name).copied(),
            };
            if new_map_dst != expected_dst {
                return Err(VfsError::Busy);
            }
            old_guard.dir_mut()?.remove(old_name);
            let replaced_dir = dst.as_ref().is_some_and(|d| d.inode().is_dir());
            let target: &mut InodeInner = match new_guard.as_mut() {
                Some(g) => &mut **g,
                None => &mut *old_guard,
            };
            target.dir_mut()?.insert(new_name.to_string(), src.inode().ino());
            if replaced_dir {
                target.attr.nlink = target.attr.nlink.saturating_sub(1);
            }
            if src_is_dir && !same_dir {
                target.attr.nlink += 1;
            }
            target.touch_modified();
            if src_is_dir && !same_dir {
                old_guard.attr.nlink = old_guard.attr.nlink.saturating_sub(1);
            }
            old_guard.touch_modified();
        }
        if let Some(dst) = dst {
            {
                let mut inner = dst.inode().write();
                inner.attr.nlink = if inner.attr.file_type() == Some(FileType::Directory) {
                    0
                } else {
                    inner.attr.nlink.saturating_sub(1)
                };
                inner.attr.ctime = Timespec::now();
            }
            self.dcache.d_drop(&dst);
        }
        src.inode().write().attr.ctime = Timespec::now();
        self.dcache.d_move(&src, new_dir, new_name);
        Ok(())
    }
}

/// Write-locks one or two directories in a deadlock-free order.
fn lock_pair<'a>(
    old_dir: &'a DentryRef,
    new_dir: &'a DentryRef,
) -> (RwLockWriteGuard<'a, InodeInner>, Option<RwLockWriteGuard<'a, InodeInner>>) {
    if old_dir.ptr_eq(new_dir) {
        return (old_dir.inode().write(), None);
    }
    let old_first = if is_ancestor(old_dir, new_dir) {
        true
    } else if is_ancestor(new_dir, old_dir) {
        false
    } else {
        old_dir.inode().ino() < new_dir.inode().ino()
    };
    if old_first {
        let a = old_dir.inode().write();
        let b = new_dir.inode().write();
        (a, Some(b))
    } else {
        let b = new_dir.inode().write();
        let a = old_dir.inode().write();
        (a, Some(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::inode::S_IFREG;
    use std::sync::Arc;

    fn setup() -> (Arc<Vfs>, DentryRef) {
        let vfs = Vfs::new(VfsConfig::default()).expect("boot");
        let root = vfs.root();
        (vfs, root)
    }

    #[test]
    fn mkdir_bumps_parent_links_and_rmdir_restores() {
        let (vfs, root) = setup();
        let before = root.inode().nlink();
        let d = vfs.mkdir(&root, "d", 0o755, &Credentials::ROOT).expect("mkdir");
        assert_eq!(d.inode().nlink(), 2);
        assert_eq!(root.inode().nlink(), before + 1);
        assert_eq!(vfs.mkdir(&root, "d", 0o755, &Credentials::ROOT).unwrap_err(), VfsError::Exists);
        vfs.create(&d, "f", S_IFREG | 0o644, &Credentials::ROOT).expect("file");
        assert_eq!(vfs.rmdir(&root, "d", &Credentials::ROOT), Err(VfsError::NotEmpty));
        vfs.unlink(&d, "f", &Credentials::ROOT).expect("unlink");
        vfs.rmdir(&root, "d", &Credentials::ROOT).expect("rmdir");
        assert_eq!(root.inode().nlink(), before);
        assert_eq!(d.inode().nlink(), 0);
        assert_eq!(vfs.create(&d, "g", 0o644, &Credentials::ROOT).unwrap_err(), VfsError::NotFound);
    }

    #[test]
    fn hard_links_share_the_inode() {
        let (vfs, root) = setup();
        let f = vfs.create(&root, "f", 0o644, &Credentials::ROOT).expect("create");
        let g = vfs.link(&f, &root, "g", &Credentials::ROOT).expect("link");
        assert!(f.inode().ptr_eq(g.inode()));
        assert_eq!(f.inode().nlink(), 2);
        vfs.unlink(&root, "f", &Credentials::ROOT).expect("unlink");
        assert_eq!(g.inode().nlink(), 1);
        let dir = vfs.mkdir(&root, "d", 0o755, &Credentials::ROOT).expect("dir");
        assert_eq!(vfs.link(&dir, &root, "dl", &Credentials::ROOT).unwrap_err(), VfsError::Perm);
    }

    #[test]
    fn sticky_directory_protects_foreign_entries() {
        let (vfs, root) = setup();
        let tmp = vfs.lookup_child(&root, "tmp", &Credentials::ROOT).expect("lookup").expect("tmp");
        let alice = Credentials::new(1000, 1000);
        let bob = Credentials::new(1001, 1001);
        vfs.create(&tmp, "mine", 0o666, &alice).expect("create");
        assert_eq!(vfs.unlink(&tmp, "mine", &bob), Err(VfsError::Perm));
        vfs.unlink(&tmp, "mine", &alice).expect("owner may unlink");
    }

    #[test]
    fn rename_moves_and_replaces() {
        let (vfs, root) = setup();
        let a = vfs.mkdir(&root, "a", 0o755, &Credentials::ROOT).expect("a");
        let b = vfs.mkdir(&root, "b", 0o755, &Credentials::ROOT).expect("b");
        let f = vfs.create(&a, "f", 0o644, &Credentials::ROOT).expect("f");
        let old = vfs.create(&b, "g", 0o644, &Credentials::ROOT).expect("g");
        vfs.rename(&a, "f", &b, "g", &Credentials::ROOT).expect("rename");
        assert_eq!(f.path(), "/b/g");
        assert_eq!(old.inode().nlink(), 0);
        assert!(a.inode().read().dir().expect("dir").is_empty());
        let moved = vfs.lookup_child(&b, "g", &Credentials::ROOT).expect("lookup").expect("g");
        assert!(moved.inode().ptr_eq(f.inode()));
    }

    #[test]
    fn rename_directory_updates_link_counts_and_rejects_cycles() {
        let (vfs, root) = setup();
        let a = vfs.mkdir(&root, "a", 0o755, &Credentials::ROOT).expect("a");
        let b = vfs.mkdir(&root, "b", 0o755, &Credentials::ROOT).expect("b");
        let sub = vfs.mkdir(&a, "sub", 0o755, &Credentials::ROOT).expect("sub");
        vfs.rename(&a, "sub", &b, "sub", &Credentials::ROOT).expect("move dir");
        assert_eq!(a.inode().nlink(), 2);
        assert_eq!(b.inode().nlink(), 3);
        assert_eq!(vfs.rename(&root, "b", &sub, "loop", &Credentials::ROOT), Err(VfsError::Invalid));
        let f = vfs.create(&a, "f", 0o644, &Credentials::ROOT).expect("f");
        assert_eq!(vfs.rename(&a, "f", &b, "sub", &Credentials::ROOT), Err(VfsError::IsDir));
        assert_eq!(vfs.rename(&b, "sub", &a, "f", &Credentials::ROOT), Err(VfsError::NotDir));
        drop(f);
    }

    #[test]
    fn rename_across_devices_is_rejected() {
        let (vfs, root) = setup();
        let f = vfs.create(&root, "f", 0o644, &Credentials::ROOT).expect("f");
        let dev = vfs.lookup_child(&root, "dev", &Credentials::ROOT).expect("lookup").expect("dev");
        assert_eq!(vfs.rename(&root, "f", &dev, "f", &Credentials::ROOT), Err(VfsError::CrossDevice));
        assert_eq!(vfs.link(&f, &dev, "f", &Credentials::ROOT).unwrap_err(), VfsError::CrossDevice);
    }
}
