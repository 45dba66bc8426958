// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Component-wise path resolution.

use bitflags::bitflags;
use kos_abi::{Credentials, NAME_MAX, PATH_MAX};

use crate::config::MAX_SYMLINK_DEPTH;
use crate::dcache::DcacheLookup;
use crate::dentry::{Dentry, DentryRef};
use crate::error::{Result, VfsError};
use crate::inode::{FileType, InodeData, MAY_EXEC};
use crate::vfs::Vfs;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Path walk modifiers.
    pub struct LookupFlags: u32 {
        /// Follow a symlink in the final component.
        const FOLLOW = 1 << 0;
        /// The final component must be a directory.
        const DIRECTORY = 1 << 1;
    }
}

struct WalkState<'a> {
    root: &'a DentryRef,
    cred: &'a Credentials,
    symlink_depth: u32,
}

/// Rejects empty, dot and oversized names.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VfsError::Invalid);
    }
    if name.len() > NAME_MAX {
        return Err(VfsError::NameTooLong);
    }
    Ok(())
}

impl Vfs {
    /// `path_lookup`: resolves `path` from `base` (relative) or `root`
    /// (absolute).
    pub fn path_lookup(
        &self,
        path: &str,
        flags: LookupFlags,
        base: &DentryRef,
        root: &DentryRef,
        cred: &Credentials,
    ) -> Result<DentryRef> {
        let mut state = WalkState { root, cred, symlink_depth: 0 };
        let found = self.walk(&mut state, base.clone(), path, flags.contains(LookupFlags::FOLLOW))?;
        if flags.contains(LookupFlags::DIRECTORY) && !found.inode().is_dir() {
            return Err(VfsError::NotDir);
        }
        Ok(found)
    }

    /// Resolves everything but the last component. Returns the parent
    /// directory and the final name.
    pub fn lookup_parent(
        &self,
        path: &str,
        base: &DentryRef,
        root: &DentryRef,
        cred: &Credentials,
    ) -> Result<(DentryRef, String)> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(if path.is_empty() { VfsError::NotFound } else { VfsError::Busy });
        }
        let (dir, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => (".", trimmed),
        };
        check_name(name)?;
        let parent = self.path_lookup(dir, LookupFlags::FOLLOW | LookupFlags::DIRECTORY, base, root, cred)?;
        Ok((parent, name.to_string()))
    }

    /// Looks `name` up in `dir` after checking search permission, crossing
    /// into a mount if one covers the result.
    pub fn lookup_child(&self, dir: &DentryRef, name: &str, cred: &Credentials) -> Result<Option<DentryRef>> {
        if !dir.inode().is_dir() {
            return Err(VfsError::NotDir);
        }
        dir.inode().permission(cred, MAY_EXEC)?;
        Ok(self.d_lookup(dir, name)?.map(|d| self.follow_mount(d)))
    }

    /// Cache lookup with revalidation, falling back to the directory's lookup
    /// op. Misses are remembered as negative entries.
    pub(crate) fn d_lookup(&self, parent: &DentryRef, name: &str) -> Result<Option<DentryRef>> {
        match self.dcache.lookup(parent, name) {
            DcacheLookup::Hit(dentry) => return Ok(Some(dentry)),
            DcacheLookup::Negative => return Ok(None),
            DcacheLookup::Stale(dentry) => {
                let current = parent.inode().lookup(name)?;
                if current == Some(dentry.inode().ino()) && dentry.inode().nlink() > 0 {
                    self.dcache.refresh(&dentry);
                    return Ok(Some(dentry));
                }
                self.dcache.d_drop(&dentry);
            }
            DcacheLookup::Miss => {}
        }
        // Read before the lookup so a concurrent create invalidates the entry.
        let dir_version = parent.inode().read().dir_version;
        let Some(ino) = parent.inode().lookup(name)? else {
            self.dcache.insert_negative(parent, name, dir_version);
            return Ok(None);
        };
        let sb = parent.inode().sb().ok_or(VfsError::NotFound)?;
        let inode = sb.iget(ino)?;
        Ok(Some(self.dcache.insert(Dentry::alloc(name, Some(parent.clone()), inode))))
    }

    fn walk(&self, state: &mut WalkState<'_>, base: DentryRef, path: &str, follow_last: bool) -> Result<DentryRef> {
        if path.is_empty() {
            return Err(VfsError::NotFound);
        }
        if path.len() >= PATH_MAX {
            return Err(VfsError::NameTooLong);
        }
        let mut current = if path.starts_with('/') { state.root.clone() } else { base };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (idx, component) in components.iter().enumerate() {
            let last = idx + 1 == components.len();
            if !current.inode().is_dir() {
                return Err(VfsError::NotDir);
            }
            match *component {
                "." => {}
                ".." => {
                    if !current.ptr_eq(state.root) {
                        if let Some(parent) = current.parent() {
                            current = parent;
                        }
                    }
                }
                name => {
                    if name.len() > NAME_MAX {
                        return Err(VfsError::NameTooLong);
                    }
                    current.inode().permission(state.cred, MAY_EXEC)?;
                    let child = self.d_lookup(&current, name)?.ok_or(VfsError::NotFound)?;
                    let child = if child.inode().file_type() == Some(FileType::Symlink) && (!last || follow_last) {
                        state.symlink_depth += 1;
                        if state.symlink_depth > MAX_SYMLINK_DEPTH {
                            return Err(VfsError::Loop);
                        }
                        let target = match &child.inode().read().data {
                            InodeData::Symlink(target) => target.clone(),
                            _ => return Err(VfsError::Invalid),
                        };
                        self.walk(state, current.clone(), &target, true)?
                    } else {
                        child
                    };
                    current = self.follow_mount(child);
                }
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::inode::{S_IFDIR, S_IFREG};
    use std::sync::Arc;

    fn setup() -> (Arc<Vfs>, DentryRef) {
        let vfs = Vfs::new(VfsConfig::default()).expect("boot");
        let root = vfs.root();
        (vfs, root)
    }

    fn lookup(vfs: &Vfs, root: &DentryRef, path: &str, flags: LookupFlags) -> Result<DentryRef> {
        vfs.path_lookup(path, flags, root, root, &Credentials::ROOT)
    }

    #[test]
    fn dot_and_dotdot_resolve() {
        let (vfs, root) = setup();
        let a = vfs.mkdir(&root, "a", S_IFDIR | 0o755, &Credentials::ROOT).expect("a");
        vfs.mkdir(&a, "b", S_IFDIR | 0o755, &Credentials::ROOT).expect("b");
        let b = lookup(&vfs, &root, "/a/./b/../b", LookupFlags::empty()).expect("walk");
        assert_eq!(b.path(), "/a/b");
        let top = lookup(&vfs, &root, "/../../a/..", LookupFlags::empty()).expect("clamped");
        assert!(top.ptr_eq(&root));
        let rel = vfs.path_lookup("b", LookupFlags::empty(), &a, &root, &Credentials::ROOT).expect("relative");
        assert_eq!(rel.path(), "/a/b");
    }

    #[test]
    fn symlinks_follow_relative_to_their_directory() {
        let (vfs, root) = setup();
        let etc = vfs.mkdir(&root, "etc", S_IFDIR | 0o755, &Credentials::ROOT).expect("etc");
        vfs.create(&etc, "hosts", S_IFREG | 0o644, &Credentials::ROOT).expect("hosts");
        vfs.symlink(&etc, "alias", "hosts", &Credentials::ROOT).expect("link");
        vfs.symlink(&root, "e", "/etc", &Credentials::ROOT).expect("dirlink");
        let resolved = lookup(&vfs, &root, "/e/alias", LookupFlags::FOLLOW).expect("follow");
        assert_eq!(resolved.path(), "/etc/hosts");
        let raw = lookup(&vfs, &root, "/e/alias", LookupFlags::empty()).expect("nofollow");
        assert_eq!(raw.inode().file_type(), Some(FileType::Symlink));
    }

    #[test]
    fn symlink_loop_fails_with_eloop() {
        let (vfs, root) = setup();
        vfs.symlink(&root, "x", "y", &Credentials::ROOT).expect("x");
        vfs.symlink(&root, "y", "x", &Credentials::ROOT).expect("y");
        assert_eq!(lookup(&vfs, &root, "/x", LookupFlags::FOLLOW).unwrap_err(), VfsError::Loop);
    }

    #[test]
    fn errors_for_missing_and_non_directory_components() {
        let (vfs, root) = setup();
        vfs.create(&root, "file", S_IFREG | 0o644, &Credentials::ROOT).expect("file");
        assert_eq!(lookup(&vfs, &root, "/nope", LookupFlags::empty()).unwrap_err(), VfsError::NotFound);
        assert_eq!(lookup(&vfs, &root, "/file/x", LookupFlags::empty()).unwrap_err(), VfsError::NotDir);
        assert_eq!(lookup(&vfs, &root, "/file", LookupFlags::DIRECTORY).unwrap_err(), VfsError::NotDir);
        let long = "n".repeat(NAME_MAX + 1);
        assert_eq!(lookup(&vfs, &root, &long, LookupFlags::empty()).unwrap_err(), VfsError::NameTooLong);
    }

    #[test]
    fn missing_names_are_cached_until_created() {
        let (vfs, root) = setup();
        let tmp = lookup(&vfs, &root, "/tmp", LookupFlags::empty()).expect("tmp");
        assert_eq!(lookup(&vfs, &root, "/tmp/later", LookupFlags::empty()).unwrap_err(), VfsError::NotFound);
        assert!(vfs.dcache().contains_negative(tmp.id(), "later"));
        let before = vfs.dcache().stats().negative_hits;
        assert_eq!(lookup(&vfs, &root, "/tmp/later", LookupFlags::empty()).unwrap_err(), VfsError::NotFound);
        assert_eq!(vfs.dcache().stats().negative_hits, before + 1);

        vfs.create(&tmp, "later", S_IFREG | 0o644, &Credentials::ROOT).expect("create");
        let found = lookup(&vfs, &root, "/tmp/later", LookupFlags::empty()).expect("found");
        assert_eq!(found.path(), "/tmp/later");
        assert!(!vfs.dcache().contains_negative(tmp.id(), "later"));
    }

    #[test]
    fn search_permission_is_checked_per_component() {
        let (vfs, root) = setup();
        let private = vfs.mkdir(&root, "private", S_IFDIR | 0o700, &Credentials::ROOT).expect("dir");
        vfs.create(&private, "secret", S_IFREG | 0o644, &Credentials::ROOT).expect("file");
        let user = Credentials::new(1000, 1000);
        assert_eq!(
            vfs.path_lookup("/private/secret", LookupFlags::empty(), &root, &root, &user).unwrap_err(),
            VfsError::Access
        );
    }

    #[test]
    fn walks_cross_into_mounts_and_back_out() {
        let (vfs, root) = setup();
        let dev = lookup(&vfs, &root, "/dev", LookupFlags::empty()).expect("dev");
        assert_eq!(dev.inode().dev(), 2);
        let up = lookup(&vfs, &root, "/dev/..", LookupFlags::empty()).expect("up");
        assert!(up.ptr_eq(&root));
    }

    #[test]
    fn lookup_parent_splits_last_component() {
        let (vfs, root) = setup();
        let (parent, name) = vfs.lookup_parent("/tmp/x/", &root, &root, &Credentials::ROOT).expect("split");
        assert_eq!(parent.path(), "/tmp");
        assert_eq!(name, "x");
        assert_eq!(vfs.lookup_parent("/", &root, &root, &Credentials::ROOT).unwrap_err(), VfsError::Busy);
        assert_eq!(vfs.lookup_parent("/tmp/..", &root, &root, &Credentials::ROOT).unwrap_err(), VfsError::Invalid);
    }
}
