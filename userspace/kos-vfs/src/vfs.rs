// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Namespace owner: dentry cache, root, mount table and filesystem registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kos_abi::time::{self, ClockSource};
use kos_abi::Credentials;
use parking_lot::RwLock;

use crate::config::VfsConfig;
use crate::dcache::Dcache;
use crate::dentry::{Dentry, DentryRef, D_MOUNTED};
use crate::devfs::Devfs;
use crate::error::{Result, VfsError};
use crate::inode::{S_IFDIR, S_ISVTX};
use crate::ramfs::Ramfs;
use crate::superblock::{FileSystemType, SuperBlock};

/// Mounted filesystem instance.
pub(crate) struct Mount {
    pub(crate) mountpoint: DentryRef,
    pub(crate) root: DentryRef,
    pub(crate) sb: Arc<SuperBlock>,
    pub(crate) source: String,
}

/// Read-only view of a mount table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    /// Source string given to `mount`.
    pub source: String,
    /// Absolute mount path.
    pub target: String,
    /// Filesystem type.
    pub fs_type: &'static str,
    /// Device number of the mounted superblock.
    pub dev: u32,
}

/// The virtual filesystem namespace.
pub struct Vfs {
    config: VfsConfig,
    pub(crate) dcache: Dcache,
    root: DentryRef,
    root_sb: Arc<SuperBlock>,
    mounts: RwLock<Vec<Mount>>,
    fs_types: RwLock<HashMap<&'static str, Arc<dyn FileSystemType>>>,
    next_dev: AtomicU32,
}

impl Vfs {
    /// Boots a namespace timed by the global clock.
    pub fn new(config: VfsConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, time::keeper().source())
    }

    /// Boots a namespace: ramfs root, `/tmp` and `/home` world-writable with
    /// the sticky bit, devfs on `/dev`.
    pub fn with_clock(config: VfsConfig, clock: Arc<dyn ClockSource>) -> Result<Arc<Self>> {
        let ramfs = Ramfs::new(config.ramfs_max_inodes);
        let root_sb = ramfs.mount(1, "rootfs")?;
        let root = Dentry::alloc_root("/", None, root_sb.iget(root_sb.root_ino())?);
        let mut fs_types: HashMap<&'static str, Arc<dyn FileSystemType>> = HashMap::new();
        fs_types.insert("ramfs", Arc::new(ramfs));
        fs_types.insert("devfs", Arc::new(Devfs));
        let vfs = Arc::new(Self {
            dcache: Dcache::from_config(&config, clock),
            config,
            root,
            root_sb,
            mounts: RwLock::new(Vec::new()),
            fs_types: RwLock::new(fs_types),
            next_dev: AtomicU32::new(2),
        });
        let cred = Credentials::ROOT;
        let root = vfs.root.clone();
        vfs.mkdir(&root, "tmp", S_IFDIR | S_ISVTX | 0o777, &cred)?;
        vfs.mkdir(&root, "home", S_IFDIR | S_ISVTX | 0o777, &cred)?;
        let dev = vfs.mkdir(&root, "dev", S_IFDIR | 0o755, &cred)?;
        vfs.mount("devfs", &dev, "devfs")?;
        log::info!("vfs: namespace ready (dcache {} entries)", vfs.dcache.capacity());
        Ok(vfs)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// Namespace root.
    pub fn root(&self) -> DentryRef {
        self.root.clone()
    }

    /// Root superblock.
    pub fn root_sb(&self) -> &Arc<SuperBlock> {
        &self.root_sb
    }

    /// Dentry cache.
    pub fn dcache(&self) -> &Dcache {
        &self.dcache
    }

    /// Registers an additional filesystem type.
    pub fn register_filesystem(&self, fs: Arc<dyn FileSystemType>) -> Result<()> {
        let mut types = self.fs_types.write();
        if types.contains_key(fs.name()) {
            return Err(VfsError::Busy);
        }
        types.insert(fs.name(), fs);
        Ok(())
    }

    /// Mounts a new `fs_type` instance on directory `target`.
    pub fn mount(&self, source: &str, target: &DentryRef, fs_type: &str) -> Result<()> {
        if !target.inode().is_dir() {
            return Err(VfsError::NotDir);
        }
        let fs = self.fs_types.read().get(fs_type).cloned().ok_or(VfsError::NoDevice)?;
        let mut mounts = self.mounts.write();
        if target.is_mountpoint() {
            return Err(VfsError::Busy);
        }
        let dev = self.next_dev.fetch_add(1, Ordering::Relaxed);
        let sb = fs.mount(dev, source)?;
        let root = Dentry::alloc_root(&target.name(), target.parent(), sb.iget(sb.root_ino())?);
        target.set_flag(D_MOUNTED);
        log::info!("vfs: mounted {fs_type} ({source}) on {} as dev {dev}", target.path());
        mounts.push(Mount { mountpoint: target.clone(), root, sb, source: source.to_string() });
        Ok(())
    }

    /// Unmounts the filesystem whose root is `target`. Fails with `Busy` while
    /// anything below it is still referenced.
    pub fn umount(&self, target: &DentryRef) -> Result<()> {
        let mut mounts = self.mounts.write();
        let idx = mounts.iter().position(|m| m.root.ptr_eq(target)).ok_or(VfsError::Invalid)?;
        let dev = mounts[idx].sb.dev();
        self.dcache.shrink(Some(dev));
        // One reference for the mount table, one for the caller.
        if mounts[idx].root.refcount() > 2 {
            return Err(VfsError::Busy);
        }
        let mount = mounts.remove(idx);
        if !mounts.iter().any(|m| m.mountpoint.ptr_eq(&mount.mountpoint)) {
            mount.mountpoint.clear_flag(D_MOUNTED);
        }
        log::info!("vfs: unmounted dev {dev} from {}", mount.mountpoint.path());
        Ok(())
    }

    /// Mounted root covering `dentry`, following stacked mounts.
    pub fn follow_mount(&self, dentry: DentryRef) -> DentryRef {
        let mut current = dentry;
        while current.is_mountpoint() {
            let next = self
                .mounts
                .read()
                .iter()
                .rev()
                .find(|m| m.mountpoint.ptr_eq(&current))
                .map(|m| m.root.clone());
            match next {
                Some(root) => current = root,
                None => break,
            }
        }
        current
    }

    /// Mount table snapshot.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .read()
            .iter()
            .map(|m| MountInfo {
                source: m.source.clone(),
                target: m.root.path(),
                fs_type: m.sb.fs_name(),
                dev: m.sb.dev(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::LookupFlags;

    #[test]
    fn bootstrap_layout() {
        let vfs = Vfs::new(VfsConfig::default()).expect("boot");
        let root = vfs.root();
        let tmp = vfs.path_lookup("/tmp", LookupFlags::DIRECTORY, &root, &root, &Credentials::ROOT).expect("tmp");
        assert_eq!(tmp.inode().attr().perm(), 0o1777);
        let null = vfs.path_lookup("/dev/null", LookupFlags::FOLLOW, &root, &root, &Credentials::ROOT).expect("null");
        assert_eq!(null.path(), "/dev/null");
        assert_ne!(null.inode().dev(), root.inode().dev());
        let mounts = vfs.mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, "/dev");
        assert_eq!(mounts[0].fs_type, "devfs");
    }

    #[test]
    fn double_mount_and_busy_umount() {
        let vfs = Vfs::new(VfsConfig::default()).expect("boot");
        let root = vfs.root();
        let mnt = vfs.mkdir(&root, "mnt", S_IFDIR | 0o755, &Credentials::ROOT).expect("mkdir");
        vfs.mount("scratch", &mnt, "ramfs").expect("mount");
        assert_eq!(vfs.mount("again", &mnt, "ramfs"), Err(VfsError::Busy));
        assert_eq!(vfs.mount("x", &mnt, "nfs"), Err(VfsError::NoDevice));
        let mounted = vfs.follow_mount(mnt.clone());
        let pinned = vfs
            .create(&mounted, "f", crate::inode::S_IFREG | 0o644, &Credentials::ROOT)
            .expect("create");
        assert_eq!(vfs.umount(&mounted), Err(VfsError::Busy));
        drop(pinned);
        vfs.umount(&mounted).expect("umount");
        assert!(!mnt.is_mountpoint());
    }
}
