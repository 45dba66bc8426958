// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory filesystem. The inode hash is the backing store, so linked
//! inodes are never evicted.

use std::sync::Arc;

use kos_abi::Credentials;

use crate::error::Result;
use crate::inode::{Inode, InodeData, S_IFDIR};
use crate::superblock::{FileSystemType, SuperBlock, SuperOps};

struct RamfsOps;

impl SuperOps for RamfsOps {
    fn fs_name(&self) -> &'static str {
        "ramfs"
    }

    fn delete_inode(&self, inode: &Inode) {
        inode.write().data = InodeData::Empty;
    }

    fn drop_inode(&self, _inode: &Inode) -> bool {
        false
    }
}

/// `ramfs` filesystem type.
#[derive(Debug, Clone, Copy)]
pub struct Ramfs {
    max_inodes: u64,
}

impl Ramfs {
    /// Ramfs instances with the given inode budget.
    pub const fn new(max_inodes: u64) -> Self {
        Self { max_inodes }
    }
}

impl FileSystemType for Ramfs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn mount(&self, dev: u32, _source: &str) -> Result<Arc<SuperBlock>> {
        let sb = SuperBlock::new(dev, Arc::new(RamfsOps), self.max_inodes);
        let root = sb.alloc_inode(S_IFDIR | 0o755, &Credentials::ROOT)?;
        sb.set_root(root.ino());
        Ok(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::S_IFREG;

    #[test]
    fn linked_inodes_survive_last_handle() {
        let sb = Ramfs::new(16).mount(3, "none").expect("mount");
        let file = sb.alloc_inode(S_IFREG | 0o644, &Credentials::ROOT).expect("alloc");
        let ino = file.ino();
        drop(file);
        let again = sb.iget(ino).expect("still hashed");
        assert_eq!(again.ino(), ino);
        assert!(sb.iget(sb.root_ino()).expect("root").is_dir());
        assert_eq!(sb.statfs().fs_type, "ramfs");
    }
}
