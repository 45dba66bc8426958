// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device filesystem with the `null` and `zero` character devices.

use std::sync::Arc;

use kos_abi::Credentials;

use crate::error::Result;
use crate::inode::{FileOps, Inode, InodeData, S_IFCHR, S_IFDIR};
use crate::superblock::{FileSystemType, SuperBlock, SuperOps};

/// Packs a major/minor pair.
pub const fn makedev(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff)
}

struct DevfsOps;

impl SuperOps for DevfsOps {
    fn fs_name(&self) -> &'static str {
        "devfs"
    }

    fn drop_inode(&self, _inode: &Inode) -> bool {
        false
    }
}

/// `/dev/null`: reads hit EOF, writes are discarded.
pub struct NullDevice;

impl FileOps for NullDevice {
    fn read(&self, _inode: &Inode, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&self, _inode: &Inode, _pos: u64, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }
}

/// `/dev/zero`: reads return zeros, writes are discarded.
pub struct ZeroDevice;

impl FileOps for ZeroDevice {
    fn read(&self, _inode: &Inode, _pos: u64, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _inode: &Inode, _pos: u64, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }
}

/// `devfs` filesystem type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Devfs;

impl Devfs {
    fn add_device(
        sb: &SuperBlock,
        root: &Inode,
        name: &str,
        rdev: u32,
        ops: Arc<dyn FileOps>,
    ) -> Result<()> {
        let node = sb.alloc_inode_with(S_IFCHR | 0o666, &Credentials::ROOT, None, Some(ops))?;
        {
            let mut inner = node.write();
            inner.attr.rdev = rdev;
            inner.data = InodeData::Device(rdev);
        }
        root.write().dir_mut()?.insert(name.to_string(), node.ino());
        Ok(())
    }
}

impl FileSystemType for Devfs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn mount(&self, dev: u32, _source: &str) -> Result<Arc<SuperBlock>> {
        let sb = SuperBlock::new(dev, Arc::new(DevfsOps), 256);
        let root = sb.alloc_inode(S_IFDIR | 0o755, &Credentials::ROOT)?;
        sb.set_root(root.ino());
        Self::add_device(&sb, &root, "null", makedev(1, 3), Arc::new(NullDevice))?;
        Self::add_device(&sb, &root, "zero", makedev(1, 5), Arc::new(ZeroDevice))?;
        Ok(sb)
    }
}
