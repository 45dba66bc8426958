// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Open file descriptions.

use kos_abi::time::Timespec;
use kos_abi::Pid;
use parking_lot::Mutex;

use crate::dentry::DentryRef;
use crate::error::{Result, VfsError};
use crate::inode::{FileType, Inode, InodeData, InodeRef};
use crate::lock;

/// Open for reading.
pub const O_RDONLY: u32 = 0o0;
/// Open for writing.
pub const O_WRONLY: u32 = 0o1;
/// Open for reading and writing.
pub const O_RDWR: u32 = 0o2;
/// Access mode mask.
pub const O_ACCMODE: u32 = 0o3;
/// Create if missing.
pub const O_CREAT: u32 = 0o100;
/// With `O_CREAT`, fail if the name exists.
pub const O_EXCL: u32 = 0o200;
/// Truncate to zero on open.
pub const O_TRUNC: u32 = 0o1000;
/// Writes go to end of file.
pub const O_APPEND: u32 = 0o2000;
/// Must be a directory.
pub const O_DIRECTORY: u32 = 0o200_000;
/// Do not follow a final symlink.
pub const O_NOFOLLOW: u32 = 0o400_000;

/// Seek from start.
pub const SEEK_SET: u32 = 0;
/// Seek from current position.
pub const SEEK_CUR: u32 = 1;
/// Seek from end of file.
pub const SEEK_END: u32 = 2;

/// An open file: dentry, position and flags.
#[derive(Debug)]
pub struct File {
    dentry: DentryRef,
    flags: u32,
    pos: Mutex<u64>,
}

impl File {
    /// Wraps an already permission-checked dentry.
    pub fn new(dentry: DentryRef, flags: u32) -> Self {
        Self { dentry, flags, pos: Mutex::new(0) }
    }

    /// Dentry the file was opened through.
    pub fn dentry(&self) -> &DentryRef {
        &self.dentry
    }

    /// Inode behind the file.
    pub fn inode(&self) -> &InodeRef {
        self.dentry.inode()
    }

    /// Open flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Current position.
    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    /// Opened with read access.
    pub fn readable(&self) -> bool {
        self.flags & O_ACCMODE != O_WRONLY
    }

    /// Opened with write access.
    pub fn writable(&self) -> bool {
        matches!(self.flags & O_ACCMODE, O_WRONLY | O_RDWR)
    }

    /// Reads at the current position on behalf of `pid`.
    pub fn read(&self, pid: Pid, buf: &mut [u8]) -> Result<usize> {
        if !self.readable() {
            return Err(VfsError::BadFd);
        }
        let inode = self.inode();
        if inode.is_dir() {
            return Err(VfsError::IsDir);
        }
        let mut pos = self.pos.lock();
        lock::check_io_conflict(inode, pid, *pos, buf.len(), false)?;
        let n = match inode.fops() {
            Some(ops) => ops.read(inode, *pos, buf)?,
            None => generic_read(inode, *pos, buf)?,
        };
        *pos += n as u64;
        inode.write().attr.atime = Timespec::now();
        Ok(n)
    }

    /// Writes at the current position (or end of file with `O_APPEND`).
    pub fn write(&self, pid: Pid, data: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(VfsError::BadFd);
        }
        let inode = self.inode();
        let mut pos = self.pos.lock();
        if self.flags & O_APPEND != 0 {
            *pos = inode.attr().size;
        }
        lock::check_io_conflict(inode, pid, *pos, data.len(), true)?;
        let n = match inode.fops() {
            Some(ops) => ops.write(inode, *pos, data)?,
            None => generic_write(inode, *pos, data)?,
        };
        *pos += n as u64;
        Ok(n)
    }

    /// Repositions the file offset.
    pub fn lseek(&self, offset: i64, whence: u32) -> Result<u64> {
        let mut pos = self.pos.lock();
        let base = match whence {
            SEEK_SET => 0i128,
            SEEK_CUR => i128::from(*pos),
            SEEK_END => i128::from(self.inode().attr().size),
            _ => return Err(VfsError::Invalid),
        };
        let target = base + i128::from(offset);
        let target = u64::try_from(target).map_err(|_| VfsError::Invalid)?;
        *pos = target;
        Ok(target)
    }
}

fn generic_read(inode: &Inode, pos: u64, buf: &mut [u8]) -> Result<usize> {
    let inner = inode.read();
    match &inner.data {
        InodeData::File(bytes) => {
            let start = usize::try_from(pos).unwrap_or(usize::MAX).min(bytes.len());
            let end = start.saturating_add(buf.len()).min(bytes.len());
            buf[..end - start].copy_from_slice(&bytes[start..end]);
            Ok(end - start)
        }
        _ => match inner.attr.file_type() {
            Some(FileType::Directory) => Err(VfsError::IsDir),
            _ => Err(VfsError::Invalid),
        },
    }
}

fn generic_write(inode: &Inode, pos: u64, data: &[u8]) -> Result<usize> {
    let mut inner = inode.write();
    let start = usize::try_from(pos).map_err(|_| VfsError::Invalid)?;
    let end = start.checked_add(data.len()).ok_or(VfsError::Invalid)?;
    let size = match &mut inner.data {
        InodeData::File(bytes) => {
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[start..end].copy_from_slice(data);
            bytes.len() as u64
        }
        InodeData::Dir(_) => return Err(VfsError::IsDir),
        _ => return Err(VfsError::Invalid),
    };
    inner.attr.set_size(size);
    inner.touch_modified();
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::Dentry;
    use crate::inode::S_IFREG;
    use crate::ramfs::Ramfs;
    use crate::superblock::FileSystemType;
    use kos_abi::Credentials;

    fn open(flags: u32) -> File {
        let sb = Ramfs::new(8).mount(1, "t").expect("mount");
        let inode = sb.alloc_inode(S_IFREG | 0o644, &Credentials::ROOT).expect("alloc");
        File::new(Dentry::alloc("f", None, inode), flags)
    }

    #[test]
    fn write_then_seek_and_read_back() {
        let file = open(O_RDWR);
        assert_eq!(file.write(1, b"hello world").expect("write"), 11);
        assert_eq!(file.inode().attr().size, 11);
        assert_eq!(file.inode().attr().blocks, 1);
        assert_eq!(file.lseek(6, SEEK_SET).expect("seek"), 6);
        let mut buf = [0u8; 16];
        let n = file.read(1, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"world");
        assert_eq!(file.read(1, &mut buf).expect("eof"), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let file = open(O_RDWR);
        file.lseek(4, SEEK_SET).expect("seek");
        file.write(1, b"x").expect("write");
        file.lseek(0, SEEK_SET).expect("rewind");
        let mut buf = [9u8; 5];
        file.read(1, &mut buf).expect("read");
        assert_eq!(buf, [0, 0, 0, 0, b'x']);
    }

    #[test]
    fn access_mode_gates_io() {
        let ro = open(O_RDONLY);
        assert_eq!(ro.write(1, b"x"), Err(VfsError::BadFd));
        let wo = open(O_WRONLY | O_APPEND);
        wo.write(1, b"ab").expect("write");
        wo.lseek(0, SEEK_SET).expect("seek");
        wo.write(1, b"cd").expect("append");
        assert_eq!(wo.inode().attr().size, 4);
        let mut buf = [0u8; 1];
        assert_eq!(wo.read(1, &mut buf), Err(VfsError::BadFd));
        assert_eq!(wo.lseek(-5, SEEK_END), Err(VfsError::Invalid));
    }
}
