// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! POSIX-like per-process API over a [`Vfs`] namespace.
//!
//! A [`VfsContext`] carries `(uid, gid, umask, cwd)` plus a descriptor table.
//! Every call returns a [`VfsError`]; `VfsError::code()` yields the negative
//! domain code for C-style callers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kos_abi::time::Timespec;
use kos_abi::{Credentials, Pid};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::dentry::DentryRef;
use crate::error::{Result, VfsError};
use crate::file::{File, O_ACCMODE, O_CREAT, O_DIRECTORY, O_EXCL, O_NOFOLLOW, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::inode::{
    Acl, FileType, Ino, Inode, InodeData, S_IALLUGO, S_IFMT, S_ISGID, S_ISUID, MAY_EXEC, MAY_READ,
    MAY_WRITE,
};
use crate::lock::{self, Flock, LockCmd, LockType};
use crate::path::LookupFlags;
use crate::superblock::StatFs;
use crate::vfs::Vfs;

/// `access` existence check.
pub const F_OK: u32 = 0;
/// `access` read check.
pub const R_OK: u32 = 4;
/// `access` write check.
pub const W_OK: u32 = 2;
/// `access` execute check.
pub const X_OK: u32 = 1;
/// `setxattr`: fail if the attribute exists.
pub const XATTR_CREATE: u32 = 1;
/// `setxattr`: fail if the attribute is missing.
pub const XATTR_REPLACE: u32 = 2;

const XATTR_NAME_MAX: usize = 255;
const XATTR_SIZE_MAX: usize = 64 * 1024;
const TEMP_ATTEMPTS: usize = 100;

/// `stat` result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    /// Device number.
    pub dev: u32,
    /// Inode number.
    pub ino: Ino,
    /// Type and permission bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u32,
    /// Size in bytes.
    pub size: u64,
    /// Preferred I/O size.
    pub blksize: u32,
    /// 512-byte units.
    pub blocks: u64,
    /// Last access.
    pub atime: Timespec,
    /// Last content change.
    pub mtime: Timespec,
    /// Last metadata change.
    pub ctime: Timespec,
}

impl Stat {
    fn of(inode: &Inode) -> Self {
        let a = inode.attr();
        Self {
            dev: inode.dev(),
            ino: inode.ino(),
            mode: a.mode,
            nlink: a.nlink,
            uid: a.uid,
            gid: a.gid,
            rdev: a.rdev,
            size: a.size,
            blksize: a.blksize,
            blocks: a.blocks,
            atime: a.atime,
            mtime: a.mtime,
            ctime: a.ctime,
        }
    }

    /// File type.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    /// Regular file.
    pub fn is_file(&self) -> bool {
        self.file_type() == Some(FileType::Regular)
    }

    /// Symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(FileType::Symlink)
    }
}

/// One `readdir` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number.
    pub ino: Ino,
    /// Entry name.
    pub name: String,
    /// Entry type, when known.
    pub file_type: Option<FileType>,
}

/// Open directory stream (`opendir`/`readdir`/`closedir`).
#[derive(Debug)]
pub struct DirStream {
    dentry: DentryRef,
    entries: Vec<DirEntry>,
    next: usize,
}

impl DirStream {
    /// Next entry, `None` at end of stream.
    pub fn readdir(&mut self) -> Option<DirEntry> {
        let entry = self.entries.get(self.next).cloned();
        if entry.is_some() {
            self.next += 1;
        }
        entry
    }

    /// Restarts the stream.
    pub fn rewind(&mut self) {
        self.next = 0;
    }

    /// Directory path.
    pub fn path(&self) -> String {
        self.dentry.path()
    }

    /// Releases the stream.
    pub fn closedir(self) {}
}

/// Per-process view of the namespace.
pub struct VfsContext {
    vfs: Arc<Vfs>,
    cred: Credentials,
    pid: Pid,
    umask: AtomicU32,
    root: DentryRef,
    cwd: Mutex<DentryRef>,
    fds: Mutex<Vec<Option<Arc<File>>>>,
}

impl std::fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsContext")
            .field("cred", &self.cred)
            .field("pid", &self.pid)
            .field("umask", &self.umask())
            .field("cwd", &self.getcwd())
            .finish_non_exhaustive()
    }
}

impl VfsContext {
    /// New context at `/` with the configured default umask.
    pub fn new(vfs: Arc<Vfs>, cred: Credentials, pid: Pid) -> Self {
        let root = vfs.root();
        let max_fds = vfs.config().max_fds;
        let umask = vfs.config().default_umask;
        Self {
            cred,
            pid,
            umask: AtomicU32::new(umask),
            cwd: Mutex::new(root.clone()),
            root,
            fds: Mutex::new(vec![None; max_fds]),
            vfs,
        }
    }

    /// Child context sharing open file descriptions, cwd and umask.
    pub fn fork(&self, pid: Pid) -> Self {
        Self {
            vfs: self.vfs.clone(),
            cred: self.cred,
            pid,
            umask: AtomicU32::new(self.umask()),
            root: self.root.clone(),
            cwd: Mutex::new(self.cwd.lock().clone()),
            fds: Mutex::new(self.fds.lock().clone()),
        }
    }

    /// Namespace.
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Credentials.
    pub fn cred(&self) -> Credentials {
        self.cred
    }

    /// Owning process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current umask.
    pub fn umask(&self) -> u32 {
        self.umask.load(Ordering::Acquire)
    }

    /// Sets the umask, returning the previous one.
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::AcqRel)
    }

    /// Open descriptors.
    pub fn open_fds(&self) -> usize {
        self.fds.lock().iter().filter(|f| f.is_some()).count()
    }

    fn lookup(&self, path: &str, flags: LookupFlags) -> Result<DentryRef> {
        let cwd = self.cwd.lock().clone();
        self.vfs.path_lookup(path, flags, &cwd, &self.root, &self.cred)
    }

    fn lookup_parent(&self, path: &str) -> Result<(DentryRef, String)> {
        let cwd = self.cwd.lock().clone();
        self.vfs.lookup_parent(path, &cwd, &self.root, &self.cred)
    }

    /// Open file description behind `fd`.
    pub fn file(&self, fd: i32) -> Result<Arc<File>> {
        let idx = usize::try_from(fd).map_err(|_| VfsError::BadFd)?;
        self.fds.lock().get(idx).cloned().flatten().ok_or(VfsError::BadFd)
    }

    fn install(&self, file: File) -> Result<i32> {
        let mut fds = self.fds.lock();
        let slot = fds.iter().position(Option::is_none).ok_or(VfsError::TooManyFiles)?;
        fds[slot] = Some(Arc::new(file));
        i32::try_from(slot).map_err(|_| VfsError::TooManyFiles)
    }

    /// Opens (and with `O_CREAT` creates) `path`.
    pub fn open(&self, path: &str, flags: u32, mode: u32) -> Result<i32> {
        let follow = flags & O_NOFOLLOW == 0;
        let mut created = false;
        let dentry = if flags & O_CREAT != 0 {
            let (dir, name) = self.lookup_parent(path)?;
            match self.vfs.lookup_child(&dir, &name, &self.cred)? {
                Some(_) if flags & O_EXCL != 0 => return Err(VfsError::Exists),
                Some(existing) if existing.inode().file_type() == Some(FileType::Symlink) => {
                    if !follow {
                        return Err(VfsError::Loop);
                    }
                    self.lookup(path, LookupFlags::FOLLOW)?
                }
                Some(existing) => existing,
                None => {
                    created = true;
                    let perm = mode & S_IALLUGO & !self.umask();
                    self.vfs.create(&dir, &name, FileType::Regular.mode_bits() | perm, &self.cred)?
                }
            }
        } else {
            let flags = if follow { LookupFlags::FOLLOW } else { LookupFlags::empty() };
            let found = self.lookup(path, flags)?;
            if found.inode().file_type() == Some(FileType::Symlink) {
                return Err(VfsError::Loop);
            }
            found
        };
        let inode = dentry.inode();
        let is_dir = inode.is_dir();
        if flags & O_DIRECTORY != 0 && !is_dir {
            return Err(VfsError::NotDir);
        }
        let accmode = flags & O_ACCMODE;
        if is_dir && (accmode != O_RDONLY || flags & O_TRUNC != 0) {
            return Err(VfsError::IsDir);
        }
        if !created {
            let mut mask = match accmode {
                O_WRONLY => MAY_WRITE,
                O_RDWR => MAY_READ | MAY_WRITE,
                _ => MAY_READ,
            };
            if flags & O_TRUNC != 0 {
                mask |= MAY_WRITE;
            }
            inode.permission(&self.cred, mask)?;
        }
        if flags & O_TRUNC != 0 && inode.file_type() == Some(FileType::Regular) {
            inode.truncate(0)?;
        }
        let fd = self.install(File::new(dentry, flags))?;
        log::trace!("vfs: pid {} open {path} -> fd {fd}", self.pid);
        Ok(fd)
    }

    /// Closes `fd`, releasing every byte-range lock this process holds on
    /// the file and waking their waiters.
    pub fn close(&self, fd: i32) -> Result<()> {
        let idx = usize::try_from(fd).map_err(|_| VfsError::BadFd)?;
        let file = self.fds.lock().get_mut(idx).and_then(Option::take).ok_or(VfsError::BadFd)?;
        let released = lock::remove_posix_locks(file.inode(), self.pid);
        if released > 0 {
            log::trace!("vfs: pid {} close fd {fd} released {released} locks", self.pid);
        }
        Ok(())
    }

    /// Reads into `buf`.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        self.file(fd)?.read(self.pid, buf)
    }

    /// Writes `data`.
    pub fn write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        self.file(fd)?.write(self.pid, data)
    }

    /// Repositions the offset of `fd`.
    pub fn lseek(&self, fd: i32, offset: i64, whence: u32) -> Result<u64> {
        self.file(fd)?.lseek(offset, whence)
    }

    /// `fstat`.
    pub fn fstat(&self, fd: i32) -> Result<Stat> {
        Ok(Stat::of(self.file(fd)?.inode()))
    }

    /// Writes the inode back through its superblock.
    pub fn fsync(&self, fd: i32) -> Result<()> {
        let file = self.file(fd)?;
        let sb = file.inode().sb().ok_or(VfsError::BadFd)?;
        sb.ops().write_inode(file.inode())
    }

    /// Truncates an open file.
    pub fn ftruncate(&self, fd: i32, len: u64) -> Result<()> {
        let file = self.file(fd)?;
        if !file.writable() {
            return Err(VfsError::Invalid);
        }
        file.inode().truncate(len)
    }

    /// Truncates a file by path.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        dentry.inode().permission(&self.cred, MAY_WRITE)?;
        dentry.inode().truncate(len)
    }

    /// Creates a directory; `mode` is filtered by the umask.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (dir, name) = self.lookup_parent(path)?;
        self.vfs.mkdir(&dir, &name, mode & S_IALLUGO & !self.umask(), &self.cred).map(drop)
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (dir, name) = self.lookup_parent(path)?;
        self.vfs.rmdir(&dir, &name, &self.cred)
    }

    /// Opens a directory stream.
    pub fn opendir(&self, path: &str) -> Result<DirStream> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW | LookupFlags::DIRECTORY)?;
        dentry.inode().permission(&self.cred, MAY_READ)?;
        let mut entries = vec![
            DirEntry { ino: dentry.inode().ino(), name: ".".into(), file_type: Some(FileType::Directory) },
            DirEntry {
                ino: dentry.parent().map(|p| p.inode().ino()).unwrap_or(dentry.inode().ino()),
                name: "..".into(),
                file_type: Some(FileType::Directory),
            },
        ];
        let children: Vec<(String, Ino)> =
            dentry.inode().read().dir()?.iter().map(|(n, i)| (n.clone(), *i)).collect();
        let sb = dentry.inode().sb();
        for (name, ino) in children {
            let file_type = sb.as_ref().and_then(|sb| sb.iget(ino).ok()).and_then(|i| i.file_type());
            entries.push(DirEntry { ino, name, file_type });
        }
        Ok(DirStream { dentry, entries, next: 0 })
    }

    /// `stat`, following symlinks.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        Ok(Stat::of(self.lookup(path, LookupFlags::FOLLOW)?.inode()))
    }

    /// `lstat`, not following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Stat> {
        Ok(Stat::of(self.lookup(path, LookupFlags::empty())?.inode()))
    }

    /// `access` with `F_OK` or an `R_OK | W_OK | X_OK` mask.
    pub fn access(&self, path: &str, mode: u32) -> Result<()> {
        if mode & !(R_OK | W_OK | X_OK) != 0 {
            return Err(VfsError::Invalid);
        }
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        if mode == F_OK {
            return Ok(());
        }
        let mut mask = 0;
        if mode & R_OK != 0 {
            mask |= MAY_READ;
        }
        if mode & W_OK != 0 {
            mask |= MAY_WRITE;
        }
        if mode & X_OK != 0 {
            mask |= MAY_EXEC;
        }
        dentry.inode().permission(&self.cred, mask)
    }

    fn require_owner(&self, inode: &Inode) -> Result<()> {
        if self.cred.is_root() || inode.attr().uid == self.cred.uid {
            Ok(())
        } else {
            Err(VfsError::Perm)
        }
    }

    /// Changes permission bits; owner or root only.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        let inode = dentry.inode();
        self.require_owner(inode)?;
        let mut inner = inode.write();
        let mut bits = mode & S_IALLUGO;
        if !self.cred.is_root() && inner.attr.gid != self.cred.gid {
            bits &= !S_ISGID;
        }
        inner.attr.mode = (inner.attr.mode & S_IFMT) | bits;
        inner.attr.ctime = Timespec::now();
        Ok(())
    }

    /// Changes ownership. Root may change anything; an owner may only move
    /// the file into its own group.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        let inode = dentry.inode();
        let mut inner = inode.write();
        if !self.cred.is_root() {
            let owner = inner.attr.uid == self.cred.uid;
            let uid_ok = uid.map_or(true, |u| u == inner.attr.uid);
            let gid_ok = gid.map_or(true, |g| g == inner.attr.gid || g == self.cred.gid);
            if !(owner && uid_ok && gid_ok) {
                return Err(VfsError::Perm);
            }
            inner.attr.mode &= !(S_ISUID | S_ISGID);
        }
        if let Some(uid) = uid {
            inner.attr.uid = uid;
        }
        if let Some(gid) = gid {
            inner.attr.gid = gid;
        }
        inner.attr.ctime = Timespec::now();
        Ok(())
    }

    /// Removes a non-directory name.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let (dir, name) = self.lookup_parent(path)?;
        self.vfs.unlink(&dir, &name, &self.cred)
    }

    /// Renames `old` to `new`.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old_dir, old_name) = self.lookup_parent(old)?;
        let (new_dir, new_name) = self.lookup_parent(new)?;
        self.vfs.rename(&old_dir, &old_name, &new_dir, &new_name, &self.cred)
    }

    /// Creates hard link `new` to `old`.
    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let target = self.lookup(old, LookupFlags::empty())?;
        let (dir, name) = self.lookup_parent(new)?;
        self.vfs.link(&target, &dir, &name, &self.cred).map(drop)
    }

    /// Creates symlink `linkpath` pointing at `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        let (dir, name) = self.lookup_parent(linkpath)?;
        self.vfs.symlink(&dir, &name, target, &self.cred).map(drop)
    }

    /// Reads a symlink target.
    pub fn readlink(&self, path: &str) -> Result<String> {
        let dentry = self.lookup(path, LookupFlags::empty())?;
        let inner = dentry.inode().read();
        match &inner.data {
            InodeData::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::Invalid),
        }
    }

    /// Mounts `fs_type` on `target`; root only.
    pub fn mount(&self, source: &str, target: &str, fs_type: &str) -> Result<()> {
        if !self.cred.is_root() {
            return Err(VfsError::Perm);
        }
        let target = self.lookup(target, LookupFlags::FOLLOW | LookupFlags::DIRECTORY)?;
        self.vfs.mount(source, &target, fs_type)
    }

    /// Unmounts the filesystem mounted at `target`; root only.
    pub fn umount(&self, target: &str) -> Result<()> {
        if !self.cred.is_root() {
            return Err(VfsError::Perm);
        }
        let target = self.lookup(target, LookupFlags::FOLLOW)?;
        self.vfs.umount(&target)
    }

    /// Canonical absolute path of `path`.
    pub fn realpath(&self, path: &str) -> Result<String> {
        Ok(self.lookup(path, LookupFlags::FOLLOW)?.path())
    }

    fn fill_template(template: &str) -> Result<String> {
        let prefix = template.strip_suffix("XXXXXX").ok_or(VfsError::Invalid)?;
        let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(6).map(char::from).collect();
        Ok(format!("{prefix}{suffix}"))
    }

    /// Creates and opens a unique file from a `...XXXXXX` template.
    pub fn mkstemp(&self, template: &str) -> Result<(i32, String)> {
        for _ in 0..TEMP_ATTEMPTS {
            let path = Self::fill_template(template)?;
            match self.open(&path, O_CREAT | O_EXCL | O_RDWR, 0o600) {
                Ok(fd) => return Ok((fd, path)),
                Err(VfsError::Exists) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VfsError::Exists)
    }

    /// Creates a unique directory from a `...XXXXXX` template.
    pub fn mkdtemp(&self, template: &str) -> Result<String> {
        for _ in 0..TEMP_ATTEMPTS {
            let path = Self::fill_template(template)?;
            match self.mkdir(&path, 0o700) {
                Ok(()) => return Ok(path),
                Err(VfsError::Exists) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VfsError::Exists)
    }

    /// Changes the working directory.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW | LookupFlags::DIRECTORY)?;
        dentry.inode().permission(&self.cred, MAY_EXEC)?;
        *self.cwd.lock() = dentry;
        Ok(())
    }

    /// Working directory path.
    pub fn getcwd(&self) -> String {
        self.cwd.lock().path()
    }

    /// `fcntl` locking entry point. The lock is owned by this context's pid.
    pub fn fcntl_lock(&self, fd: i32, cmd: LockCmd, mut req: Flock) -> Result<Flock> {
        let file = self.file(fd)?;
        req.pid = self.pid;
        if cmd != LockCmd::GetLk {
            match req.ty {
                LockType::Read if !file.readable() => return Err(VfsError::BadFd),
                LockType::Write if !file.writable() => return Err(VfsError::BadFd),
                _ => {}
            }
        }
        lock::posix_lock(file.inode(), cmd, req)
    }

    fn xattr_target(&self, path: &str, name: &str, write: bool) -> Result<DentryRef> {
        if name.is_empty() || name.len() > XATTR_NAME_MAX {
            return Err(VfsError::Range);
        }
        let (namespace, _) = name.split_once('.').ok_or(VfsError::NotSupported)?;
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        match namespace {
            "user" => {
                let mask = if write { MAY_WRITE } else { MAY_READ };
                dentry.inode().permission(&self.cred, mask)?;
            }
            "trusted" | "security" if write && !self.cred.is_root() => return Err(VfsError::Perm),
            "trusted" | "security" | "system" => {}
            _ => return Err(VfsError::NotSupported),
        }
        Ok(dentry)
    }

    /// Sets an extended attribute.
    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: u32) -> Result<()> {
        if value.len() > XATTR_SIZE_MAX {
            return Err(VfsError::Range);
        }
        let dentry = self.xattr_target(path, name, true)?;
        let mut xattrs = dentry.inode().xattrs().write();
        let exists = xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(VfsError::Exists);
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(VfsError::NoData);
        }
        xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    /// Reads an extended attribute.
    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let dentry = self.xattr_target(path, name, false)?;
        let value = dentry.inode().xattrs().read().get(name).cloned();
        value.ok_or(VfsError::NoData)
    }

    /// Lists extended attribute names.
    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        let names = dentry.inode().xattrs().read().keys().cloned().collect();
        Ok(names)
    }

    /// Removes an extended attribute.
    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        let dentry = self.xattr_target(path, name, true)?;
        let removed = dentry.inode().xattrs().write().remove(name);
        removed.map(drop).ok_or(VfsError::NoData)
    }

    /// Installs (or with `None` clears) the ACL; owner or root only.
    pub fn set_acl(&self, path: &str, acl: Option<Acl>) -> Result<()> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        self.require_owner(dentry.inode())?;
        dentry.inode().set_acl(acl);
        Ok(())
    }

    /// Current ACL.
    pub fn get_acl(&self, path: &str) -> Result<Option<Acl>> {
        Ok(self.lookup(path, LookupFlags::FOLLOW)?.inode().acl())
    }

    /// Statistics of the filesystem holding `path`.
    pub fn statfs(&self, path: &str) -> Result<StatFs> {
        let dentry = self.lookup(path, LookupFlags::FOLLOW)?;
        let sb = dentry.inode().sb().ok_or(VfsError::NotFound)?;
        Ok(sb.statfs())
    }
}

impl Drop for VfsContext {
    fn drop(&mut self) {
        let files: Vec<Arc<File>> = self.fds.get_mut().iter_mut().filter_map(Option::take).collect();
        for file in files {
            lock::remove_posix_locks(file.inode(), self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::file::{O_APPEND, SEEK_SET};
    use crate::inode::{AclEntry, AclTag};

    fn vfs() -> Arc<Vfs> {
        Vfs::new(VfsConfig::default()).expect("boot")
    }

    fn root_ctx(vfs: &Arc<Vfs>) -> VfsContext {
        VfsContext::new(vfs.clone(), Credentials::ROOT, 1)
    }

    #[test]
    fn create_write_reopen_read() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let fd = ctx.open("/tmp/data", O_CREAT | O_RDWR, 0o644).expect("create");
        assert_eq!(ctx.write(fd, b"payload").expect("write"), 7);
        ctx.close(fd).expect("close");
        let fd = ctx.open("/tmp/data", O_RDONLY, 0).expect("reopen");
        let mut buf = [0u8; 32];
        let n = ctx.read(fd, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"payload");
        assert_eq!(ctx.close(fd), Ok(()));
        assert_eq!(ctx.close(fd), Err(VfsError::BadFd));
    }

    #[test]
    fn mkdir_stat_rmdir_access() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        ctx.mkdir("/tmp/p", 0o777).expect("mkdir");
        let st = ctx.stat("/tmp/p").expect("stat");
        assert!(st.is_dir());
        assert_eq!(st.mode & 0o777, 0o755);
        ctx.rmdir("/tmp/p").expect("rmdir");
        assert_eq!(ctx.access("/tmp/p", F_OK), Err(VfsError::NotFound));
        assert_eq!(ctx.access("/tmp/p", F_OK).unwrap_err().code(), crate::error::VFS_ENOENT);
    }

    #[test]
    fn open_flags_are_honoured() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let fd = ctx.open("/tmp/f", O_CREAT | O_WRONLY, 0o644).expect("create");
        ctx.write(fd, b"0123456789").expect("write");
        ctx.close(fd).expect("close");
        assert_eq!(ctx.open("/tmp/f", O_CREAT | O_EXCL | O_RDWR, 0o644), Err(VfsError::Exists));
        assert_eq!(ctx.open("/tmp/missing", O_RDONLY, 0), Err(VfsError::NotFound));
        assert_eq!(ctx.open("/tmp", O_WRONLY, 0), Err(VfsError::IsDir));
        assert_eq!(ctx.open("/tmp/f", O_RDONLY | O_DIRECTORY, 0), Err(VfsError::NotDir));
        let fd = ctx.open("/tmp/f", O_WRONLY | O_TRUNC | O_APPEND, 0).expect("trunc");
        assert_eq!(ctx.fstat(fd).expect("fstat").size, 0);
        ctx.write(fd, b"ab").expect("append");
        assert_eq!(ctx.lseek(fd, 0, SEEK_SET).expect("seek"), 0);
        ctx.ftruncate(fd, 1).expect("ftruncate");
        assert_eq!(ctx.stat("/tmp/f").expect("stat").size, 1);
    }

    #[test]
    fn symlink_readlink_realpath_and_nofollow() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        ctx.mkdir("/tmp/real", 0o755).expect("mkdir");
        ctx.symlink("/tmp/real", "/tmp/ln").expect("symlink");
        assert_eq!(ctx.readlink("/tmp/ln").expect("readlink"), "/tmp/real");
        assert_eq!(ctx.realpath("/tmp/ln/../ln").expect("realpath"), "/tmp/real");
        assert!(ctx.lstat("/tmp/ln").expect("lstat").is_symlink());
        assert!(ctx.stat("/tmp/ln").expect("stat").is_dir());
        assert_eq!(ctx.open("/tmp/ln", O_RDONLY | O_NOFOLLOW, 0), Err(VfsError::Loop));
        assert_eq!(ctx.readlink("/tmp/real"), Err(VfsError::Invalid));
    }

    #[test]
    fn chdir_getcwd_and_relative_paths() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        ctx.mkdir("/home/u", 0o755).expect("mkdir");
        ctx.chdir("/home/u").expect("chdir");
        assert_eq!(ctx.getcwd(), "/home/u");
        let fd = ctx.open("notes", O_CREAT | O_RDWR, 0o600).expect("relative create");
        ctx.close(fd).expect("close");
        assert!(ctx.stat("/home/u/notes").expect("stat").is_file());
        ctx.chdir("..").expect("up");
        assert_eq!(ctx.getcwd(), "/home");
    }

    #[test]
    fn ownership_changes_are_restricted() {
        let vfs = vfs();
        let root = root_ctx(&vfs);
        let user = VfsContext::new(vfs.clone(), Credentials::new(1000, 1000), 2);
        let fd = user.open("/tmp/own", O_CREAT | O_RDWR, 0o644).expect("create");
        user.close(fd).expect("close");
        user.chmod("/tmp/own", 0o600).expect("owner chmod");
        assert_eq!(user.stat("/tmp/own").expect("stat").mode & 0o777, 0o600);
        assert_eq!(user.chown("/tmp/own", Some(0), None), Err(VfsError::Perm));
        user.chown("/tmp/own", None, Some(1000)).expect("own group");
        let other = VfsContext::new(vfs.clone(), Credentials::new(1001, 1001), 3);
        assert_eq!(other.chmod("/tmp/own", 0o777), Err(VfsError::Perm));
        root.chown("/tmp/own", Some(1001), Some(1001)).expect("root chown");
        assert_eq!(root.stat("/tmp/own").expect("stat").uid, 1001);
    }

    #[test]
    fn rename_link_and_unlink_through_paths() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let fd = ctx.open("/tmp/a", O_CREAT | O_RDWR, 0o644).expect("create");
        ctx.write(fd, b"x").expect("write");
        ctx.close(fd).expect("close");
        ctx.link("/tmp/a", "/tmp/b").expect("link");
        assert_eq!(ctx.stat("/tmp/a").expect("stat").nlink, 2);
        ctx.rename("/tmp/a", "/tmp/c").expect("rename");
        assert_eq!(ctx.stat("/tmp/a"), Err(VfsError::NotFound));
        ctx.unlink("/tmp/b").expect("unlink");
        assert_eq!(ctx.stat("/tmp/c").expect("stat").nlink, 1);
        assert_eq!(ctx.unlink("/tmp"), Err(VfsError::IsDir));
    }

    #[test]
    fn unlinked_file_stays_readable_until_close() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let free_before = vfs.root_sb().free_inodes();
        let fd = ctx.open("/tmp/gone", O_CREAT | O_RDWR, 0o644).expect("create");
        ctx.write(fd, b"still here").expect("write");
        ctx.unlink("/tmp/gone").expect("unlink");
        ctx.lseek(fd, 0, SEEK_SET).expect("rewind");
        let mut buf = [0u8; 16];
        let n = ctx.read(fd, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"still here");
        assert_eq!(vfs.root_sb().free_inodes(), free_before - 1);
        ctx.close(fd).expect("close");
        assert_eq!(vfs.root_sb().free_inodes(), free_before);
    }

    #[test]
    fn temp_files_and_dirs_are_unique() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let (fd, path) = ctx.mkstemp("/tmp/kosXXXXXX").expect("mkstemp");
        assert!(path.starts_with("/tmp/kos") && path.len() == "/tmp/kos".len() + 6);
        assert_eq!(ctx.stat(&path).expect("stat").mode & 0o777, 0o600);
        ctx.close(fd).expect("close");
        let dir = ctx.mkdtemp("/tmp/dXXXXXX").expect("mkdtemp");
        assert!(ctx.stat(&dir).expect("stat").is_dir());
        assert_eq!(ctx.mkstemp("/tmp/bad"), Err(VfsError::Invalid));
    }

    #[test]
    fn readdir_lists_dot_entries_and_children() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let mut dir = ctx.opendir("/dev").expect("opendir");
        let mut names = Vec::new();
        while let Some(entry) = dir.readdir() {
            names.push((entry.name, entry.file_type));
        }
        dir.closedir();
        assert_eq!(
            names,
            vec![
                (".".to_string(), Some(FileType::Directory)),
                ("..".to_string(), Some(FileType::Directory)),
                ("null".to_string(), Some(FileType::CharDevice)),
                ("zero".to_string(), Some(FileType::CharDevice)),
            ]
        );
    }

    #[test]
    fn dev_null_and_zero_behave() {
        let vfs = vfs();
        let ctx = VfsContext::new(vfs, Credentials::new(1000, 1000), 5);
        let null = ctx.open("/dev/null", O_RDWR, 0).expect("null");
        assert_eq!(ctx.write(null, b"discard").expect("write"), 7);
        let mut buf = [1u8; 8];
        assert_eq!(ctx.read(null, &mut buf).expect("read"), 0);
        let zero = ctx.open("/dev/zero", O_RDONLY, 0).expect("zero");
        assert_eq!(ctx.read(zero, &mut buf).expect("read"), 8);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn xattrs_round_trip_with_flags() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        let fd = ctx.open("/tmp/x", O_CREAT | O_RDWR, 0o644).expect("create");
        ctx.close(fd).expect("close");
        ctx.setxattr("/tmp/x", "user.tag", b"v1", XATTR_CREATE).expect("set");
        assert_eq!(ctx.setxattr("/tmp/x", "user.tag", b"v2", XATTR_CREATE), Err(VfsError::Exists));
        assert_eq!(ctx.setxattr("/tmp/x", "user.none", b"v", XATTR_REPLACE), Err(VfsError::NoData));
        assert_eq!(ctx.getxattr("/tmp/x", "user.tag").expect("get"), b"v1");
        assert_eq!(ctx.listxattr("/tmp/x").expect("list"), vec!["user.tag".to_string()]);
        ctx.removexattr("/tmp/x", "user.tag").expect("remove");
        assert_eq!(ctx.getxattr("/tmp/x", "user.tag"), Err(VfsError::NoData));
        assert_eq!(ctx.setxattr("/tmp/x", "bogus", b"", 0), Err(VfsError::NotSupported));
    }

    #[test]
    fn acl_grants_named_user() {
        let vfs = vfs();
        let owner = VfsContext::new(vfs.clone(), Credentials::new(1000, 1000), 2);
        let guest = VfsContext::new(vfs.clone(), Credentials::new(2000, 2000), 3);
        let fd = owner.open("/tmp/shared", O_CREAT | O_RDWR, 0o600).expect("create");
        owner.close(fd).expect("close");
        assert_eq!(guest.open("/tmp/shared", O_RDONLY, 0), Err(VfsError::Access));
        let acl = Acl {
            entries: vec![
                AclEntry { tag: AclTag::UserObj, perm: MAY_READ | MAY_WRITE },
                AclEntry { tag: AclTag::User(2000), perm: MAY_READ },
                AclEntry { tag: AclTag::GroupObj, perm: 0 },
                AclEntry { tag: AclTag::Mask, perm: MAY_READ },
                AclEntry { tag: AclTag::Other, perm: 0 },
            ],
        };
        assert_eq!(guest.set_acl("/tmp/shared", Some(acl.clone())), Err(VfsError::Perm));
        owner.set_acl("/tmp/shared", Some(acl.clone())).expect("set acl");
        assert_eq!(owner.get_acl("/tmp/shared").expect("get acl"), Some(acl));
        let fd = guest.open("/tmp/shared", O_RDONLY, 0).expect("acl read");
        guest.close(fd).expect("close");
        assert_eq!(guest.open("/tmp/shared", O_WRONLY, 0), Err(VfsError::Access));
    }

    #[test]
    fn mount_requires_root_and_statfs_reports_type() {
        let vfs = vfs();
        let root = root_ctx(&vfs);
        let user = VfsContext::new(vfs.clone(), Credentials::new(1000, 1000), 2);
        root.mkdir("/mnt", 0o755).expect("mkdir");
        assert_eq!(user.mount("none", "/mnt", "ramfs"), Err(VfsError::Perm));
        root.mount("none", "/mnt", "ramfs").expect("mount");
        assert_eq!(root.statfs("/mnt").expect("statfs").fs_type, "ramfs");
        assert_eq!(root.statfs("/dev").expect("statfs").fs_type, "devfs");
        root.umount("/mnt").expect("umount");
        assert_eq!(root.umount("/mnt"), Err(VfsError::Invalid));
    }

    #[test]
    fn descriptor_table_is_bounded() {
        let cfg = VfsConfig { max_fds: 2, ..VfsConfig::default() };
        let vfs = Vfs::new(cfg).expect("boot");
        let ctx = root_ctx(&vfs);
        ctx.open("/dev/null", O_RDONLY, 0).expect("0");
        ctx.open("/dev/null", O_RDONLY, 0).expect("1");
        assert_eq!(ctx.open("/dev/null", O_RDONLY, 0), Err(VfsError::TooManyFiles));
        assert_eq!(ctx.read(7, &mut [0u8; 1]), Err(VfsError::BadFd));
        assert_eq!(ctx.read(-1, &mut [0u8; 1]), Err(VfsError::BadFd));
    }

    #[test]
    fn umask_applies_to_new_files() {
        let vfs = vfs();
        let ctx = root_ctx(&vfs);
        assert_eq!(ctx.set_umask(0o077), 0o022);
        let fd = ctx.open("/tmp/m", O_CREAT | O_RDWR, 0o666).expect("create");
        assert_eq!(ctx.fstat(fd).expect("fstat").mode & 0o777, 0o600);
    }
}
