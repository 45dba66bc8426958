// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! POSIX byte-range locks held against an inode.
//!
//! Every held lock carries its own condition variable; a blocked `SETLKW`
//! sleeps on the variable of the lock it conflicts with and retries when that
//! lock is released.

use std::sync::Arc;

use kos_abi::Pid;
use parking_lot::Condvar;

use crate::error::{Result, VfsError};
use crate::inode::Inode;

/// Lock type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Release request, or "no conflict" in a `GETLK` answer.
    Unlock,
}

/// `fcntl` lock command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockCmd {
    /// Report the first conflicting lock.
    GetLk,
    /// Acquire or release without blocking.
    SetLk,
    /// Acquire, sleeping while a conflict exists.
    SetLkW,
}

/// Lock descriptor. `len == 0` extends to end of file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Flock {
    /// Lock type.
    pub ty: LockType,
    /// First byte.
    pub start: u64,
    /// Length in bytes, 0 for "to EOF".
    pub len: u64,
    /// Owning process.
    pub pid: Pid,
}

impl Flock {
    /// Builds a descriptor.
    pub const fn new(ty: LockType, start: u64, len: u64, pid: Pid) -> Self {
        Self { ty, start, len, pid }
    }

    /// Last byte covered (inclusive).
    pub fn end(&self) -> u64 {
        if self.len == 0 {
            u64::MAX
        } else {
            self.start.saturating_add(self.len - 1)
        }
    }

    /// True when the byte ranges intersect.
    pub fn overlaps(&self, other: &Flock) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    /// Locks of different processes conflict when they overlap and at least one
    /// is a write lock.
    pub fn conflicts_with(&self, other: &Flock) -> bool {
        self.pid != other.pid
            && self.overlaps(other)
            && (self.ty == LockType::Write || other.ty == LockType::Write)
    }
}

pub(crate) struct HeldLock {
    pub(crate) lock: Flock,
    pub(crate) cv: Arc<Condvar>,
}

/// Entry point for `fcntl(F_GETLK | F_SETLK | F_SETLKW)`.
pub fn posix_lock(inode: &Inode, cmd: LockCmd, req: Flock) -> Result<Flock> {
    if req.len != 0 && req.start.checked_add(req.len - 1).is_none() {
        return Err(VfsError::Invalid);
    }
    let mut held = inode.locks.lock();
    match cmd {
        LockCmd::GetLk => {
            if req.ty == LockType::Unlock {
                return Err(VfsError::Invalid);
            }
            Ok(held
                .iter()
                .find(|h| h.lock.conflicts_with(&req))
                .map(|h| h.lock)
                .unwrap_or(Flock { ty: LockType::Unlock, ..req }))
        }
        _ if req.ty == LockType::Unlock => {
            held.retain(|h| {
                let matches = h.lock.pid == req.pid && h.lock.start == req.start && h.lock.len == req.len;
                if matches {
                    h.cv.notify_all();
                }
                !matches
            });
            Ok(req)
        }
        LockCmd::SetLk => {
            if held.iter().any(|h| h.lock.conflicts_with(&req)) {
                return Err(VfsError::Again);
            }
            held.push(HeldLock { lock: req, cv: Arc::new(Condvar::new()) });
            Ok(req)
        }
        LockCmd::SetLkW => {
            loop {
                let conflict = held.iter().find(|h| h.lock.conflicts_with(&req)).map(|h| h.cv.clone());
                match conflict {
                    Some(cv) => {
                        log::trace!("vfs: pid {} waits on ino {} [{}, {}]", req.pid, inode.ino(), req.start, req.end());
                        cv.wait(&mut held);
                    }
                    None => break,
                }
            }
            held.push(HeldLock { lock: req, cv: Arc::new(Condvar::new()) });
            Ok(req)
        }
    }
}

/// Drops every lock `pid` holds on `inode` and wakes their waiters. Returns
/// how many were removed.
pub fn remove_posix_locks(inode: &Inode, pid: Pid) -> usize {
    let mut held = inode.locks.lock();
    let before = held.len();
    held.retain(|h| {
        if h.lock.pid == pid {
            h.cv.notify_all();
            false
        } else {
            true
        }
    });
    before - held.len()
}

/// Rejects I/O by `pid` over `[start, start+len)` that collides with another
/// process's lock.
pub fn check_io_conflict(inode: &Inode, pid: Pid, start: u64, len: usize, write: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let wanted = Flock {
        ty: if write { LockType::Write } else { LockType::Read },
        start,
        len: len as u64,
        pid,
    };
    if inode.locks.lock().iter().any(|h| h.lock.conflicts_with(&wanted)) {
        Err(VfsError::Again)
    } else {
        Ok(())
    }
}

/// Snapshot of the locks held on `inode`.
pub fn held_locks(inode: &Inode) -> Vec<Flock> {
    inode.locks.lock().iter().map(|h| h.lock).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::Ramfs;
    use crate::superblock::FileSystemType;
    use kos_abi::Credentials;
    use proptest::prelude::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn file() -> crate::inode::InodeRef {
        let sb = Ramfs::new(8).mount(1, "t").expect("mount");
        sb.alloc_inode(crate::inode::S_IFREG | 0o644, &Credentials::ROOT).expect("alloc")
    }

    #[test]
    fn setlk_reports_conflict_and_getlk_names_holder() {
        let inode = file();
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Write, 0, 100, 1)).expect("first");
        assert_eq!(
            posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Read, 99, 10, 2)),
            Err(VfsError::Again)
        );
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Read, 100, 10, 2)).expect("adjacent");
        let wanted = posix_lock(&inode, LockCmd::GetLk, Flock::new(LockType::Write, 50, 0, 3)).expect("getlk");
        assert_eq!(wanted.pid, 1);
        let free = posix_lock(&inode, LockCmd::GetLk, Flock::new(LockType::Read, 200, 1, 3)).expect("getlk");
        assert_eq!(free.ty, LockType::Unlock);
    }

    #[test]
    fn unlock_requires_exact_range() {
        let inode = file();
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Write, 10, 10, 1)).expect("lock");
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Unlock, 10, 5, 1)).expect("partial");
        assert_eq!(held_locks(&inode).len(), 1);
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Unlock, 10, 10, 1)).expect("exact");
        assert!(held_locks(&inode).is_empty());
    }

    #[test]
    fn setlkw_wakes_when_holder_releases() {
        let inode = file();
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Write, 0, 100, 1)).expect("lock");
        let shared = inode.inode().clone();
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let got = posix_lock(&shared, LockCmd::SetLkW, Flock::new(LockType::Write, 50, 100, 2));
            tx.send(got).expect("send");
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(remove_posix_locks(&inode, 1), 1);
        let got = rx.recv_timeout(Duration::from_secs(5)).expect("woken").expect("granted");
        assert_eq!(got.pid, 2);
        waiter.join().expect("join");
        assert_eq!(held_locks(&inode), vec![Flock::new(LockType::Write, 50, 100, 2)]);
    }

    #[test]
    fn io_conflicts_follow_lock_rules() {
        let inode = file();
        posix_lock(&inode, LockCmd::SetLk, Flock::new(LockType::Read, 0, 10, 1)).expect("lock");
        assert!(check_io_conflict(&inode, 2, 0, 5, false).is_ok());
        assert_eq!(check_io_conflict(&inode, 2, 5, 5, true), Err(VfsError::Again));
        assert!(check_io_conflict(&inode, 1, 0, 5, true).is_ok());
    }

    fn lock_strategy() -> impl Strategy<Value = Flock> {
        (prop_oneof![Just(LockType::Read), Just(LockType::Write)], 0u64..64, 0u64..32, 1u32..4)
            .prop_map(|(ty, start, len, pid)| Flock::new(ty, start, len, pid))
    }

    proptest! {
        #[test]
        fn conflict_is_symmetric(a in lock_strategy(), b in lock_strategy()) {
            prop_assert_eq!(a.conflicts_with(&b), b.conflicts_with(&a));
        }

        #[test]
        fn held_locks_never_conflict(reqs in proptest::collection::vec(lock_strategy(), 1..24)) {
            let inode = file();
            for req in reqs {
                let _ = posix_lock(&inode, LockCmd::SetLk, req);
            }
            let held = held_locks(&inode);
            for (i, a) in held.iter().enumerate() {
                for b in &held[i + 1..] {
                    prop_assert!(!a.conflicts_with(b));
                }
            }
        }
    }
}
