// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Filesystem scenarios issued as syscalls against a booted kernel.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use kos_abi::{nr, Errno};
use kos_e2e::{boot_manual, UserProc};
use kos_kernel::syscall::api::{F_GETLK, F_SETLK, F_SETLKW, F_WRLCK, FLOCK_SIZE, STAT_SIZE};
use kos_vfs::file::{O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};

fn flock(ty: i16, start: i64, len: i64) -> [u8; FLOCK_SIZE] {
    let mut raw = [0u8; FLOCK_SIZE];
    raw[0..2].copy_from_slice(&ty.to_le_bytes());
    raw[8..16].copy_from_slice(&start.to_le_bytes());
    raw[16..24].copy_from_slice(&len.to_le_bytes());
    raw
}

#[test]
fn other_user_reads_but_cannot_write() {
    let (kernel, _clock) = boot_manual();
    let owner = UserProc::spawn(&kernel, 1000, 1000);
    let dir = owner.put_str(0, "/home/a");
    assert_eq!(owner.call(nr::MKDIR, &[dir, 0o755]), 0);
    let path = owner.put_str(256, "/home/a/f");
    let fd = owner.call(nr::OPEN, &[path, u64::from(O_CREAT | O_RDWR), 0o644]);
    assert!(fd >= 0);
    let buf = owner.put(1024, b"hello");
    assert_eq!(owner.call(nr::WRITE, &[fd as u64, buf, 5]), 5);
    assert_eq!(owner.call(nr::CLOSE, &[fd as u64]), 0);

    let other = UserProc::spawn(&kernel, 1001, 1001);
    let path = other.put_str(0, "/home/a/f");
    let fd = other.call(nr::OPEN, &[path, u64::from(O_RDONLY), 0]);
    assert!(fd >= 0, "read-only open failed with {fd}");
    let out = other.put(1024, &[0; 16]);
    assert_eq!(other.call(nr::READ, &[fd as u64, out, 16]), 5);
    assert_eq!(other.get(out, 5), b"hello");
    assert_eq!(other.call(nr::OPEN, &[path, u64::from(O_WRONLY), 0]), Errno::EACCES.as_neg());
    kernel.shutdown();
}

#[test]
fn mkdir_stat_rmdir_access() {
    let (kernel, _clock) = boot_manual();
    let p = UserProc::spawn(&kernel, 1000, 1000);
    let dir = p.put_str(0, "/tmp/scratch");
    assert_eq!(p.call(nr::MKDIR, &[dir, 0o700]), 0);
    let st = p.put(4096, &[0; STAT_SIZE]);
    assert_eq!(p.call(nr::STAT, &[dir, st]), 0);
    let raw = p.get(st, STAT_SIZE as u64);
    let mode = u32::from_le_bytes([raw[24], raw[25], raw[26], raw[27]]);
    assert_eq!(mode & 0o170_000, 0o040_000);
    assert_eq!(p.call(nr::RMDIR, &[dir]), 0);
    assert_eq!(p.call(nr::ACCESS, &[dir, 0]), Errno::ENOENT.as_neg());
    kernel.shutdown();
}

#[test]
fn blocked_setlkw_inherits_lock_after_close() {
    let (kernel, _clock) = boot_manual();
    let holder = UserProc::spawn(&kernel, 1000, 1000);
    let waiter = UserProc::spawn(&kernel, 1000, 1000);
    let other = UserProc::spawn(&kernel, 1000, 1000);

    let path = holder.put_str(0, "/tmp/s6");
    let fd1 = holder.call(nr::OPEN, &[path, u64::from(O_CREAT | O_RDWR), 0o666]) as u64;
    let lk = holder.put(512, &flock(F_WRLCK, 0, 100));
    assert_eq!(holder.call(nr::FCNTL, &[fd1, F_SETLK, lk]), 0);

    let path = waiter.put_str(0, "/tmp/s6");
    let fd2 = waiter.call(nr::OPEN, &[path, u64::from(O_RDWR), 0]) as u64;
    let lk2 = waiter.put(512, &flock(F_WRLCK, 50, 100));
    let (tx, rx) = mpsc::channel();
    let blocked = waiter.clone();
    let worker = thread::spawn(move || {
        let rc = blocked.call(nr::FCNTL, &[fd2, F_SETLKW, lk2]);
        tx.send(rc).expect("report");
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "SETLKW did not block");

    assert_eq!(holder.call(nr::CLOSE, &[fd1]), 0);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("waiter woke"), 0);
    worker.join().expect("waiter thread");

    let path = other.put_str(0, "/tmp/s6");
    let fd3 = other.call(nr::OPEN, &[path, u64::from(O_RDONLY), 0]) as u64;
    let query = other.put(512, &flock(F_WRLCK, 0, 200));
    assert_eq!(other.call(nr::FCNTL, &[fd3, F_GETLK, query]), 0);
    let answer = other.get(query, FLOCK_SIZE as u64);
    assert_eq!(i16::from_le_bytes([answer[0], answer[1]]), F_WRLCK);
    let owner = u32::from_le_bytes([answer[24], answer[25], answer[26], answer[27]]);
    assert_eq!(owner, waiter.pid);
    kernel.shutdown();
}
