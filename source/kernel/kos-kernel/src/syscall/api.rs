// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers (decode, check, execute) and the user-visible
//! struct layouts they write
//! OWNERS: @kernel-team
//! INVARIANTS: Pointer arguments are validated through UserMemory before use;
//! the user-memory lock is never held across a VFS call that can block

use std::time::Duration;

use kos_abi::nr;
use kos_abi::time::{Timespec, NSEC_PER_SEC};
use kos_abi::Errno;
use kos_vfs::{Flock, LockCmd, LockType, Stat};

use super::{Args, SysResult, SyscallContext, SyscallTable};
use crate::sched::WaitTarget;

/// Size of `struct stat` as written by `stat`/`fstat`/`lstat`.
pub const STAT_SIZE: usize = 144;
/// Length of each `struct utsname` field.
pub const UTS_LEN: usize = 65;
/// Size of `struct flock`.
pub const FLOCK_SIZE: usize = 32;

/// `wait4` option: do not block.
pub const WNOHANG: u64 = 1;
/// `clock_gettime` wall clock.
pub const CLOCK_REALTIME: u64 = 0;
/// `clock_gettime` time since boot.
pub const CLOCK_MONOTONIC: u64 = 1;
/// `clock_gettime` time since boot, suspend included.
pub const CLOCK_BOOTTIME: u64 = 7;

/// `fcntl` commands.
pub const F_GETFL: u64 = 3;
/// Query the first conflicting lock.
pub const F_GETLK: u64 = 5;
/// Non-blocking lock.
pub const F_SETLK: u64 = 6;
/// Blocking lock.
pub const F_SETLKW: u64 = 7;
/// Shared lock type in `struct flock`.
pub const F_RDLCK: i16 = 0;
/// Exclusive lock type in `struct flock`.
pub const F_WRLCK: i16 = 1;
/// Unlock type in `struct flock`.
pub const F_UNLCK: i16 = 2;

/// Registers every handler implemented here.
pub fn register_all(table: &mut SyscallTable) {
    table.register(nr::READ, sys_read);
    table.register(nr::WRITE, sys_write);
    table.register(nr::OPEN, sys_open);
    table.register(nr::CLOSE, sys_close);
    table.register(nr::STAT, sys_stat);
    table.register(nr::FSTAT, sys_fstat);
    table.register(nr::LSTAT, sys_lstat);
    table.register(nr::LSEEK, sys_lseek);
    table.register(nr::BRK, sys_brk);
    table.register(nr::ACCESS, sys_access);
    table.register(nr::SCHED_YIELD, sys_sched_yield);
    table.register(nr::NANOSLEEP, sys_nanosleep);
    table.register(nr::GETPID, sys_getpid);
    table.register(nr::FORK, sys_fork);
    table.register(nr::EXIT, sys_exit);
    table.register(nr::WAIT4, sys_wait4);
    table.register(nr::KILL, sys_kill);
    table.register(nr::UNAME, sys_uname);
    table.register(nr::FCNTL, sys_fcntl);
    table.register(nr::FSYNC, sys_fsync);
    table.register(nr::TRUNCATE, sys_truncate);
    table.register(nr::FTRUNCATE, sys_ftruncate);
    table.register(nr::GETCWD, sys_getcwd);
    table.register(nr::CHDIR, sys_chdir);
    table.register(nr::RENAME, sys_rename);
    table.register(nr::MKDIR, sys_mkdir);
    table.register(nr::RMDIR, sys_rmdir);
    table.register(nr::LINK, sys_link);
    table.register(nr::UNLINK, sys_unlink);
    table.register(nr::SYMLINK, sys_symlink);
    table.register(nr::READLINK, sys_readlink);
    table.register(nr::CHMOD, sys_chmod);
    table.register(nr::CHOWN, sys_chown);
    table.register(nr::UMASK, sys_umask);
    table.register(nr::GETTIMEOFDAY, sys_gettimeofday);
    table.register(nr::GETUID, sys_getuid);
    table.register(nr::GETGID, sys_getgid);
    table.register(nr::GETPPID, sys_getppid);
    table.register(nr::GETTID, sys_gettid);
    table.register(nr::CLOCK_GETTIME, sys_clock_gettime);
}

/// Lays out `st` as x86-64 `struct stat`.
pub fn encode_stat(st: &Stat) -> [u8; STAT_SIZE] {
    let mut out = [0u8; STAT_SIZE];
    let mut put = |off: usize, bytes: &[u8]| out[off..off + bytes.len()].copy_from_slice(bytes);
    put(0, &u64::from(st.dev).to_le_bytes());
    put(8, &st.ino.to_le_bytes());
    put(16, &u64::from(st.nlink).to_le_bytes());
    put(24, &st.mode.to_le_bytes());
    put(28, &st.uid.to_le_bytes());
    put(32, &st.gid.to_le_bytes());
    put(40, &u64::from(st.rdev).to_le_bytes());
    put(48, &st.size.to_le_bytes());
    put(56, &u64::from(st.blksize).to_le_bytes());
    put(64, &st.blocks.to_le_bytes());
    for (i, ts) in [st.atime, st.mtime, st.ctime].iter().enumerate() {
        put(72 + i * 16, &ts.sec.to_le_bytes());
        put(80 + i * 16, &i64::from(ts.nsec).to_le_bytes());
    }
    out
}

fn encode_timespec(ts: Timespec) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&ts.sec.to_le_bytes());
    out[8..].copy_from_slice(&i64::from(ts.nsec).to_le_bytes());
    out
}

fn le_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(raw)
}

fn sys_read(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fd = args.fd(0)?;
    let (buf, count) = (args.get(1), args.get(2));
    ctx.mem().check(buf, count)?;
    let len = usize::try_from(count).map_err(|_| Errno::EINVAL)?;
    let mut data = vec![0u8; len];
    let n = ctx.process.vfs.read(fd, &mut data)?;
    ctx.copy_out(buf, &data[..n])?;
    Ok(n as i64)
}

fn sys_write(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fd = args.fd(0)?;
    let data = ctx.copy_in(args.get(1), args.get(2))?;
    Ok(ctx.process.vfs.write(fd, &data)? as i64)
}

fn sys_open(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    Ok(i64::from(ctx.process.vfs.open(&path, args.get(1) as u32, args.get(2) as u32)?))
}

fn sys_close(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    ctx.process.vfs.close(args.fd(0)?)?;
    Ok(0)
}

fn write_stat(ctx: &SyscallContext<'_>, addr: u64, st: &Stat) -> SysResult<i64> {
    ctx.copy_out(addr, &encode_stat(st))?;
    Ok(0)
}

fn sys_stat(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.mem().check(args.get(1), STAT_SIZE as u64)?;
    let st = ctx.process.vfs.stat(&path)?;
    write_stat(ctx, args.get(1), &st)
}

fn sys_fstat(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fd = args.fd(0)?;
    ctx.mem().check(args.get(1), STAT_SIZE as u64)?;
    let st = ctx.process.vfs.fstat(fd)?;
    write_stat(ctx, args.get(1), &st)
}

fn sys_lstat(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.mem().check(args.get(1), STAT_SIZE as u64)?;
    let st = ctx.process.vfs.lstat(&path)?;
    write_stat(ctx, args.get(1), &st)
}

fn sys_lseek(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let pos = ctx.process.vfs.lseek(args.fd(0)?, args.get(1) as i64, args.get(2) as u32)?;
    i64::try_from(pos).map_err(|_| Errno::EINVAL.into())
}

fn sys_brk(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    Ok(ctx.mem().brk(args.get(0)) as i64)
}

fn sys_access(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.access(&path, args.get(1) as u32)?;
    Ok(0)
}

fn sys_sched_yield(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    ctx.kernel.sched().yield_now(ctx.tid)?;
    Ok(0)
}

fn sys_nanosleep(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let req = ctx.copy_in(args.get(0), 16)?;
    let (sec, nsec) = (le_i64(&req[..8]), le_i64(&req[8..]));
    if sec < 0 || !(0..NSEC_PER_SEC as i64).contains(&nsec) {
        return Err(Errno::EINVAL.into());
    }
    std::thread::sleep(Duration::new(sec as u64, nsec as u32));
    if args.get(1) != 0 {
        ctx.copy_out(args.get(1), &[0u8; 16])?;
    }
    Ok(0)
}

fn sys_getpid(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.pid))
}

fn sys_getppid(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.kernel.sched().getppid(ctx.pid)?))
}

fn sys_gettid(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.tid))
}

fn sys_getuid(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.process.vfs.cred().uid))
}

fn sys_getgid(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.process.vfs.cred().gid))
}

fn sys_fork(ctx: &SyscallContext<'_>, _args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.kernel.fork(ctx.pid)?))
}

fn sys_exit(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    ctx.kernel.exit_process(ctx.pid, args.get(0) as i32)?;
    Ok(0)
}

fn sys_wait4(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let target = match args.get(0) as i64 {
        pid if pid > 0 => WaitTarget::Pid(pid as u32),
        _ => WaitTarget::Any,
    };
    let status_ptr = args.get(1);
    if status_ptr != 0 {
        ctx.mem().check(status_ptr, 4)?;
    }
    let nohang = args.get(2) & WNOHANG != 0;
    match ctx.kernel.sched().wait4(ctx.pid, target, nohang)? {
        None => Ok(0),
        Some((child, status)) => {
            if status_ptr != 0 {
                ctx.copy_out(status_ptr, &status.wait_status().to_le_bytes())?;
            }
            Ok(i64::from(child))
        }
    }
}

fn sys_kill(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let pid = u32::try_from(args.get(0) as i64).map_err(|_| Errno::EINVAL)?;
    ctx.kernel.kill(pid, args.get(1) as u32)?;
    Ok(0)
}

fn sys_uname(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fields = [
        "KOS",
        "kos",
        env!("CARGO_PKG_VERSION"),
        "#1 KOS userspace kernel",
        std::env::consts::ARCH,
        "(none)",
    ];
    let mut buf = vec![0u8; UTS_LEN * fields.len()];
    for (i, f) in fields.iter().enumerate() {
        let bytes = f.as_bytes();
        let n = bytes.len().min(UTS_LEN - 1);
        buf[i * UTS_LEN..i * UTS_LEN + n].copy_from_slice(&bytes[..n]);
    }
    ctx.copy_out(args.get(0), &buf)?;
    Ok(0)
}

fn decode_flock(raw: &[u8]) -> SysResult<Flock> {
    let ty = match i16::from_le_bytes([raw[0], raw[1]]) {
        F_RDLCK => LockType::Read,
        F_WRLCK => LockType::Write,
        F_UNLCK => LockType::Unlock,
        _ => return Err(Errno::EINVAL.into()),
    };
    let whence = i16::from_le_bytes([raw[2], raw[3]]);
    let (start, len) = (le_i64(&raw[8..16]), le_i64(&raw[16..24]));
    if whence != 0 || start < 0 || len < 0 {
        return Err(Errno::EINVAL.into());
    }
    Ok(Flock::new(ty, start as u64, len as u64, 0))
}

fn encode_flock(lock: &Flock) -> [u8; FLOCK_SIZE] {
    let ty = match lock.ty {
        LockType::Read => F_RDLCK,
        LockType::Write => F_WRLCK,
        LockType::Unlock => F_UNLCK,
    };
    let mut out = [0u8; FLOCK_SIZE];
    out[0..2].copy_from_slice(&ty.to_le_bytes());
    out[8..16].copy_from_slice(&(lock.start as i64).to_le_bytes());
    out[16..24].copy_from_slice(&(lock.len as i64).to_le_bytes());
    out[24..28].copy_from_slice(&(lock.pid as i32).to_le_bytes());
    out
}

fn sys_fcntl(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fd = args.fd(0)?;
    let cmd = match args.get(1) {
        F_GETFL => return Ok(i64::from(ctx.process.vfs.file(fd)?.flags())),
        F_GETLK => LockCmd::GetLk,
        F_SETLK => LockCmd::SetLk,
        F_SETLKW => LockCmd::SetLkW,
        _ => return Err(Errno::EINVAL.into()),
    };
    let addr = args.get(2);
    let req = decode_flock(&ctx.copy_in(addr, FLOCK_SIZE as u64)?)?;
    // SETLKW may sleep; user memory is not locked here.
    let answer = ctx.process.vfs.fcntl_lock(fd, cmd, req)?;
    if cmd == LockCmd::GetLk {
        ctx.copy_out(addr, &encode_flock(&answer))?;
    }
    Ok(0)
}

fn sys_fsync(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    ctx.process.vfs.fsync(args.fd(0)?)?;
    Ok(0)
}

fn sys_truncate(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    let len = u64::try_from(args.get(1) as i64).map_err(|_| Errno::EINVAL)?;
    ctx.process.vfs.truncate(&path, len)?;
    Ok(0)
}

fn sys_ftruncate(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let fd = args.fd(0)?;
    let len = u64::try_from(args.get(1) as i64).map_err(|_| Errno::EINVAL)?;
    ctx.process.vfs.ftruncate(fd, len)?;
    Ok(0)
}

fn sys_getcwd(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let (buf, size) = (args.get(0), args.get(1));
    let mut cwd = ctx.process.vfs.getcwd().into_bytes();
    cwd.push(0);
    if (size as usize) < cwd.len() {
        return Err(Errno::ERANGE.into());
    }
    ctx.copy_out(buf, &cwd)?;
    Ok(cwd.len() as i64)
}

fn sys_chdir(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.chdir(&path)?;
    Ok(0)
}

fn sys_rename(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let (old, new) = (ctx.path(args.get(0))?, ctx.path(args.get(1))?);
    ctx.process.vfs.rename(&old, &new)?;
    Ok(0)
}

fn sys_mkdir(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.mkdir(&path, args.get(1) as u32)?;
    Ok(0)
}

fn sys_rmdir(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.rmdir(&path)?;
    Ok(0)
}

fn sys_link(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let (old, new) = (ctx.path(args.get(0))?, ctx.path(args.get(1))?);
    ctx.process.vfs.link(&old, &new)?;
    Ok(0)
}

fn sys_unlink(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.unlink(&path)?;
    Ok(0)
}

fn sys_symlink(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let (target, linkpath) = (ctx.path(args.get(0))?, ctx.path(args.get(1))?);
    ctx.process.vfs.symlink(&target, &linkpath)?;
    Ok(0)
}

fn sys_readlink(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    let (buf, size) = (args.get(1), args.get(2));
    if size == 0 {
        return Err(Errno::EINVAL.into());
    }
    let target = ctx.process.vfs.readlink(&path)?;
    let bytes = target.as_bytes();
    let n = bytes.len().min(size as usize);
    ctx.copy_out(buf, &bytes[..n])?;
    Ok(n as i64)
}

fn sys_chmod(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    ctx.process.vfs.chmod(&path, args.get(1) as u32)?;
    Ok(0)
}

fn sys_chown(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let path = ctx.path(args.get(0))?;
    let id = |raw: u64| Some(raw as u32).filter(|v| *v != u32::MAX);
    ctx.process.vfs.chown(&path, id(args.get(1)), id(args.get(2)))?;
    Ok(0)
}

fn sys_umask(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    Ok(i64::from(ctx.process.vfs.set_umask(args.get(0) as u32 & 0o777)))
}

fn sys_gettimeofday(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let tv = args.get(0);
    if tv != 0 {
        let now = Timespec::now();
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&now.sec.to_le_bytes());
        out[8..].copy_from_slice(&i64::from(now.nsec / 1_000).to_le_bytes());
        ctx.copy_out(tv, &out)?;
    }
    Ok(0)
}

fn sys_clock_gettime(ctx: &SyscallContext<'_>, args: &Args) -> SysResult<i64> {
    let ts = match args.get(0) {
        CLOCK_REALTIME => Timespec::now(),
        CLOCK_MONOTONIC | CLOCK_BOOTTIME => Timespec::from_ns(ctx.kernel.clock().now_ns()),
        _ => return Err(Errno::EINVAL.into()),
    };
    ctx.copy_out(args.get(1), &encode_timespec(ts))?;
    Ok(0)
}
