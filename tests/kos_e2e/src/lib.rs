// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Helpers shared by the cross-crate scenarios: a booted kernel on a manual
//! clock and a user process with a scratch mapping for syscall arguments.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kos_abi::time::ManualClock;
use kos_abi::{Credentials, Pid};
use kos_kernel::{boot_with_clock, Kernel, KernelConfig};
use kos_net::{CaptureDevice, Ipv4Cidr, MacAddr};

/// Base of the scratch region mapped into every [`UserProc`].
pub const SCRATCH: u64 = 0x40_0000;
/// Size of the scratch region.
pub const SCRATCH_LEN: u64 = 64 * 1024;

/// Boots a kernel whose clock only moves when the test says so. The timer
/// ticker stays off; the network worker runs.
pub fn boot_manual() -> (Arc<Kernel>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let mut config = KernelConfig::default();
    config.timer.autostart_ticker = false;
    let kernel = boot_with_clock(config, clock.clone()).expect("boot kernel");
    (kernel, clock)
}

/// Adds `eth0` on a capture device and assigns `addr/24`.
pub fn attach_eth0(kernel: &Kernel, mac: MacAddr, addr: Ipv4Addr) -> (Arc<CaptureDevice>, u32) {
    let cap = Arc::new(CaptureDevice::new());
    let net = kernel.net();
    let idx = net.add_interface("eth0", mac, 1500, cap.clone()).expect("eth0");
    net.set_ipv4(idx, Ipv4Cidr::new(addr, 24).expect("cidr")).expect("address");
    (cap, idx)
}

/// Polls `cond` until it holds or `limit` passes.
pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A process spawned under the kernel with a scratch mapping.
#[derive(Clone)]
pub struct UserProc {
    /// Kernel the process lives in.
    pub kernel: Arc<Kernel>,
    /// Process id.
    pub pid: Pid,
}

impl UserProc {
    /// Spawns a child of init running as `uid:gid`.
    pub fn spawn(kernel: &Arc<Kernel>, uid: u32, gid: u32) -> Self {
        let pid = kernel.spawn_process("e2e", Credentials::new(uid, gid)).expect("spawn");
        let ctx = kernel.process(pid).expect("context");
        ctx.mem.lock().map(SCRATCH, SCRATCH_LEN).expect("map scratch");
        Self { kernel: kernel.clone(), pid }
    }

    /// Copies `bytes` into the scratch region at `offset`; returns the address.
    pub fn put(&self, offset: u64, bytes: &[u8]) -> u64 {
        let addr = SCRATCH + offset;
        let ctx = self.kernel.process(self.pid).expect("context");
        ctx.mem.lock().write(addr, bytes).expect("write user memory");
        addr
    }

    /// Stores a NUL-terminated string at `offset`.
    pub fn put_str(&self, offset: u64, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.put(offset, &bytes)
    }

    /// Reads `len` bytes back from `addr`.
    pub fn get(&self, addr: u64, len: u64) -> Vec<u8> {
        let ctx = self.kernel.process(self.pid).expect("context");
        let bytes = ctx.mem.lock().read(addr, len).expect("read user memory");
        bytes
    }

    /// Issues syscall `nr`; missing registers are zero.
    pub fn call(&self, nr: u32, regs: &[u64]) -> i64 {
        let mut all = [0u64; 6];
        all[..regs.len()].copy_from_slice(regs);
        self.kernel.syscall(self.pid, nr, all)
    }
}
