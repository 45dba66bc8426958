// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network interfaces and the devices behind them. Only two devices
//! exist: the loopback stub and a capture device that records transmitted
//! frames and accepts injected ones.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{NetError, Result};
use crate::ethernet::MacAddr;
use crate::ipv4::Ipv4Cidr;

/// Default Ethernet MTU.
pub const DEFAULT_MTU: usize = 1500;
/// Loopback MTU.
pub const LOOPBACK_MTU: usize = 65_535;
/// Frames a device queues before refusing more.
pub const DEVICE_QUEUE_LEN: usize = 1024;

/// Frame transport under an interface.
pub trait NetDevice: Send + Sync + fmt::Debug {
    /// Sends one Ethernet frame.
    fn transmit(&self, frame: &[u8]) -> Result<()>;
    /// Takes the next received frame, if any.
    fn receive(&self) -> Option<Vec<u8>>;
    /// Frames waiting in the receive queue.
    fn pending(&self) -> usize;
}

/// Loopback: every transmitted frame is received back.
#[derive(Debug, Default)]
pub struct LoopbackDevice {
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl LoopbackDevice {
    /// Empty loopback.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetDevice for LoopbackDevice {
    fn transmit(&self, frame: &[u8]) -> Result<()> {
        let mut q = self.queue.lock();
        if q.len() >= DEVICE_QUEUE_LEN {
            return Err(NetError::NoBufs);
        }
        q.push_back(frame.to_vec());
        Ok(())
    }

    fn receive(&self) -> Option<Vec<u8>> {
        self.queue.lock().pop_front()
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Records transmitted frames; received frames are injected by the caller.
#[derive(Debug, Default)]
pub struct CaptureDevice {
    tx: Mutex<Vec<Vec<u8>>>,
    rx: Mutex<VecDeque<Vec<u8>>>,
}

impl CaptureDevice {
    /// Empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains every frame transmitted so far.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.tx.lock())
    }

    /// Queues a frame as if it arrived from the wire.
    pub fn inject(&self, frame: Vec<u8>) {
        self.rx.lock().push_back(frame);
    }
}

impl NetDevice for CaptureDevice {
    fn transmit(&self, frame: &[u8]) -> Result<()> {
        self.tx.lock().push(frame.to_vec());
        Ok(())
    }

    fn receive(&self) -> Option<Vec<u8>> {
        self.rx.lock().pop_front()
    }

    fn pending(&self) -> usize {
        self.rx.lock().len()
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Interface flags.
    pub struct IfFlags: u32 {
        /// Administratively up.
        const UP = 1 << 0;
        /// Loopback interface.
        const LOOPBACK = 1 << 1;
        /// No ARP; frames carry zero MACs.
        const NOARP = 1 << 2;
        /// Accept every destination MAC.
        const PROMISC = 1 << 3;
    }
}

/// Interface counters.
#[derive(Debug, Default)]
pub struct IfStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
}

/// Serializable copy of `IfStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IfStatsSnapshot {
    /// Frames received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Frames dropped on input.
    pub rx_dropped: u64,
    /// Frames sent.
    pub tx_packets: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Device transmit failures.
    pub tx_errors: u64,
}

impl IfStats {
    pub(crate) fn rx(&self, len: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn rx_drop(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tx(&self, len: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn tx_error(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> IfStatsSnapshot {
        IfStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }
}

/// Configured interface.
#[derive(Clone, Debug)]
pub struct Interface {
    /// Index, loopback is 0.
    pub index: u32,
    /// Name such as `lo` or `eth0`.
    pub name: String,
    /// Hardware address.
    pub mac: MacAddr,
    /// IPv4 address and prefix.
    pub addr: Option<Ipv4Cidr>,
    /// Largest IPv4 datagram the link carries.
    pub mtu: usize,
    /// Flags.
    pub flags: IfFlags,
    /// Frame transport.
    pub device: Arc<dyn NetDevice>,
    /// Counters.
    pub stats: Arc<IfStats>,
}

impl Interface {
    /// Interface in the UP state without an address.
    pub fn new(index: u32, name: &str, mac: MacAddr, mtu: usize, device: Arc<dyn NetDevice>) -> Self {
        Self {
            index,
            name: name.to_string(),
            mac,
            addr: None,
            mtu,
            flags: IfFlags::UP,
            device,
            stats: Arc::new(IfStats::default()),
        }
    }

    /// True when a frame for `dst` is ours: unicast to us, broadcast or
    /// multicast, or anything in promiscuous mode.
    pub fn accepts(&self, dst: MacAddr) -> bool {
        dst == self.mac || dst.is_broadcast() || dst.is_multicast() || self.flags.contains(IfFlags::PROMISC)
    }

    /// True when the interface is up.
    pub fn is_up(&self) -> bool {
        self.flags.contains(IfFlags::UP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_returns_frames_in_order() {
        let lo = LoopbackDevice::new();
        lo.transmit(b"one").expect("tx");
        lo.transmit(b"two").expect("tx");
        assert_eq!(lo.pending(), 2);
        assert_eq!(lo.receive().as_deref(), Some(&b"one"[..]));
        assert_eq!(lo.receive().as_deref(), Some(&b"two"[..]));
        assert_eq!(lo.receive(), None);
    }

    #[test]
    fn loopback_queue_is_bounded() {
        let lo = LoopbackDevice::new();
        for _ in 0..DEVICE_QUEUE_LEN {
            lo.transmit(b"x").expect("tx");
        }
        assert_eq!(lo.transmit(b"x"), Err(NetError::NoBufs));
    }

    #[test]
    fn capture_records_and_injects() {
        let dev = CaptureDevice::new();
        dev.transmit(b"out").expect("tx");
        dev.inject(b"in".to_vec());
        assert_eq!(dev.take_frames(), vec![b"out".to_vec()]);
        assert!(dev.take_frames().is_empty());
        assert_eq!(dev.receive(), Some(b"in".to_vec()));
    }

    #[test]
    fn mac_filter() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        let mut ifc = Interface::new(1, "eth0", mac, DEFAULT_MTU, Arc::new(CaptureDevice::new()));
        assert!(ifc.accepts(mac));
        assert!(ifc.accepts(MacAddr::BROADCAST));
        let other: MacAddr = "02:00:00:00:00:02".parse().expect("mac");
        assert!(!ifc.accepts(other));
        ifc.flags |= IfFlags::PROMISC;
        assert!(ifc.accepts(other));
    }
}
