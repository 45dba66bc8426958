// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! UDP (RFC 768): header codec, pseudo-header checksum, the port table
//! with ephemeral allocation and per-endpoint receive queues.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::checksum::transport_checksum_v4;
use crate::error::{NetError, Result};
use crate::ipv4::IPPROTO_UDP;

/// Header length.
pub const UDP_HLEN: usize = 8;
/// First ephemeral port.
pub const EPHEMERAL_FIRST: u16 = 32_768;
/// Last ephemeral port.
pub const EPHEMERAL_LAST: u16 = 65_535;
/// Default receive buffer limit in payload bytes.
pub const UDP_RCVBUF_DEFAULT: usize = 64 * 1024;

/// UDP header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Header plus payload length.
    pub len: u16,
    /// Checksum, 0 when the sender did not compute one.
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses and checks the length field against the buffer.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < UDP_HLEN {
            return Err(NetError::Malformed("short udp header"));
        }
        let len = u16::from_be_bytes([b[4], b[5]]);
        if usize::from(len) < UDP_HLEN || usize::from(len) > b.len() {
            return Err(NetError::Malformed("udp length"));
        }
        Ok(Self {
            sport: u16::from_be_bytes([b[0], b[1]]),
            dport: u16::from_be_bytes([b[2], b[3]]),
            len,
            checksum: u16::from_be_bytes([b[6], b[7]]),
        })
    }

    /// Header bytes as stored.
    pub fn to_bytes(&self) -> [u8; UDP_HLEN] {
        let mut b = [0u8; UDP_HLEN];
        b[0..2].copy_from_slice(&self.sport.to_be_bytes());
        b[2..4].copy_from_slice(&self.dport.to_be_bytes());
        b[4..6].copy_from_slice(&self.len.to_be_bytes());
        b[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        b
    }
}

/// Builds a checksummed segment. A computed zero is sent as 0xffff.
pub fn build_segment(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(UDP_HLEN + payload.len()).map_err(|_| NetError::MsgSize)?;
    let header = UdpHeader { sport: src.port(), dport: dst.port(), len, checksum: 0 };
    let mut seg = Vec::with_capacity(usize::from(len));
    seg.extend_from_slice(&header.to_bytes());
    seg.extend_from_slice(payload);
    let sum = match transport_checksum_v4(*src.ip(), *dst.ip(), IPPROTO_UDP, &seg) {
        0 => 0xffff,
        s => s,
    };
    seg[6..8].copy_from_slice(&sum.to_be_bytes());
    Ok(seg)
}

/// Parses `segment` and verifies its checksum unless it is 0.
pub fn parse_segment(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> Result<(UdpHeader, &[u8])> {
    let header = UdpHeader::parse(segment)?;
    let seg = &segment[..usize::from(header.len)];
    if header.checksum != 0 && transport_checksum_v4(src, dst, IPPROTO_UDP, seg) != 0 {
        return Err(NetError::Checksum);
    }
    Ok((header, &seg[UDP_HLEN..]))
}

/// Received datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Sender.
    pub from: SocketAddrV4,
    /// Payload.
    pub data: Vec<u8>,
}

struct RxQueue {
    remote: Option<SocketAddrV4>,
    queue: VecDeque<Datagram>,
    bytes: usize,
    closed: bool,
}

/// Bound UDP endpoint with its receive queue.
pub struct UdpEndpoint {
    local: SocketAddrV4,
    reuse: bool,
    rcvbuf: usize,
    rx: Mutex<RxQueue>,
    ready: Condvar,
    drops: AtomicU64,
}

impl UdpEndpoint {
    fn new(local: SocketAddrV4, reuse: bool, rcvbuf: usize) -> Self {
        Self {
            local,
            reuse,
            rcvbuf,
            rx: Mutex::new(RxQueue { remote: None, queue: VecDeque::new(), bytes: 0, closed: false }),
            ready: Condvar::new(),
            drops: AtomicU64::new(0),
        }
    }

    /// Bound address.
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Connected peer.
    pub fn remote(&self) -> Option<SocketAddrV4> {
        self.rx.lock().remote
    }

    /// Restricts delivery to `peer`.
    pub fn set_remote(&self, peer: Option<SocketAddrV4>) {
        self.rx.lock().remote = peer;
    }

    /// Queues a datagram; false when the buffer is full, the sender is not
    /// the connected peer or the endpoint is closed.
    pub fn deliver(&self, from: SocketAddrV4, data: &[u8]) -> bool {
        let mut rx = self.rx.lock();
        if rx.closed || rx.remote.is_some_and(|peer| peer != from) || rx.bytes + data.len() > self.rcvbuf {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        rx.bytes += data.len();
        rx.queue.push_back(Datagram { from, data: data.to_vec() });
        self.ready.notify_one();
        true
    }

    /// Takes the oldest datagram or fails with `WouldBlock`.
    pub fn try_recv(&self) -> Result<Datagram> {
        let mut rx = self.rx.lock();
        Self::pop(&mut rx)
    }

    /// Waits up to `timeout` for a datagram.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Datagram> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock();
        loop {
            match Self::pop(&mut rx) {
                Err(NetError::WouldBlock) => {}
                other => return other,
            }
            if self.ready.wait_until(&mut rx, deadline).timed_out() {
                return Self::pop(&mut rx).map_err(|e| match e {
                    NetError::WouldBlock => NetError::TimedOut,
                    e => e,
                });
            }
        }
    }

    fn pop(rx: &mut RxQueue) -> Result<Datagram> {
        match rx.queue.pop_front() {
            Some(d) => {
                rx.bytes -= d.data.len();
                Ok(d)
            }
            None if rx.closed => Err(NetError::BadSocket),
            None => Err(NetError::WouldBlock),
        }
    }

    /// Queued datagram count.
    pub fn pending(&self) -> usize {
        self.rx.lock().queue.len()
    }

    /// Datagrams dropped at delivery.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Drops queued data and wakes every waiter.
    pub fn close(&self) {
        let mut rx = self.rx.lock();
        rx.closed = true;
        rx.queue.clear();
        rx.bytes = 0;
        self.ready.notify_all();
    }
}

/// Port table keyed by `(ip, port)`.
pub struct UdpTable {
    ports: RwLock<HashMap<(Ipv4Addr, u16), Arc<UdpEndpoint>>>,
    next_ephemeral: Mutex<u16>,
}

impl Default for UdpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTable {
    /// Empty table.
    pub fn new() -> Self {
        Self { ports: RwLock::new(HashMap::new()), next_ephemeral: Mutex::new(EPHEMERAL_FIRST) }
    }

    /// Binds `addr`; port 0 picks a free ephemeral port by linear scan.
    /// Overlapping bindings need `reuse` on both sides, and an exact
    /// duplicate is always `AddrInUse`.
    pub fn bind(&self, addr: SocketAddrV4, reuse: bool, rcvbuf: usize) -> Result<Arc<UdpEndpoint>> {
        let mut ports = self.ports.write();
        let port = if addr.port() == 0 {
            self.scan_ephemeral(&ports, *addr.ip())?
        } else {
            if Self::conflicts(&ports, *addr.ip(), addr.port(), reuse) {
                return Err(NetError::AddrInUse);
            }
            addr.port()
        };
        let local = SocketAddrV4::new(*addr.ip(), port);
        let ep = Arc::new(UdpEndpoint::new(local, reuse, rcvbuf));
        ports.insert((*addr.ip(), port), Arc::clone(&ep));
        log::debug!("udp: bound {}", local);
        Ok(ep)
    }

    fn conflicts(
        ports: &HashMap<(Ipv4Addr, u16), Arc<UdpEndpoint>>,
        ip: Ipv4Addr,
        port: u16,
        reuse: bool,
    ) -> bool {
        if ports.contains_key(&(ip, port)) {
            return true;
        }
        ports.iter().any(|((bound_ip, bound_port), ep)| {
            *bound_port == port
                && (bound_ip.is_unspecified() || ip.is_unspecified() || *bound_ip == ip)
                && !(reuse && ep.reuse)
        })
    }

    fn scan_ephemeral(
        &self,
        ports: &HashMap<(Ipv4Addr, u16), Arc<UdpEndpoint>>,
        ip: Ipv4Addr,
    ) -> Result<u16> {
        let mut cursor = self.next_ephemeral.lock();
        let span = u32::from(EPHEMERAL_LAST - EPHEMERAL_FIRST) + 1;
        for _ in 0..span {
            let candidate = *cursor;
            *cursor = if candidate == EPHEMERAL_LAST { EPHEMERAL_FIRST } else { candidate + 1 };
            if !Self::conflicts(ports, ip, candidate, false) {
                return Ok(candidate);
            }
        }
        Err(NetError::AddrNotAvail)
    }

    /// Removes a binding.
    pub fn unbind(&self, local: SocketAddrV4) {
        if let Some(ep) = self.ports.write().remove(&(*local.ip(), local.port())) {
            ep.close();
        }
    }

    /// Closes and removes every endpoint.
    pub fn close_all(&self) {
        for (_, ep) in self.ports.write().drain() {
            ep.close();
        }
    }

    /// Exact match first, then the wildcard binding of the port.
    pub fn lookup(&self, ip: Ipv4Addr, port: u16) -> Option<Arc<UdpEndpoint>> {
        let ports = self.ports.read();
        ports.get(&(ip, port)).or_else(|| ports.get(&(Ipv4Addr::UNSPECIFIED, port))).cloned()
    }

    /// Bound endpoint count.
    pub fn len(&self) -> usize {
        self.ports.read().len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.ports.read().is_empty()
    }
}
