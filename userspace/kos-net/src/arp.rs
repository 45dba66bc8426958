// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARP (RFC 826) codec and neighbour cache.
//!
//! The cache is a bounded list ordered by insertion; when full, the oldest
//! non-permanent entry is evicted.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use crate::error::{NetError, Result};
use crate::ethernet::{MacAddr, ETHERTYPE_IPV4};

/// Wire size of an Ethernet/IPv4 ARP packet.
pub const ARP_LEN: usize = 28;
/// Hardware type: Ethernet.
pub const HTYPE_ETHERNET: u16 = 1;
/// Default entry lifetime.
pub const ARP_TTL_NS: u64 = 300 * 1_000_000_000;
/// Default cache size.
pub const ARP_MAX_ENTRIES: usize = 256;

/// ARP opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOp {
    /// Who-has.
    Request,
    /// Is-at.
    Reply,
}

impl ArpOp {
    fn from_raw(op: u16) -> Option<Self> {
        match op {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            Self::Request => 1,
            Self::Reply => 2,
        }
    }
}

/// Decoded ARP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    /// Opcode.
    pub op: ArpOp,
    /// Sender hardware address.
    pub sha: MacAddr,
    /// Sender protocol address.
    pub spa: Ipv4Addr,
    /// Target hardware address.
    pub tha: MacAddr,
    /// Target protocol address.
    pub tpa: Ipv4Addr,
}

fn mac_at(b: &[u8], at: usize) -> MacAddr {
    let mut m = [0u8; 6];
    m.copy_from_slice(&b[at..at + 6]);
    MacAddr(m)
}

fn ip_at(b: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(b[at], b[at + 1], b[at + 2], b[at + 3])
}

impl ArpPacket {
    /// Who-has `tpa`, tell `spa`.
    pub fn request(sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Self {
        Self { op: ArpOp::Request, sha, spa, tha: MacAddr::ZERO, tpa }
    }

    /// Answer to `req` claiming `req.tpa` is at `mac`.
    pub fn reply_to(req: &ArpPacket, mac: MacAddr) -> Self {
        Self { op: ArpOp::Reply, sha: mac, spa: req.tpa, tha: req.sha, tpa: req.spa }
    }

    /// Announcement of our own address.
    pub fn gratuitous(sha: MacAddr, ip: Ipv4Addr) -> Self {
        Self { op: ArpOp::Request, sha, spa: ip, tha: MacAddr::ZERO, tpa: ip }
    }

    /// Sender IP equals target IP.
    pub fn is_gratuitous(&self) -> bool {
        self.spa == self.tpa
    }

    /// Parses an Ethernet/IPv4 ARP packet.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < ARP_LEN {
            return Err(NetError::Malformed("short arp packet"));
        }
        let htype = u16::from_be_bytes([b[0], b[1]]);
        let ptype = u16::from_be_bytes([b[2], b[3]]);
        if htype != HTYPE_ETHERNET || ptype != ETHERTYPE_IPV4 || b[4] != 6 || b[5] != 4 {
            return Err(NetError::Malformed("unsupported arp format"));
        }
        let op = ArpOp::from_raw(u16::from_be_bytes([b[6], b[7]])).ok_or(NetError::Malformed("arp opcode"))?;
        Ok(Self { op, sha: mac_at(b, 8), spa: ip_at(b, 14), tha: mac_at(b, 18), tpa: ip_at(b, 24) })
    }

    /// Wire bytes.
    pub fn to_bytes(&self) -> [u8; ARP_LEN] {
        let mut b = [0u8; ARP_LEN];
        b[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        b[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        b[4] = 6;
        b[5] = 4;
        b[6..8].copy_from_slice(&self.op.to_raw().to_be_bytes());
        b[8..14].copy_from_slice(&self.sha.0);
        b[14..18].copy_from_slice(&self.spa.octets());
        b[18..24].copy_from_slice(&self.tha.0);
        b[24..28].copy_from_slice(&self.tpa.octets());
        b
    }
}

/// One neighbour mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    /// Protocol address.
    pub ip: Ipv4Addr,
    /// Hardware address.
    pub mac: MacAddr,
    /// Last confirmation.
    pub updated_ns: u64,
    /// Never expires or gets evicted.
    pub permanent: bool,
}

/// Bounded neighbour cache.
#[derive(Debug)]
pub struct ArpCache {
    entries: VecDeque<ArpEntry>,
    max_entries: usize,
    ttl_ns: u64,
}

impl ArpCache {
    /// Cache holding at most `max_entries` entries that live `ttl_ns`.
    pub fn new(max_entries: usize, ttl_ns: u64) -> Self {
        Self { entries: VecDeque::new(), max_entries: max_entries.max(1), ttl_ns }
    }

    fn live(&self, e: &ArpEntry, now_ns: u64) -> bool {
        e.permanent || now_ns.saturating_sub(e.updated_ns) < self.ttl_ns
    }

    /// Valid mapping for `ip`, if any. An expired entry is removed.
    pub fn lookup(&mut self, ip: Ipv4Addr, now_ns: u64) -> Option<MacAddr> {
        let idx = self.entries.iter().position(|e| e.ip == ip)?;
        if self.live(&self.entries[idx], now_ns) {
            return Some(self.entries[idx].mac);
        }
        self.entries.remove(idx);
        None
    }

    /// True when `ip` has an entry, live or not.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|e| e.ip == ip)
    }

    /// Inserts or refreshes a mapping. Returns `NoBufs` when every slot is
    /// permanent.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now_ns: u64, permanent: bool) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            if entry.permanent && !permanent {
                return Ok(());
            }
            if entry.mac != mac {
                log::debug!("arp: {ip} moved {} -> {mac}", entry.mac);
            }
            entry.mac = mac;
            entry.updated_ns = now_ns;
            entry.permanent = permanent;
            return Ok(());
        }
        if self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.permanent)
                .min_by_key(|(_, e)| e.updated_ns)
                .map(|(i, _)| i)
                .ok_or(NetError::NoBufs)?;
            let evicted = self.entries.remove(oldest);
            log::trace!("arp: evicted {:?}", evicted.map(|e| e.ip));
        }
        self.entries.push_back(ArpEntry { ip, mac, updated_ns: now_ns, permanent });
        Ok(())
    }

    /// Refreshes an existing entry only (gratuitous ARP semantics).
    pub fn update_existing(&mut self, ip: Ipv4Addr, mac: MacAddr, now_ns: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.ip == ip && !e.permanent) {
            Some(entry) => {
                entry.mac = mac;
                entry.updated_ns = now_ns;
                true
            }
            None => false,
        }
    }

    /// Removes `ip`.
    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.ip != ip);
        before != self.entries.len()
    }

    /// Drops expired entries, returning how many went away.
    pub fn gc(&mut self, now_ns: u64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_ns;
        self.entries.retain(|e| e.permanent || now_ns.saturating_sub(e.updated_ns) < ttl);
        before - self.entries.len()
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<ArpEntry> {
        self.entries.iter().copied().collect()
    }
}
