// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPv4 reassembly using the RFC 815 hole-list algorithm.
//!
//! Each flow owns a 64 KiB buffer and a sorted list of inclusive byte
//! ranges not yet filled. The flow completes once the hole list is empty
//! and the final fragment (MF=0) has fixed the total length.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::{NetError, Result};
use crate::ipv4::Ipv4Header;

/// Reassembly timeout.
pub const IP_FRAG_TIMEOUT_NS: u64 = 30 * 1_000_000_000;
/// Largest reassembled payload offset.
pub const FRAG_MAX_OFFSET: usize = 65_534;
/// Concurrent flows before the oldest is evicted.
pub const FRAG_MAX_FLOWS: usize = 64;

/// Flow identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragKey {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// IP identification.
    pub id: u16,
    /// Upper-layer protocol.
    pub proto: u8,
}

impl FragKey {
    /// Key of the datagram `header` belongs to.
    pub fn of(header: &Ipv4Header) -> Self {
        Self { src: header.src, dst: header.dst, id: header.id, proto: header.proto }
    }
}

/// Unfilled inclusive byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hole {
    /// First missing byte.
    pub first: usize,
    /// Last missing byte.
    pub last: usize,
}

impl Hole {
    /// True when `pos` is inside the hole.
    pub fn covers(&self, pos: usize) -> bool {
        self.first <= pos && pos <= self.last
    }
}

/// Completed datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reassembled {
    /// Header of the first fragment with fragmentation fields cleared.
    pub header: Ipv4Header,
    /// Full payload.
    pub payload: Vec<u8>,
}

/// Reassembly counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    /// Fragments accepted into a flow.
    pub fragments: u64,
    /// Datagrams completed.
    pub reassembled: u64,
    /// Flows dropped by timeout.
    pub timeouts: u64,
    /// Flows dropped to make room.
    pub evicted: u64,
    /// Fragments rejected as malformed.
    pub malformed: u64,
}

struct Flow {
    buf: Vec<u8>,
    holes: Vec<Hole>,
    total_len: Option<usize>,
    header: Option<Ipv4Header>,
    started_ns: u64,
}

impl Flow {
    fn new(now_ns: u64) -> Self {
        Self {
            buf: vec![0u8; FRAG_MAX_OFFSET + 1],
            holes: vec![Hole { first: 0, last: FRAG_MAX_OFFSET }],
            total_len: None,
            header: None,
            started_ns: now_ns,
        }
    }

    fn fill(&mut self, first: usize, last: usize, more: bool) {
        let mut next = Vec::with_capacity(self.holes.len() + 1);
        for hole in self.holes.drain(..) {
            if first > hole.last || last < hole.first {
                next.push(hole);
                continue;
            }
            if first > hole.first {
                next.push(Hole { first: hole.first, last: first - 1 });
            }
            if last < hole.last && more {
                next.push(Hole { first: last + 1, last: hole.last });
            }
        }
        if !more {
            next.retain(|h| h.first <= last);
        }
        self.holes = next;
    }

    fn is_complete(&self) -> bool {
        self.holes.is_empty() && self.total_len.is_some()
    }
}

/// Table of in-progress flows.
pub struct Reassembler {
    flows: HashMap<FragKey, Flow>,
    timeout_ns: u64,
    max_flows: usize,
    stats: ReassemblyStats,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(IP_FRAG_TIMEOUT_NS, FRAG_MAX_FLOWS)
    }
}

impl Reassembler {
    /// Empty table.
    pub fn new(timeout_ns: u64, max_flows: usize) -> Self {
        Self { flows: HashMap::new(), timeout_ns, max_flows: max_flows.max(1), stats: ReassemblyStats::default() }
    }

    /// Adds one fragment. Returns the datagram once every byte is present.
    pub fn insert(&mut self, header: &Ipv4Header, payload: &[u8], now_ns: u64) -> Result<Option<Reassembled>> {
        let more = header.more_fragments();
        let first = usize::from(header.frag_offset) * 8;
        if payload.is_empty() {
            return self.reject("empty fragment");
        }
        let last = first + payload.len() - 1;
        if last > FRAG_MAX_OFFSET {
            return self.reject("fragment beyond 64 KiB");
        }
        if more && payload.len() % 8 != 0 {
            return self.reject("fragment length not a multiple of 8");
        }

        let key = FragKey::of(header);
        if !self.flows.contains_key(&key) && self.flows.len() >= self.max_flows {
            self.evict_oldest();
        }
        let flow = self.flows.entry(key).or_insert_with(|| Flow::new(now_ns));
        if let Some(total) = flow.total_len {
            if last >= total || (!more && last + 1 != total) {
                self.stats.malformed += 1;
                return Err(NetError::Malformed("fragment past datagram end"));
            }
        }

        flow.buf[first..=last].copy_from_slice(payload);
        flow.fill(first, last, more);
        if !more {
            flow.total_len = Some(last + 1);
        }
        if first == 0 {
            flow.header = Some(header.clone());
        }
        self.stats.fragments += 1;
        log::trace!("frag: {:?} [{}..={}] mf={} holes={}", key, first, last, more, flow.holes.len());

        if !flow.is_complete() {
            return Ok(None);
        }
        let Some(mut flow) = self.flows.remove(&key) else {
            return Ok(None);
        };
        let total = flow.total_len.unwrap_or(0);
        let mut head = flow.header.take().unwrap_or_else(|| header.clone());
        flow.buf.truncate(total);
        head.flags &= !crate::ipv4::FLAG_MF;
        head.frag_offset = 0;
        head.total_len = u16::try_from(head.header_len() + total).unwrap_or(u16::MAX);
        self.stats.reassembled += 1;
        Ok(Some(Reassembled { header: head, payload: flow.buf }))
    }

    /// Drops flows older than the timeout; returns how many were dropped.
    pub fn expire(&mut self, now_ns: u64) -> usize {
        let timeout = self.timeout_ns;
        let before = self.flows.len();
        self.flows.retain(|key, flow| {
            let keep = now_ns.saturating_sub(flow.started_ns) < timeout;
            if !keep {
                log::debug!("frag: flow {:?} timed out with {} holes", key, flow.holes.len());
            }
            keep
        });
        let dropped = before - self.flows.len();
        self.stats.timeouts += dropped as u64;
        dropped
    }

    /// Current holes of a flow, for inspection.
    pub fn holes(&self, key: &FragKey) -> Option<Vec<Hole>> {
        self.flows.get(key).map(|f| f.holes.clone())
    }

    /// Flows in progress.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// True when no flow is in progress.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Counters.
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    fn reject(&mut self, why: &'static str) -> Result<Option<Reassembled>> {
        self.stats.malformed += 1;
        Err(NetError::Malformed(why))
    }

    fn evict_oldest(&mut self) {
        let oldest = self.flows.iter().min_by_key(|(_, f)| f.started_ns).map(|(k, _)| *k);
        if let Some(key) = oldest {
            self.flows.remove(&key);
            self.stats.evicted += 1;
        }
    }
}
