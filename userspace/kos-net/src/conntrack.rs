// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connection tracking: a 5-tuple flow table looked up in both directions,
//! with per-protocol and per-state idle timeouts.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ipv4::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::netfilter::{HookFn, NfPacket, Verdict};

const SEC: u64 = 1_000_000_000;
/// Idle timeout of an established TCP flow.
pub const TCP_ESTABLISHED_TIMEOUT_NS: u64 = 7200 * SEC;
/// Idle timeout of a TCP flow that has only seen a SYN.
pub const TCP_SYN_SENT_TIMEOUT_NS: u64 = 120 * SEC;
/// Idle timeout of a UDP flow.
pub const UDP_TIMEOUT_NS: u64 = 30 * SEC;
/// Idle timeout of an ICMP flow.
pub const ICMP_TIMEOUT_NS: u64 = 30 * SEC;
/// Default table capacity.
pub const CONNTRACK_MAX: usize = 65_536;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_ACK: u8 = 0x10;

/// Flow identity in the direction of the first packet seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Source port, or ICMP echo id.
    pub sport: u16,
    /// Destination port, or ICMP echo id.
    pub dport: u16,
    /// Protocol number.
    pub proto: u8,
}

impl FlowKey {
    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Self {
        Self { src: self.dst, dst: self.src, sport: self.dport, dport: self.sport, proto: self.proto }
    }

    /// Extracts the key from an IPv4 datagram; `None` for unsupported
    /// protocols, truncated headers and non-first fragments.
    pub fn from_packet(pkt: &NfPacket<'_>) -> Option<Self> {
        let h = pkt.header;
        if h.frag_offset != 0 {
            return None;
        }
        let p = pkt.payload;
        let (sport, dport) = match h.proto {
            IPPROTO_TCP | IPPROTO_UDP if p.len() >= 4 => {
                (u16::from_be_bytes([p[0], p[1]]), u16::from_be_bytes([p[2], p[3]]))
            }
            IPPROTO_ICMP if p.len() >= 6 => {
                let id = u16::from_be_bytes([p[4], p[5]]);
                (id, id)
            }
            _ => return None,
        };
        Some(Self { src: h.src, dst: h.dst, sport, dport, proto: h.proto })
    }
}

/// Tracked flow state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CtState {
    /// First packet seen, no reply yet.
    New,
    /// TCP SYN seen.
    SynSent,
    /// TCP SYN|ACK seen in reply.
    SynRecv,
    /// Traffic seen in both directions.
    Established,
    /// One side sent FIN.
    FinWait,
    /// Both sides sent FIN.
    TimeWait,
    /// Reset or fully closed.
    Close,
}

/// Snapshot of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CtEntry {
    /// Original-direction key.
    pub key: FlowKey,
    /// Current state.
    pub state: CtState,
    /// Creation time.
    pub created_ns: u64,
    /// Last packet time.
    pub last_seen_ns: u64,
    /// Packets in the original direction.
    pub packets_orig: u64,
    /// Packets in the reply direction.
    pub packets_reply: u64,
    /// Payload bytes in both directions.
    pub bytes: u64,
}

impl CtEntry {
    /// Idle timeout for the entry's protocol and state.
    pub fn timeout_ns(&self) -> u64 {
        match (self.key.proto, self.state) {
            (IPPROTO_TCP, CtState::Established) => TCP_ESTABLISHED_TIMEOUT_NS,
            (IPPROTO_TCP, CtState::Close) => 10 * SEC,
            (IPPROTO_TCP, _) => TCP_SYN_SENT_TIMEOUT_NS,
            (IPPROTO_ICMP, _) => ICMP_TIMEOUT_NS,
            _ => UDP_TIMEOUT_NS,
        }
    }

    fn advance(&mut self, reply: bool, tcp_flags: Option<u8>) {
        let Some(flags) = tcp_flags else {
            if reply && self.state == CtState::New {
                self.state = CtState::Established;
            }
            return;
        };
        if flags & TCP_RST != 0 {
            self.state = CtState::Close;
            return;
        }
        let syn = flags & TCP_SYN != 0;
        let ack = flags & TCP_ACK != 0;
        let fin = flags & TCP_FIN != 0;
        self.state = match self.state {
            CtState::New if syn && !ack => CtState::SynSent,
            CtState::SynSent if reply && syn && ack => CtState::SynRecv,
            CtState::SynSent | CtState::SynRecv if ack && !syn => CtState::Established,
            CtState::Established if fin => CtState::FinWait,
            CtState::FinWait if fin => CtState::TimeWait,
            state => state,
        };
    }
}

/// Table counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CtStats {
    /// Flows created.
    pub created: u64,
    /// Flows removed by the sweeper.
    pub expired: u64,
    /// New flows refused because the table was full.
    pub insert_failed: u64,
    /// Live flows.
    pub active: u64,
}

struct Table {
    flows: HashMap<FlowKey, CtEntry>,
    stats: CtStats,
}

/// Connection tracking table.
pub struct Conntrack {
    table: Mutex<Table>,
    max_entries: usize,
}

impl Default for Conntrack {
    fn default() -> Self {
        Self::new(CONNTRACK_MAX)
    }
}

impl Conntrack {
    /// Empty table holding at most `max_entries` flows.
    pub fn new(max_entries: usize) -> Self {
        Self { table: Mutex::new(Table { flows: HashMap::new(), stats: CtStats::default() }), max_entries }
    }

    /// Accounts one packet. Unknown flows are created in `New`; returns
    /// `Drop` only when a new flow does not fit.
    pub fn track(&self, pkt: &NfPacket<'_>) -> Verdict {
        let Some(key) = FlowKey::from_packet(pkt) else {
            return Verdict::Accept;
        };
        let tcp_flags = (key.proto == IPPROTO_TCP && pkt.payload.len() > 13).then(|| pkt.payload[13]);
        let len = pkt.payload.len() as u64;
        let mut table = self.table.lock();
        let (entry_key, reply) = if table.flows.contains_key(&key) {
            (key, false)
        } else if table.flows.contains_key(&key.reversed()) {
            (key.reversed(), true)
        } else {
            if table.flows.len() >= self.max_entries {
                table.stats.insert_failed += 1;
                log::debug!("conntrack: table full, dropping new flow {:?}", key);
                return Verdict::Drop;
            }
            let entry = CtEntry {
                key,
                state: CtState::New,
                created_ns: pkt.now_ns,
                last_seen_ns: pkt.now_ns,
                packets_orig: 0,
                packets_reply: 0,
                bytes: 0,
            };
            table.flows.insert(key, entry);
            table.stats.created += 1;
            (key, false)
        };
        if let Some(entry) = table.flows.get_mut(&entry_key) {
            entry.last_seen_ns = pkt.now_ns;
            entry.bytes += len;
            if reply {
                entry.packets_reply += 1;
            } else {
                entry.packets_orig += 1;
            }
            entry.advance(reply, tcp_flags);
        }
        Verdict::Accept
    }

    /// Hook handler wrapping `track`.
    pub fn hook(self: &Arc<Self>) -> HookFn {
        let ct = Arc::clone(self);
        Arc::new(move |pkt: &NfPacket<'_>| ct.track(pkt))
    }

    /// Looks the flow up in either direction.
    pub fn lookup(&self, key: &FlowKey) -> Option<CtEntry> {
        let table = self.table.lock();
        table.flows.get(key).or_else(|| table.flows.get(&key.reversed())).copied()
    }

    /// Removes flows idle longer than their timeout.
    pub fn sweep(&self, now_ns: u64) -> usize {
        let mut table = self.table.lock();
        let before = table.flows.len();
        table.flows.retain(|_, e| now_ns.saturating_sub(e.last_seen_ns) < e.timeout_ns());
        let expired = before - table.flows.len();
        table.stats.expired += expired as u64;
        expired
    }

    /// Live flow count.
    pub fn len(&self) -> usize {
        self.table.lock().flows.len()
    }

    /// True when no flow is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters.
    pub fn stats(&self) -> CtStats {
        let table = self.table.lock();
        CtStats { active: table.flows.len() as u64, ..table.stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::Ipv4Header;
    use crate::netfilter::Hook;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn tcp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, flags: u8) -> (Ipv4Header, Vec<u8>) {
        let mut seg = vec![0u8; 20];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        seg[13] = flags;
        (Ipv4Header::new(src, dst, IPPROTO_TCP, seg.len()).expect("header"), seg)
    }

    fn feed(ct: &Conntrack, (h, p): &(Ipv4Header, Vec<u8>), now_ns: u64) -> Verdict {
        ct.track(&NfPacket { hook: Hook::PreRouting, in_if: None, out_if: None, header: h, payload: p, now_ns })
    }

    fn key() -> FlowKey {
        FlowKey { src: A, dst: B, sport: 40000, dport: 80, proto: IPPROTO_TCP }
    }

    #[test]
    fn tcp_handshake_reaches_established() {
        let ct = Conntrack::default();
        feed(&ct, &tcp(A, B, 40000, 80, TCP_SYN), 0);
        assert_eq!(ct.lookup(&key()).expect("flow").state, CtState::SynSent);
        feed(&ct, &tcp(B, A, 80, 40000, TCP_SYN | TCP_ACK), 1);
        assert_eq!(ct.lookup(&key().reversed()).expect("flow").state, CtState::SynRecv);
        feed(&ct, &tcp(A, B, 40000, 80, TCP_ACK), 2);
        let e = ct.lookup(&key()).expect("flow");
        assert_eq!(e.state, CtState::Established);
        assert_eq!((e.packets_orig, e.packets_reply, e.bytes), (2, 1, 60));
        assert_eq!(ct.len(), 1);
    }

    #[test]
    fn fin_and_rst_transitions() {
        let ct = Conntrack::default();
        for (i, (s, d, sp, dp, f)) in [
            (A, B, 40000, 80, TCP_SYN),
            (B, A, 80, 40000, TCP_SYN | TCP_ACK),
            (A, B, 40000, 80, TCP_ACK),
            (A, B, 40000, 80, TCP_FIN | TCP_ACK),
        ]
        .into_iter()
        .enumerate()
        {
            feed(&ct, &tcp(s, d, sp, dp, f), i as u64);
        }
        assert_eq!(ct.lookup(&key()).expect("flow").state, CtState::FinWait);
        feed(&ct, &tcp(B, A, 80, 40000, TCP_FIN | TCP_ACK), 5);
        assert_eq!(ct.lookup(&key()).expect("flow").state, CtState::TimeWait);
        feed(&ct, &tcp(B, A, 80, 40000, TCP_RST), 6);
        assert_eq!(ct.lookup(&key()).expect("flow").state, CtState::Close);
    }

    #[test]
    fn per_protocol_timeouts() {
        let ct = Conntrack::default();
        let udp = Ipv4Header::new(A, B, IPPROTO_UDP, 8).expect("header");
        let udp_payload = [0x13, 0x88, 0x00, 0x35, 0, 8, 0, 0];
        feed(&ct, &(udp, udp_payload.to_vec()), 0);
        feed(&ct, &tcp(A, B, 40000, 80, TCP_SYN), 0);
        assert_eq!(ct.sweep(UDP_TIMEOUT_NS - 1), 0);
        assert_eq!(ct.sweep(UDP_TIMEOUT_NS), 1);
        assert_eq!(ct.sweep(TCP_SYN_SENT_TIMEOUT_NS), 1);
        assert!(ct.is_empty());
        assert_eq!(ct.stats().expired, 2);
    }

    #[test]
    fn established_tcp_lives_two_hours() {
        let ct = Conntrack::default();
        feed(&ct, &tcp(A, B, 40000, 80, TCP_SYN), 0);
        feed(&ct, &tcp(B, A, 80, 40000, TCP_SYN | TCP_ACK), 0);
        feed(&ct, &tcp(A, B, 40000, 80, TCP_ACK), 0);
        assert_eq!(ct.sweep(TCP_SYN_SENT_TIMEOUT_NS), 0);
        assert_eq!(ct.sweep(TCP_ESTABLISHED_TIMEOUT_NS), 1);
    }

    #[test]
    fn full_table_drops_new_flows() {
        let ct = Conntrack::new(1);
        assert_eq!(feed(&ct, &tcp(A, B, 1, 80, TCP_SYN), 0), Verdict::Accept);
        assert_eq!(feed(&ct, &tcp(A, B, 2, 80, TCP_SYN), 0), Verdict::Drop);
        assert_eq!(feed(&ct, &tcp(B, A, 80, 1, TCP_SYN | TCP_ACK), 0), Verdict::Accept);
        assert_eq!(ct.stats().insert_failed, 1);
    }
}
