// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Netfilter: five hook points, each a priority-ordered handler chain.
//! A chain stops at the first verdict other than `Accept`.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{NetError, Result};
use crate::ipv4::Ipv4Header;

/// Times a handler returning `Repeat` is re-invoked before the packet drops.
pub const NF_MAX_REPEAT: u32 = 3;
/// Packets held for userspace inspection before new ones are dropped.
pub const NF_QUEUE_LEN: usize = 256;

/// Hook points along the IPv4 path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Hook {
    /// Every inbound datagram, before routing.
    PreRouting = 0,
    /// Inbound datagrams addressed to us.
    LocalIn = 1,
    /// Datagrams routed through us.
    Forward = 2,
    /// Locally generated datagrams, before routing output.
    LocalOut = 3,
    /// Every outbound datagram, after routing.
    PostRouting = 4,
}

impl Hook {
    /// All hooks in path order.
    pub const ALL: [Hook; 5] = [Hook::PreRouting, Hook::LocalIn, Hook::Forward, Hook::LocalOut, Hook::PostRouting];
}

/// Handler decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// Continue with the next handler.
    Accept,
    /// Discard the packet.
    Drop,
    /// The handler took ownership; stop processing silently.
    Stolen,
    /// Park the packet on the netfilter queue.
    Queue,
    /// Call the same handler again.
    Repeat,
}

/// View of a datagram handed to hook handlers.
#[derive(Clone, Copy, Debug)]
pub struct NfPacket<'a> {
    /// Hook being run.
    pub hook: Hook,
    /// Receiving interface.
    pub in_if: Option<u32>,
    /// Sending interface.
    pub out_if: Option<u32>,
    /// IPv4 header.
    pub header: &'a Ipv4Header,
    /// Bytes after the IPv4 header.
    pub payload: &'a [u8],
    /// Stack time.
    pub now_ns: u64,
}

impl NfPacket<'_> {
    /// Source address.
    pub fn src(&self) -> Ipv4Addr {
        self.header.src
    }

    /// Destination address.
    pub fn dst(&self) -> Ipv4Addr {
        self.header.dst
    }
}

/// Hook handler.
pub type HookFn = Arc<dyn Fn(&NfPacket<'_>) -> Verdict + Send + Sync>;

/// Registration handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct HookEntry {
    id: HookId,
    name: &'static str,
    priority: i32,
    handler: HookFn,
}

/// Datagram parked by a `Queue` verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedPacket {
    /// Hook that queued it.
    pub hook: Hook,
    /// Full IPv4 datagram.
    pub datagram: Vec<u8>,
}

/// Per-hook counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HookStats {
    /// Packets that passed the chain.
    pub accepted: u64,
    /// Packets dropped by a handler or a full queue.
    pub dropped: u64,
    /// Packets stolen by a handler.
    pub stolen: u64,
    /// Packets queued.
    pub queued: u64,
}

#[derive(Default)]
struct AtomicHookStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    stolen: AtomicU64,
    queued: AtomicU64,
}

/// Hook registry.
pub struct Netfilter {
    chains: [RwLock<Vec<HookEntry>>; 5],
    stats: [AtomicHookStats; 5],
    queue: Mutex<VecDeque<QueuedPacket>>,
    next_id: AtomicU64,
}

impl Default for Netfilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Netfilter {
    /// Empty chains.
    pub fn new() -> Self {
        Self {
            chains: Default::default(),
            stats: Default::default(),
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds `handler` at `hook`; lower priorities run first, equal
    /// priorities in registration order.
    pub fn register(&self, hook: Hook, name: &'static str, priority: i32, handler: HookFn) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut chain = self.chains[hook as usize].write();
        let pos = chain.iter().position(|e| e.priority > priority).unwrap_or(chain.len());
        chain.insert(pos, HookEntry { id, name, priority, handler });
        log::debug!("netfilter: {} registered on {:?} at priority {}", name, hook, priority);
        id
    }

    /// Removes a handler from whichever hook holds it.
    pub fn unregister(&self, id: HookId) -> Result<()> {
        for chain in &self.chains {
            let mut chain = chain.write();
            if let Some(pos) = chain.iter().position(|e| e.id == id) {
                let entry = chain.remove(pos);
                log::debug!("netfilter: {} unregistered", entry.name);
                return Ok(());
            }
        }
        Err(NetError::NotFound)
    }

    /// Handler names at `hook` in run order.
    pub fn chain(&self, hook: Hook) -> Vec<&'static str> {
        self.chains[hook as usize].read().iter().map(|e| e.name).collect()
    }

    /// Runs the chain at `pkt.hook`. Returns `Accept`, `Drop`, `Stolen` or
    /// `Queue`; a queued packet has already been parked.
    pub fn run(&self, pkt: &NfPacket<'_>) -> Verdict {
        let handlers: Vec<HookFn> =
            self.chains[pkt.hook as usize].read().iter().map(|e| Arc::clone(&e.handler)).collect();
        let stats = &self.stats[pkt.hook as usize];
        for handler in handlers {
            let mut verdict = handler(pkt);
            let mut repeats = 0;
            while verdict == Verdict::Repeat {
                repeats += 1;
                if repeats > NF_MAX_REPEAT {
                    log::debug!("netfilter: repeat limit on {:?}, dropping", pkt.hook);
                    verdict = Verdict::Drop;
                    break;
                }
                verdict = handler(pkt);
            }
            match verdict {
                Verdict::Accept => continue,
                Verdict::Drop => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Drop;
                }
                Verdict::Stolen => {
                    stats.stolen.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Stolen;
                }
                Verdict::Queue | Verdict::Repeat => {
                    return self.enqueue(pkt);
                }
            }
        }
        stats.accepted.fetch_add(1, Ordering::Relaxed);
        Verdict::Accept
    }

    fn enqueue(&self, pkt: &NfPacket<'_>) -> Verdict {
        let stats = &self.stats[pkt.hook as usize];
        let mut queue = self.queue.lock();
        if queue.len() >= NF_QUEUE_LEN {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }
        let mut datagram = pkt.header.to_bytes();
        datagram.extend_from_slice(pkt.payload);
        queue.push_back(QueuedPacket { hook: pkt.hook, datagram });
        stats.queued.fetch_add(1, Ordering::Relaxed);
        Verdict::Queue
    }

    /// Takes the oldest queued packet.
    pub fn dequeue(&self) -> Option<QueuedPacket> {
        self.queue.lock().pop_front()
    }

    /// Counters for `hook`.
    pub fn stats(&self, hook: Hook) -> HookStats {
        let s = &self.stats[hook as usize];
        HookStats {
            accepted: s.accepted.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            stolen: s.stolen.load(Ordering::Relaxed),
            queued: s.queued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::IPPROTO_UDP;
    use std::sync::atomic::AtomicU32;

    fn header() -> Ipv4Header {
        Ipv4Header::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), IPPROTO_UDP, 4).expect("header")
    }

    fn pkt(h: &Ipv4Header, hook: Hook) -> NfPacket<'_> {
        NfPacket { hook, in_if: Some(1), out_if: None, header: h, payload: b"data", now_ns: 0 }
    }

    #[test]
    fn priority_order_with_stable_ties() {
        let nf = Netfilter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, prio) in [("b", 10), ("a", -5), ("c", 10)] {
            let order = Arc::clone(&order);
            nf.register(Hook::LocalIn, name, prio, Arc::new(move |_: &NfPacket<'_>| {
                order.lock().push(name);
                Verdict::Accept
            }));
        }
        assert_eq!(nf.chain(Hook::LocalIn), vec!["a", "b", "c"]);
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::LocalIn)), Verdict::Accept);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(nf.stats(Hook::LocalIn).accepted, 1);
    }

    #[test]
    fn first_non_accept_stops_the_chain() {
        let nf = Netfilter::new();
        let reached = Arc::new(AtomicU32::new(0));
        nf.register(Hook::PreRouting, "drop", 0, Arc::new(|_: &NfPacket<'_>| Verdict::Drop));
        let r = Arc::clone(&reached);
        nf.register(Hook::PreRouting, "after", 1, Arc::new(move |_: &NfPacket<'_>| {
            r.fetch_add(1, Ordering::Relaxed);
            Verdict::Accept
        }));
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::PreRouting)), Verdict::Drop);
        assert_eq!(reached.load(Ordering::Relaxed), 0);
        assert_eq!(nf.stats(Hook::PreRouting).dropped, 1);
    }

    #[test]
    fn repeat_is_bounded() {
        let nf = Netfilter::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        nf.register(Hook::Forward, "loop", 0, Arc::new(move |_: &NfPacket<'_>| {
            c.fetch_add(1, Ordering::Relaxed);
            Verdict::Repeat
        }));
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::Forward)), Verdict::Drop);
        assert_eq!(calls.load(Ordering::Relaxed), NF_MAX_REPEAT + 1);
    }

    #[test]
    fn repeat_then_accept_continues() {
        let nf = Netfilter::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        nf.register(Hook::Forward, "once", 0, Arc::new(move |_: &NfPacket<'_>| {
            if c.fetch_add(1, Ordering::Relaxed) == 0 {
                Verdict::Repeat
            } else {
                Verdict::Accept
            }
        }));
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::Forward)), Verdict::Accept);
    }

    #[test]
    fn queue_parks_the_datagram() {
        let nf = Netfilter::new();
        nf.register(Hook::LocalOut, "queue", 0, Arc::new(|_: &NfPacket<'_>| Verdict::Queue));
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::LocalOut)), Verdict::Queue);
        let q = nf.dequeue().expect("queued");
        assert_eq!(q.hook, Hook::LocalOut);
        assert_eq!(Ipv4Header::parse(&q.datagram).expect("parse").payload_len(), 4);
        assert!(nf.dequeue().is_none());
    }

    #[test]
    fn unregister_removes_handler() {
        let nf = Netfilter::new();
        let id = nf.register(Hook::PostRouting, "x", 0, Arc::new(|_: &NfPacket<'_>| Verdict::Drop));
        nf.unregister(id).expect("unregister");
        assert_eq!(nf.unregister(id), Err(NetError::NotFound));
        let h = header();
        assert_eq!(nf.run(&pkt(&h, Hook::PostRouting)), Verdict::Accept);
    }
}
